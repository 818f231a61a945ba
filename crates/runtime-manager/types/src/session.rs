//! Session contracts: the execution engine, its provider, and the
//! lifecycle callbacks a session reports through

use crate::{InstanceId, ManagerResult, ProviderResult, SessionId, UnitOfWork};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// One stateful execution session.
///
/// The workflow interpreter behind it is opaque to the manager; only the
/// surface needed to route signals and manage lifetime is exposed.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Install the lifecycle listener. A session keeps a single listener,
    /// so a later call replaces the earlier one.
    fn set_listener(&self, listener: Arc<dyn UnitOfWorkListener>);

    /// Deliver an external event, optionally targeted at one instance
    async fn signal_event(
        &self,
        event_type: &str,
        payload: &Value,
        instance: Option<InstanceId>,
    ) -> ProviderResult<()>;

    /// Bring the session's start listeners and timers up
    async fn warm_up(&self) -> ProviderResult<()> {
        Ok(())
    }

    /// Release in-memory resources. Durable state survives and the session
    /// can be loaded again by id.
    async fn dispose(&self) -> ProviderResult<()>;

    /// Delete the session permanently
    async fn destroy(&self) -> ProviderResult<()>;
}

/// Observer a session notifies as units of work move through it
#[async_trait]
pub trait UnitOfWorkListener: Send + Sync {
    /// A unit of work is about to start in the session
    async fn unit_started(&self, unit: &UnitOfWork) -> ManagerResult<()>;

    /// A unit of work finished in the session
    async fn unit_completed(&self, unit: &UnitOfWork) -> ManagerResult<()>;

    /// An instance started waiting for an external event
    async fn awaiting_event(&self, instance: InstanceId, event_type: &str) -> ManagerResult<()>;

    /// An instance no longer waits for an external event
    async fn event_cleared(&self, instance: InstanceId, event_type: &str) -> ManagerResult<()>;
}

/// Creates, loads and releases sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Create a brand-new session
    async fn new_session(&self) -> ProviderResult<Arc<dyn Session>>;

    /// Load a session by its persisted id
    async fn find_by_id(&self, id: SessionId) -> ProviderResult<Arc<dyn Session>>;

    /// The session's unit of work is done and the session is about to be
    /// destroyed; drop any bookkeeping kept for it
    fn on_dispose(&self, id: SessionId);

    /// Release provider-wide pooled resources
    async fn close(&self);
}
