//! Binding store contract

use crate::{Context, CorrelationKey, InstanceId, ManagerId, MapperResult, SessionId};
use async_trait::async_trait;

/// Durable store of `Context → SessionId` bindings.
///
/// Every operation is scoped by the owning manager's identifier. For a given
/// manager there is at most one binding per context, and each session is
/// claimed by exactly one context. A correlation key bound with
/// [`save_alias`](Mapper::save_alias) shares its instance's session without
/// claiming it.
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Session bound to `context`, if any
    async fn find_mapping(
        &self,
        context: &Context,
        manager: &ManagerId,
    ) -> MapperResult<Option<SessionId>>;

    /// Bind `context` to `session`, claiming the session for it.
    ///
    /// Fails with `Conflict` when another context already claims the
    /// session. The one exception is an instance starting on a session
    /// claimed by a correlation key: the instance takes the claim over and
    /// the key stays bound as its alias.
    async fn save_mapping(
        &self,
        context: &Context,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<()>;

    /// Bind `key` to the session already serving `instance`.
    ///
    /// Fails with `InvalidInput` when the instance is unbound and with
    /// `Conflict` when the key is bound to a different session.
    async fn save_alias(
        &self,
        key: &CorrelationKey,
        instance: InstanceId,
        manager: &ManagerId,
    ) -> MapperResult<()>;

    /// Drop the binding of `context` together with its event interest
    async fn remove_mapping(&self, context: &Context, manager: &ManagerId) -> MapperResult<()>;

    /// Contexts that registered interest in `event_type`.
    ///
    /// Finite and restartable: calling again re-runs the lookup.
    async fn find_contexts_waiting_for_event(
        &self,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<Vec<Context>>;

    /// Reverse lookup: the context claiming a session
    async fn find_context_id(
        &self,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<Option<Context>>;

    /// Sessions with outstanding bindings, resumed when a manager starts
    async fn find_sessions_pending_init(&self, manager: &ManagerId)
        -> MapperResult<Vec<SessionId>>;

    /// Record that `context` waits for `event_type`
    async fn register_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()>;

    /// Forget that `context` waits for `event_type`
    async fn clear_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()>;

    /// Whether the store itself keeps `session` alive.
    ///
    /// A store that only lives in memory cannot reload a released session,
    /// so it reports `true` while any binding still references it and the
    /// manager then keeps the session open on dispose.
    async fn holds_session(&self, _session: SessionId, _manager: &ManagerId) -> MapperResult<bool> {
        Ok(false)
    }
}
