//! Lifecycle listener that keeps bindings and locks in step with the units of
//! work running in a session

use crate::handle::EngineState;
use crate::manager::ManagerInner;
use async_trait::async_trait;
use futures::FutureExt;
use runtime_manager_types::{
    Context, InstanceId, ManagerId, ManagerResult, Mapper, Session, SessionId, SessionProvider,
    TransactionOutcome, UnitOfWork, UnitOfWorkListener,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Attached to a session when a handle builds it.
///
/// Holds only weak references: the session owns the listener, and the
/// manager and engine must not be kept alive by it.
pub(crate) struct MappingListener {
    manager: Weak<ManagerInner>,
    engine: Weak<EngineState>,
    session: Weak<dyn Session>,
    session_id: SessionId,
}

impl MappingListener {
    pub(crate) fn new(
        manager: &Arc<ManagerInner>,
        engine: &Arc<EngineState>,
        session: &Arc<dyn Session>,
    ) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            engine: Arc::downgrade(engine),
            session: Arc::downgrade(session),
            session_id: session.id(),
        }
    }
}

#[async_trait]
impl UnitOfWorkListener for MappingListener {
    async fn unit_started(&self, unit: &UnitOfWork) -> ManagerResult<()> {
        let Some(manager) = self.manager.upgrade() else {
            debug!(session = %self.session_id, "Unit started after manager was dropped");
            return Ok(());
        };
        let context = Context::InstanceId(unit.instance_id);
        let engine = self.engine.upgrade();

        // Lock the new instance before its binding becomes visible
        if let Some(engine) = &engine {
            if manager.config.locking_enabled && !engine.holds_lock(&context) {
                let guard = manager.acquire_lock(&context, None).await?;
                engine.hold_lock(guard);
            }
        }

        manager
            .mapper
            .save_mapping(&context, self.session_id, &manager.id)
            .await?;
        if let Some(key) = &unit.correlation_key {
            manager
                .mapper
                .save_alias(key, unit.instance_id, &manager.id)
                .await?;
        }

        if let Some(engine) = engine {
            engine.set_context(context.clone());
            if let Some(scope) = engine.scope() {
                scope.insert(context.clone(), engine);
            }
        }

        info!(
            manager = %manager.id,
            session = %self.session_id,
            context = %context,
            "Unit of work started"
        );
        Ok(())
    }

    async fn unit_completed(&self, unit: &UnitOfWork) -> ManagerResult<()> {
        let Some(manager) = self.manager.upgrade() else {
            debug!(session = %self.session_id, "Unit completed after manager was dropped");
            return Ok(());
        };
        let engine = self.engine.upgrade();
        let scope = engine.as_ref().and_then(|engine| engine.scope());

        if let Some(engine) = &engine {
            engine.set_completed(true);
            if let Some(scope) = &scope {
                scope.remove_engine(engine);
            }
        }

        let teardown = Teardown {
            mapper: Arc::clone(&manager.mapper),
            provider: Arc::clone(&manager.provider),
            manager_id: manager.id.clone(),
            session: self.session.upgrade(),
            session_id: self.session_id,
            contexts: unit.contexts(),
        };

        match scope.as_ref().and_then(|scope| scope.active_transaction()) {
            Some(transaction) => {
                let engine = self.engine.clone();
                transaction.register_post_completion(Box::new(move |outcome| {
                    async move {
                        match outcome {
                            TransactionOutcome::Committed => {
                                if let Err(e) = teardown.run().await {
                                    warn!(
                                        session = %teardown.session_id,
                                        error = %e,
                                        "Failed to tear down completed session after commit"
                                    );
                                }
                            }
                            TransactionOutcome::RolledBack => {
                                // A handle disposed while completed skipped the release
                                let released = match engine.upgrade() {
                                    Some(engine) => {
                                        engine.set_completed(false);
                                        engine.is_disposed()
                                    }
                                    None => true,
                                };
                                debug!(
                                    session = %teardown.session_id,
                                    "Rollback keeps the session and its bindings"
                                );
                                if released {
                                    teardown.release().await;
                                }
                            }
                        }
                    }
                    .boxed()
                }))?;
                debug!(
                    manager = %manager.id,
                    instance = %unit.instance_id,
                    "Session teardown deferred to transaction completion"
                );
            }
            None => teardown.run().await?,
        }

        info!(
            manager = %manager.id,
            session = %self.session_id,
            instance = %unit.instance_id,
            "Unit of work completed"
        );
        Ok(())
    }

    async fn awaiting_event(&self, instance: InstanceId, event_type: &str) -> ManagerResult<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        manager
            .mapper
            .register_event_interest(&Context::InstanceId(instance), event_type, &manager.id)
            .await?;
        debug!(instance = %instance, event_type, "Registered event interest");
        Ok(())
    }

    async fn event_cleared(&self, instance: InstanceId, event_type: &str) -> ManagerResult<()> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        manager
            .mapper
            .clear_event_interest(&Context::InstanceId(instance), event_type, &manager.id)
            .await?;
        debug!(instance = %instance, event_type, "Cleared event interest");
        Ok(())
    }
}

/// Work done once a completed unit of work is final
struct Teardown {
    mapper: Arc<dyn Mapper>,
    provider: Arc<dyn SessionProvider>,
    manager_id: ManagerId,
    session: Option<Arc<dyn Session>>,
    session_id: SessionId,
    contexts: Vec<Context>,
}

impl Teardown {
    async fn run(&self) -> ManagerResult<()> {
        for context in &self.contexts {
            self.mapper.remove_mapping(context, &self.manager_id).await?;
        }
        self.provider.on_dispose(self.session_id);
        if let Some(session) = &self.session {
            session.destroy().await?;
        }
        debug!(session = %self.session_id, "Destroyed completed session");
        Ok(())
    }

    /// Dispose the session unless the mapper keeps it loaded
    async fn release(&self) {
        let Some(session) = &self.session else {
            return;
        };
        match self
            .mapper
            .holds_session(self.session_id, &self.manager_id)
            .await
        {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "Could not check session bindings; keeping it loaded");
                return;
            }
        }
        if let Err(e) = session.dispose().await {
            warn!(session = %self.session_id, error = %e, "Failed to dispose session after rollback");
        }
    }
}
