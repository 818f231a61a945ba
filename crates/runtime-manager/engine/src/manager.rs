//! The affinity manager: binds contexts to sessions and serializes their use

use crate::config::{Initialization, ManagerConfig};
use crate::handle::{EngineState, SessionHandle};
use crate::listener::MappingListener;
use crate::lock_table::{LockGuard, LockTable};
use crate::scope::CheckoutScope;
use futures::FutureExt;
use runtime_manager_types::{
    Context, InstanceId, ManagerError, ManagerId, ManagerResult, Mapper, Session, SessionId,
    SessionProvider,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct ManagerInner {
    pub(crate) id: ManagerId,
    pub(crate) config: ManagerConfig,
    pub(crate) provider: Arc<dyn SessionProvider>,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) locks: LockTable<Context>,
    closed: AtomicBool,
}

impl ManagerInner {
    /// Take the lock for `context`, bounded by `timeout` or the configured
    /// default
    pub(crate) async fn acquire_lock(
        &self,
        context: &Context,
        timeout: Option<Duration>,
    ) -> ManagerResult<LockGuard<Context>> {
        let guard = match timeout.or_else(|| self.config.lock_timeout()) {
            Some(limit) => self
                .locks
                .acquire_timeout(context.clone(), limit)
                .await
                .ok_or_else(|| ManagerError::LockTimeout {
                    context: context.clone(),
                    waited_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => self.locks.acquire(context.clone()).await,
        };
        debug!(manager = %self.id, context = %context, "Acquired context lock");
        Ok(guard)
    }

    fn ensure_open(&self) -> ManagerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ManagerError::ClosedManager(self.id.clone()));
        }
        Ok(())
    }
}

/// Binds each unit of work to one session and guarantees a single caller
/// per context at a time.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AffinityManager {
    inner: Arc<ManagerInner>,
}

impl AffinityManager {
    /// Create a manager with a freshly generated identifier
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        mapper: Arc<dyn Mapper>,
        config: ManagerConfig,
    ) -> Self {
        Self::with_id(ManagerId::generate(), provider, mapper, config)
    }

    /// Create a manager with a stable identifier. Bindings are scoped by it,
    /// so reuse the identifier across restarts to find earlier bindings.
    pub fn with_id(
        id: ManagerId,
        provider: Arc<dyn SessionProvider>,
        mapper: Arc<dyn Mapper>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                id,
                config,
                provider,
                mapper,
                locks: LockTable::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &ManagerId {
        &self.inner.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Contexts whose lock is currently held or waited for
    pub fn locked_contexts(&self) -> usize {
        self.inner.locks.len()
    }

    // ── Initialization ───────────────────────────────────────────────

    /// Prepare the manager after construction: bootstrap a throwaway
    /// session and resume sessions that still have bindings.
    pub async fn init(&self, scope: &CheckoutScope) -> ManagerResult<()> {
        self.inner.ensure_open()?;

        if self.inner.config.bootstrap_on_init {
            self.bootstrap(scope)
                .await
                .map_err(|e| ManagerError::Initialization(format!("bootstrap session: {e}")))?;
        }

        let mut resumed = 0;
        if self.inner.config.resume_sessions_on_init {
            resumed = self
                .resume_pending()
                .await
                .map_err(|e| ManagerError::Initialization(format!("resume sessions: {e}")))?;
        }

        info!(manager = %self.inner.id, resumed, "Runtime manager initialized");
        Ok(())
    }

    async fn bootstrap(&self, scope: &CheckoutScope) -> ManagerResult<()> {
        let session = self.inner.provider.new_session().await?;
        session.warm_up().await?;

        let provider = Arc::clone(&self.inner.provider);
        let teardown = async move {
            provider.on_dispose(session.id());
            session.destroy().await
        };

        match scope.active_transaction() {
            Some(transaction) => transaction.register_post_completion(Box::new(move |_| {
                async move {
                    if let Err(e) = teardown.await {
                        warn!(error = %e, "Failed to destroy bootstrap session");
                    }
                }
                .boxed()
            }))?,
            None => teardown.await?,
        }
        Ok(())
    }

    async fn resume_pending(&self) -> ManagerResult<usize> {
        let pending = self
            .inner
            .mapper
            .find_sessions_pending_init(&self.inner.id)
            .await?;
        for id in &pending {
            let session = self.inner.provider.find_by_id(*id).await?;
            session.warm_up().await?;
            session.dispose().await?;
            debug!(manager = %self.inner.id, session = %id, "Resumed session");
        }
        Ok(pending.len())
    }

    // ── Checkout / Dispose ───────────────────────────────────────────

    /// Get exclusive use of the session serving `context`.
    ///
    /// `Empty` always gets a new session. Any other context must already be
    /// bound, otherwise this fails with [`ManagerError::SessionNotFound`].
    /// Waits while another caller holds the context, up to the configured
    /// lock timeout.
    pub async fn checkout(
        &self,
        context: Context,
        scope: &CheckoutScope,
    ) -> ManagerResult<SessionHandle> {
        self.checkout_inner(context, scope, None).await
    }

    /// [`checkout`](Self::checkout) with an explicit bound on the lock wait
    pub async fn checkout_with_timeout(
        &self,
        context: Context,
        scope: &CheckoutScope,
        timeout: Duration,
    ) -> ManagerResult<SessionHandle> {
        self.checkout_inner(context, scope, Some(timeout)).await
    }

    async fn checkout_inner(
        &self,
        context: Context,
        scope: &CheckoutScope,
        timeout: Option<Duration>,
    ) -> ManagerResult<SessionHandle> {
        self.inner.ensure_open()?;

        if !context.is_empty() {
            if let Some(engine) = scope.find(&context) {
                engine.enter();
                debug!(manager = %self.inner.id, context = %context, "Reusing engine from scope");
                return Ok(SessionHandle::new(engine, self.clone()));
            }
        }

        // A correlation key shares its instance's session, so both lock and
        // cache under the instance
        let owner = self.owning_context(&context).await?;
        if owner != context {
            if let Some(engine) = scope.find(&owner) {
                engine.enter();
                debug!(manager = %self.inner.id, context = %context, owner = %owner, "Reusing engine from scope");
                return Ok(SessionHandle::new(engine, self.clone()));
            }
        }

        let guard = if owner.is_empty() || !self.inner.config.locking_enabled {
            None
        } else {
            Some(self.inner.acquire_lock(&owner, timeout).await?)
        };
        // Closed while waiting; the guard is released on return
        self.inner.ensure_open()?;

        let session_id = match &context {
            Context::Empty => None,
            bound => Some(
                self.inner
                    .mapper
                    .find_mapping(bound, &self.inner.id)
                    .await?
                    .ok_or_else(|| ManagerError::SessionNotFound(bound.clone()))?,
            ),
        };

        let engine = Arc::new(EngineState::new(
            context.clone(),
            session_id,
            guard,
            scope.downgrade(),
        ));
        if self.inner.config.initialization == Initialization::Eager {
            self.session_for(&engine).await?;
        }
        if !context.is_empty() {
            scope.insert(context.clone(), Arc::clone(&engine));
        }
        if owner != context {
            scope.insert(owner, Arc::clone(&engine));
        }

        debug!(
            manager = %self.inner.id,
            context = %context,
            session = ?session_id,
            "Checked out session"
        );
        Ok(SessionHandle::new(engine, self.clone()))
    }

    /// The context whose lock guards `context`: the instance a correlation
    /// key aliases, or the context itself
    async fn owning_context(&self, context: &Context) -> ManagerResult<Context> {
        if !matches!(context, Context::CorrelationKey(_)) {
            return Ok(context.clone());
        }
        let mapper = &self.inner.mapper;
        let session = mapper
            .find_mapping(context, &self.inner.id)
            .await?
            .ok_or_else(|| ManagerError::SessionNotFound(context.clone()))?;
        let owner = mapper.find_context_id(session, &self.inner.id).await?;
        Ok(owner
            .filter(|owner| matches!(owner, Context::InstanceId(_)))
            .unwrap_or_else(|| context.clone()))
    }

    /// Build the engine's session on first use and attach its listener
    pub(crate) async fn session_for(
        &self,
        engine: &Arc<EngineState>,
    ) -> ManagerResult<Arc<dyn Session>> {
        self.inner.ensure_open()?;
        let session = engine
            .session_cell()
            .get_or_try_init(|| async {
                let session = match engine.session_id() {
                    Some(id) => self.inner.provider.find_by_id(id).await?,
                    None => self.inner.provider.new_session().await?,
                };
                engine.set_session_id(session.id());
                session.set_listener(Arc::new(MappingListener::new(
                    &self.inner,
                    engine,
                    &session,
                )));
                Ok::<_, ManagerError>(session)
            })
            .await?;
        Ok(Arc::clone(session))
    }

    /// Give back a handle.
    ///
    /// Releases the context lock and drops the scope entry on every path.
    /// The session itself is released only when nothing still needs it:
    /// a completed unit of work already tore it down, and a mapper that
    /// holds the session keeps it loaded. Release failures are logged, not
    /// returned.
    pub async fn dispose(&self, handle: SessionHandle) -> ManagerResult<()> {
        let engine = handle.release();

        if self.is_closed() {
            engine.mark_disposed();
            self.detach(&engine);
            return Err(ManagerError::ClosedManager(self.inner.id.clone()));
        }

        let remaining = engine.exit();
        if remaining > 0 {
            debug!(context = %engine.context(), remaining, "Released nested handle");
            return Ok(());
        }
        if !engine.mark_disposed() {
            return Ok(());
        }

        let scope = engine.scope();
        self.release_session(&engine, scope.as_ref()).await;
        self.detach(&engine);
        Ok(())
    }

    fn detach(&self, engine: &Arc<EngineState>) {
        if let Some(scope) = engine.scope() {
            scope.remove_engine(engine);
        }
        let released = engine.release_locks();
        debug!(
            manager = %self.inner.id,
            context = %engine.context(),
            locks = released,
            "Disposed session handle"
        );
    }

    async fn release_session(&self, engine: &Arc<EngineState>, scope: Option<&CheckoutScope>) {
        let Some(session) = engine.session() else {
            return;
        };
        if engine.is_completed() {
            return;
        }

        match self
            .inner
            .mapper
            .holds_session(session.id(), &self.inner.id)
            .await
        {
            Ok(true) => {
                debug!(session = %session.id(), "Mapper keeps session loaded");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Could not check session bindings; keeping it loaded");
                return;
            }
        }

        if let Some(transaction) = scope.and_then(|scope| scope.active_transaction()) {
            let deferred = Arc::clone(&session);
            let registered = transaction.register_post_completion(Box::new(move |_| {
                async move {
                    if let Err(e) = deferred.dispose().await {
                        warn!(session = %deferred.id(), error = %e, "Failed to dispose session after transaction");
                    }
                }
                .boxed()
            }));
            match registered {
                Ok(()) => return,
                Err(e) => warn!(session = %session.id(), error = %e, "Disposing session immediately"),
            }
        }

        if let Err(e) = session.dispose().await {
            warn!(session = %session.id(), error = %e, "Failed to dispose session");
        }
    }

    // ── Signals ──────────────────────────────────────────────────────

    /// Broadcast an external event.
    ///
    /// Delivered, one at a time, to a fresh session (instances that start on
    /// this event), then to every context the mapper lists as waiting for it,
    /// then to instances active in `scope` not already reached. Returns the
    /// number of deliveries.
    pub async fn signal(
        &self,
        event_type: &str,
        payload: &Value,
        scope: &CheckoutScope,
    ) -> ManagerResult<usize> {
        self.inner.ensure_open()?;
        let mut delivered = 0;

        self.deliver(Context::Empty, None, event_type, payload, scope)
            .await?;
        delivered += 1;

        let waiting = self
            .inner
            .mapper
            .find_contexts_waiting_for_event(event_type, &self.inner.id)
            .await?;
        let mut reached = HashSet::new();
        for context in waiting {
            let instance = context.instance_id();
            match self
                .deliver(context.clone(), instance, event_type, payload, scope)
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    reached.insert(context);
                }
                Err(ManagerError::SessionNotFound(gone)) => {
                    debug!(context = %gone, event_type, "Waiting context no longer bound");
                }
                Err(e) => return Err(e),
            }
        }

        for (context, engine) in scope.active_engines() {
            let Some(instance) = context.instance_id() else {
                continue;
            };
            if reached.contains(&context) {
                continue;
            }
            let session = self.session_for(&engine).await?;
            session
                .signal_event(event_type, payload, Some(instance))
                .await?;
            delivered += 1;
        }

        debug!(manager = %self.inner.id, event_type, delivered, "Signal delivered");
        Ok(delivered)
    }

    async fn deliver(
        &self,
        context: Context,
        instance: Option<InstanceId>,
        event_type: &str,
        payload: &Value,
        scope: &CheckoutScope,
    ) -> ManagerResult<()> {
        let handle = self.checkout(context, scope).await?;
        let result = match handle.session().await {
            Ok(session) => session
                .signal_event(event_type, payload, instance)
                .await
                .map_err(ManagerError::from),
            Err(e) => Err(e),
        };
        self.dispose(handle).await?;
        result
    }

    // ── Validation / Shutdown ────────────────────────────────────────

    /// Check that `context` is bound to `session_id`.
    ///
    /// Returns `false` when the binding points elsewhere or is missing, and
    /// fails with [`ManagerError::InvalidBinding`] when the session already
    /// serves a different context.
    pub async fn validate(&self, session_id: SessionId, context: &Context) -> ManagerResult<bool> {
        self.inner.ensure_open()?;
        if context.is_empty() {
            return Ok(false);
        }

        let mapper = &self.inner.mapper;
        if mapper.find_mapping(context, &self.inner.id).await? == Some(session_id) {
            return Ok(true);
        }
        match mapper.find_context_id(session_id, &self.inner.id).await? {
            Some(claimed_by) if &claimed_by != context => Err(ManagerError::InvalidBinding {
                session_id,
                context: context.clone(),
                claimed_by,
            }),
            _ => Ok(false),
        }
    }

    /// Shut the manager down. Later calls fail with
    /// [`ManagerError::ClosedManager`]; handles still out can be disposed
    /// to release their locks.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            warn!(manager = %self.inner.id, "Runtime manager already closed");
            return;
        }
        self.inner.provider.close().await;
        info!(manager = %self.inner.id, "Runtime manager closed");
    }
}

impl std::fmt::Debug for AffinityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityManager")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .field("locked_contexts", &self.inner.locks.len())
            .finish()
    }
}
