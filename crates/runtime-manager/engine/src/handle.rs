//! Checked-out engines and the handles callers hold on them

use crate::lock_table::LockGuard;
use crate::manager::AffinityManager;
use crate::scope::{CheckoutScope, WeakScope};
use parking_lot::Mutex;
use runtime_manager_types::{Context, ManagerResult, Session, SessionId};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

// ── Engine State ─────────────────────────────────────────────────────

/// State shared by every handle of one checkout and by the session's
/// lifecycle listener
pub(crate) struct EngineState {
    context: Mutex<Context>,
    session_id: Mutex<Option<SessionId>>,
    session: OnceCell<Arc<dyn Session>>,
    locks: Mutex<Vec<LockGuard<Context>>>,
    disposed: AtomicBool,
    completed: AtomicBool,
    depth: AtomicUsize,
    scope: WeakScope,
}

impl EngineState {
    pub(crate) fn new(
        context: Context,
        session_id: Option<SessionId>,
        lock: Option<LockGuard<Context>>,
        scope: WeakScope,
    ) -> Self {
        Self {
            context: Mutex::new(context),
            session_id: Mutex::new(session_id),
            session: OnceCell::new(),
            locks: Mutex::new(lock.into_iter().collect()),
            disposed: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            depth: AtomicUsize::new(1),
            scope,
        }
    }

    pub(crate) fn context(&self) -> Context {
        self.context.lock().clone()
    }

    /// Returns the previous context
    pub(crate) fn set_context(&self, context: Context) -> Context {
        std::mem::replace(&mut *self.context.lock(), context)
    }

    pub(crate) fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock()
    }

    pub(crate) fn set_session_id(&self, id: SessionId) {
        *self.session_id.lock() = Some(id);
    }

    /// The session, if it has been built
    pub(crate) fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.get().cloned()
    }

    pub(crate) fn session_cell(&self) -> &OnceCell<Arc<dyn Session>> {
        &self.session
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that actually disposed the engine
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn set_completed(&self, completed: bool) {
        self.completed.store(completed, Ordering::Release);
    }

    /// One more handle shares this engine
    pub(crate) fn enter(&self) {
        self.depth.fetch_add(1, Ordering::AcqRel);
    }

    /// One handle is done; returns how many remain
    pub(crate) fn exit(&self) -> usize {
        let previous = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                Some(depth.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn hold_lock(&self, guard: LockGuard<Context>) {
        self.locks.lock().push(guard);
    }

    pub(crate) fn holds_lock(&self, context: &Context) -> bool {
        self.locks.lock().iter().any(|guard| guard.key() == context)
    }

    /// Release every context lock this engine holds; returns how many
    pub(crate) fn release_locks(&self) -> usize {
        let guards = std::mem::take(&mut *self.locks.lock());
        guards.len()
    }

    pub(crate) fn scope(&self) -> Option<CheckoutScope> {
        self.scope.upgrade()
    }
}

// ── Session Handle ───────────────────────────────────────────────────

/// Exclusive use of one session for the duration of a logical operation.
///
/// Obtained from [`AffinityManager::checkout`] and given back with
/// [`AffinityManager::dispose`]. A handle dropped without dispose still
/// releases its context lock, but the session is left loaded.
pub struct SessionHandle {
    engine: Arc<EngineState>,
    manager: AffinityManager,
    released: bool,
}

impl SessionHandle {
    pub(crate) fn new(engine: Arc<EngineState>, manager: AffinityManager) -> Self {
        Self {
            engine,
            manager,
            released: false,
        }
    }

    /// The context this handle currently serves. Starting a unit of work on
    /// an `Empty` checkout moves it to the new instance.
    pub fn context(&self) -> Context {
        self.engine.context()
    }

    /// Id of the underlying session; `None` until a lazily built session is
    /// first used
    pub fn session_id(&self) -> Option<SessionId> {
        self.engine.session_id()
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_disposed()
    }

    /// Whether the unit of work served by this handle has completed
    pub fn is_completed(&self) -> bool {
        self.engine.is_completed()
    }

    /// The session, building it first if initialization is lazy
    pub async fn session(&self) -> ManagerResult<Arc<dyn Session>> {
        self.manager.session_for(&self.engine).await
    }

    /// Deliver an event to this handle's session, targeted at its instance
    /// when it serves one
    pub async fn signal_event(&self, event_type: &str, payload: &Value) -> ManagerResult<()> {
        let session = self.session().await?;
        session
            .signal_event(event_type, payload, self.context().instance_id())
            .await?;
        Ok(())
    }

    /// Hand the engine over to dispose
    pub(crate) fn release(mut self) -> Arc<EngineState> {
        self.released = true;
        Arc::clone(&self.engine)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            manager = %self.manager.id(),
            context = %self.engine.context(),
            "Session handle dropped without dispose"
        );
        if self.engine.exit() == 0 && self.engine.mark_disposed() {
            if let Some(scope) = self.engine.scope() {
                scope.remove_engine(&self.engine);
            }
            self.engine.release_locks();
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("context", &self.engine.context())
            .field("session_id", &self.engine.session_id())
            .field("disposed", &self.engine.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_table::LockTable;

    #[tokio::test]
    async fn test_release_locks_frees_table() {
        let table = LockTable::new();
        let guard = table.acquire(Context::instance(1)).await;
        let engine = EngineState::new(
            Context::instance(1),
            Some(SessionId(1)),
            Some(guard),
            WeakScope::default(),
        );
        engine.hold_lock(table.acquire(Context::instance(2)).await);

        assert!(engine.holds_lock(&Context::instance(2)));
        assert_eq!(table.len(), 2);
        assert_eq!(engine.release_locks(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_depth_counts_nested_handles() {
        let engine = EngineState::new(Context::instance(1), None, None, WeakScope::default());
        engine.enter();
        assert_eq!(engine.exit(), 1);
        assert_eq!(engine.exit(), 0);
        assert_eq!(engine.exit(), 0);
    }

    #[test]
    fn test_mark_disposed_once() {
        let engine = EngineState::new(Context::Empty, None, None, WeakScope::default());
        assert!(engine.mark_disposed());
        assert!(!engine.mark_disposed());
        assert!(engine.is_disposed());
    }

    #[test]
    fn test_set_context_returns_previous() {
        let engine = EngineState::new(Context::Empty, None, None, WeakScope::default());
        let previous = engine.set_context(Context::instance(8));
        assert_eq!(previous, Context::Empty);
        assert_eq!(engine.context(), Context::instance(8));
    }
}
