//! Shared fixtures: an in-memory session provider whose sessions can be
//! driven through unit-of-work lifecycles from test code.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use runtime_manager::types::{
    Context, CorrelationKey, InstanceId, ManagerId, ManagerResult, Mapper, MapperResult,
    ProviderError, ProviderResult, Session, SessionId, SessionProvider, UnitOfWork,
    UnitOfWorkListener,
};
use runtime_manager::{AffinityManager, InMemoryMapper, ManagerConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Manager over a fresh provider and in-memory mapper, with init phases off
pub fn setup(
    config: ManagerConfig,
) -> (AffinityManager, Arc<InMemorySessionProvider>, Arc<InMemoryMapper>) {
    init_tracing();
    let provider = Arc::new(InMemorySessionProvider::new());
    let mapper = Arc::new(InMemoryMapper::new());
    let manager = AffinityManager::new(provider.clone(), mapper.clone(), config);
    (manager, provider, mapper)
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig::default().without_init()
}

// ── Deliveries ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub session: SessionId,
    pub event_type: String,
    pub instance: Option<InstanceId>,
}

#[derive(Default)]
struct Shared {
    deliveries: Mutex<Vec<Delivery>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dispose_failures: AtomicUsize,
    start_on_signal: Mutex<HashMap<String, UnitOfWork>>,
}

// ── Scripted Session ─────────────────────────────────────────────────

pub struct ScriptedSession {
    id: SessionId,
    registry: Weak<DashMap<SessionId, Arc<ScriptedSession>>>,
    shared: Arc<Shared>,
    listener: Mutex<Option<Arc<dyn UnitOfWorkListener>>>,
    loaded: AtomicBool,
    destroyed: AtomicBool,
    warm_ups: AtomicUsize,
    disposals: AtomicUsize,
}

impl ScriptedSession {
    fn listener(&self) -> Arc<dyn UnitOfWorkListener> {
        self.listener
            .lock()
            .clone()
            .expect("session has no listener attached")
    }

    pub async fn start_unit(&self, unit: UnitOfWork) -> ManagerResult<()> {
        self.listener().unit_started(&unit).await
    }

    pub async fn complete_unit(&self, unit: UnitOfWork) -> ManagerResult<()> {
        self.listener().unit_completed(&unit).await
    }

    pub async fn await_event(&self, instance: u64, event_type: &str) -> ManagerResult<()> {
        self.listener()
            .awaiting_event(InstanceId(instance), event_type)
            .await
    }

    pub async fn clear_event(&self, instance: u64, event_type: &str) -> ManagerResult<()> {
        self.listener()
            .event_cleared(InstanceId(instance), event_type)
            .await
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn warm_ups(&self) -> usize {
        self.warm_ups.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn set_listener(&self, listener: Arc<dyn UnitOfWorkListener>) {
        *self.listener.lock() = Some(listener);
    }

    async fn signal_event(
        &self,
        event_type: &str,
        _payload: &Value,
        instance: Option<InstanceId>,
    ) -> ProviderResult<()> {
        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;

        self.shared.deliveries.lock().push(Delivery {
            session: self.id,
            event_type: event_type.to_string(),
            instance,
        });

        let starts = match instance {
            None => self.shared.start_on_signal.lock().get(event_type).cloned(),
            Some(_) => None,
        };
        let result = match starts {
            Some(unit) => self
                .listener()
                .unit_started(&unit)
                .await
                .map_err(|e| ProviderError::Backend(e.to_string())),
            None => Ok(()),
        };

        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn warm_up(&self) -> ProviderResult<()> {
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> ProviderResult<()> {
        let injected = self
            .shared
            .dispose_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ProviderError::Backend("injected dispose failure".into()));
        }
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> ProviderResult<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        Ok(())
    }
}

// ── Provider ─────────────────────────────────────────────────────────

pub struct InMemorySessionProvider {
    sessions: Arc<DashMap<SessionId, Arc<ScriptedSession>>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    created: AtomicUsize,
    on_dispose: Mutex<Vec<SessionId>>,
    closed: AtomicBool,
}

impl InMemorySessionProvider {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            shared: Arc::new(Shared::default()),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            on_dispose: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The concrete session behind `id`, if it has not been destroyed
    pub fn session(&self, id: SessionId) -> Arc<ScriptedSession> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| panic!("{id} is not in the provider"))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed_ids(&self) -> Vec<SessionId> {
        self.on_dispose.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.shared.deliveries.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Make the next `count` session disposals fail
    pub fn fail_next_disposals(&self, count: usize) {
        self.shared.dispose_failures.store(count, Ordering::SeqCst);
    }

    /// Any session receiving an untargeted `event_type` starts `unit`
    pub fn start_on_signal(&self, event_type: &str, unit: UnitOfWork) {
        self.shared
            .start_on_signal
            .lock()
            .insert(event_type.to_string(), unit);
    }
}

#[async_trait]
impl SessionProvider for InMemorySessionProvider {
    async fn new_session(&self) -> ProviderResult<Arc<dyn Session>> {
        if self.is_closed() {
            return Err(ProviderError::Closed);
        }
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(ScriptedSession {
            id,
            registry: Arc::downgrade(&self.sessions),
            shared: Arc::clone(&self.shared),
            listener: Mutex::new(None),
            loaded: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            warm_ups: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
        });
        self.sessions.insert(id, Arc::clone(&session));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn find_by_id(&self, id: SessionId) -> ProviderResult<Arc<dyn Session>> {
        let session = self
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ProviderError::SessionNotFound(id))?;
        session.loaded.store(true, Ordering::SeqCst);
        Ok(session)
    }

    fn on_dispose(&self, id: SessionId) {
        self.on_dispose.lock().push(id);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Durable Mapper ───────────────────────────────────────────────────

/// In-memory bindings that behave like a persisted store: sessions are
/// reloadable by id, so the mapper never holds them.
#[derive(Default)]
pub struct DurableMapper(pub InMemoryMapper);

#[async_trait]
impl Mapper for DurableMapper {
    async fn find_mapping(
        &self,
        context: &Context,
        manager: &ManagerId,
    ) -> MapperResult<Option<SessionId>> {
        self.0.find_mapping(context, manager).await
    }

    async fn save_mapping(
        &self,
        context: &Context,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        self.0.save_mapping(context, session, manager).await
    }

    async fn save_alias(
        &self,
        key: &CorrelationKey,
        instance: InstanceId,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        self.0.save_alias(key, instance, manager).await
    }

    async fn remove_mapping(&self, context: &Context, manager: &ManagerId) -> MapperResult<()> {
        self.0.remove_mapping(context, manager).await
    }

    async fn find_contexts_waiting_for_event(
        &self,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<Vec<Context>> {
        self.0
            .find_contexts_waiting_for_event(event_type, manager)
            .await
    }

    async fn find_context_id(
        &self,
        session: SessionId,
        manager: &ManagerId,
    ) -> MapperResult<Option<Context>> {
        self.0.find_context_id(session, manager).await
    }

    async fn find_sessions_pending_init(
        &self,
        manager: &ManagerId,
    ) -> MapperResult<Vec<SessionId>> {
        self.0.find_sessions_pending_init(manager).await
    }

    async fn register_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        self.0
            .register_event_interest(context, event_type, manager)
            .await
    }

    async fn clear_event_interest(
        &self,
        context: &Context,
        event_type: &str,
        manager: &ManagerId,
    ) -> MapperResult<()> {
        self.0.clear_event_interest(context, event_type, manager).await
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Start `unit` on a fresh session and give the handle back; returns the
/// session serving it
pub async fn start_instance(
    manager: &AffinityManager,
    provider: &InMemorySessionProvider,
    unit: UnitOfWork,
) -> SessionId {
    let scope = runtime_manager::CheckoutScope::new();
    let handle = manager.checkout(Context::Empty, &scope).await.unwrap();
    let session = handle.session().await.unwrap();
    provider
        .session(session.id())
        .start_unit(unit)
        .await
        .unwrap();
    manager.dispose(handle).await.unwrap();
    session.id()
}
