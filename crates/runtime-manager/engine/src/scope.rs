//! Per-request cache of checked-out engines.
//!
//! A `CheckoutScope` is created for one logical request and passed to every
//! manager call made on its behalf. Re-checking out a context already held in
//! the scope returns the cached engine without touching the lock table. The
//! scope also carries the request's transaction, if it has one.

use crate::handle::EngineState;
use parking_lot::Mutex;
use runtime_manager_types::{Context, TransactionCoordinator};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::warn;

#[derive(Default)]
struct ScopeInner {
    engines: Mutex<HashMap<Context, Arc<EngineState>>>,
    transaction: Option<Arc<dyn TransactionCoordinator>>,
}

/// Cache of engines checked out by one request
#[derive(Clone, Default)]
pub struct CheckoutScope {
    inner: Arc<ScopeInner>,
}

impl CheckoutScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope whose session teardown follows `transaction`
    pub fn with_transaction(transaction: Arc<dyn TransactionCoordinator>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                engines: Mutex::new(HashMap::new()),
                transaction: Some(transaction),
            }),
        }
    }

    pub fn transaction(&self) -> Option<&Arc<dyn TransactionCoordinator>> {
        self.inner.transaction.as_ref()
    }

    /// The scope's transaction, if it can still take post-completion work
    pub fn active_transaction(&self) -> Option<&Arc<dyn TransactionCoordinator>> {
        self.transaction()
            .filter(|tx| tx.status().accepts_callbacks())
    }

    /// Contexts with a live engine in this scope
    pub fn active_contexts(&self) -> Vec<Context> {
        self.inner
            .engines
            .lock()
            .iter()
            .filter(|(_, engine)| !engine.is_disposed())
            .map(|(context, _)| context.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.engines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.engines.lock().is_empty()
    }

    /// Drop every cached engine and release the locks they hold.
    ///
    /// Call once the request is finished. Engines still in use at this point
    /// were never disposed; their sessions stay loaded.
    pub fn clear(&self) {
        let engines: Vec<Arc<EngineState>> = {
            let mut map = self.inner.engines.lock();
            map.drain().map(|(_, engine)| engine).collect()
        };
        for engine in engines {
            if engine.mark_disposed() {
                warn!(context = %engine.context(), "Clearing scope with an undisposed engine");
                engine.release_locks();
            }
        }
    }

    pub(crate) fn find(&self, context: &Context) -> Option<Arc<EngineState>> {
        let mut engines = self.inner.engines.lock();
        if engines.get(context)?.is_disposed() {
            engines.remove(context);
            return None;
        }
        engines.get(context).cloned()
    }

    pub(crate) fn insert(&self, context: Context, engine: Arc<EngineState>) {
        self.inner.engines.lock().insert(context, engine);
    }

    /// Remove every entry pointing at `engine`
    pub(crate) fn remove_engine(&self, engine: &Arc<EngineState>) {
        self.inner
            .engines
            .lock()
            .retain(|_, cached| !Arc::ptr_eq(cached, engine));
    }

    pub(crate) fn active_engines(&self) -> Vec<(Context, Arc<EngineState>)> {
        self.inner
            .engines
            .lock()
            .iter()
            .filter(|(_, engine)| !engine.is_disposed())
            .map(|(context, engine)| (context.clone(), Arc::clone(engine)))
            .collect()
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope(Arc::downgrade(&self.inner))
    }
}

/// Non-owning reference from an engine back to its scope
#[derive(Clone, Default)]
pub(crate) struct WeakScope(Weak<ScopeInner>);

impl WeakScope {
    pub(crate) fn upgrade(&self) -> Option<CheckoutScope> {
        self.0.upgrade().map(|inner| CheckoutScope { inner })
    }
}
