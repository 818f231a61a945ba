//! In-process transaction coordinator.
//!
//! Collects post-completion work while active and runs it, in registration
//! order, once the transaction is committed or rolled back. Useful on its own
//! for callers without an external transaction manager.

use parking_lot::Mutex;
use runtime_manager_types::{
    ManagerError, ManagerResult, PostCompletion, TransactionCoordinator, TransactionOutcome,
    TransactionStatus,
};
use std::sync::Arc;
use tracing::debug;

struct LocalState {
    status: TransactionStatus,
    callbacks: Vec<PostCompletion>,
}

/// A transaction owned by the calling code
pub struct LocalTransaction {
    state: Mutex<LocalState>,
}

impl LocalTransaction {
    /// Start an active transaction
    pub fn begin() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LocalState {
                status: TransactionStatus::Active,
                callbacks: Vec::new(),
            }),
        })
    }

    /// Commit and run the registered work. Returns how many callbacks ran.
    pub async fn commit(&self) -> ManagerResult<usize> {
        self.complete(TransactionOutcome::Committed).await
    }

    /// Roll back and run the registered work. Returns how many callbacks ran.
    pub async fn rollback(&self) -> ManagerResult<usize> {
        self.complete(TransactionOutcome::RolledBack).await
    }

    /// Callbacks waiting for completion
    pub fn pending(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    async fn complete(&self, outcome: TransactionOutcome) -> ManagerResult<usize> {
        let callbacks = {
            let mut state = self.state.lock();
            if state.status != TransactionStatus::Active {
                return Err(ManagerError::Transaction(format!(
                    "cannot complete a transaction in state {:?}",
                    state.status
                )));
            }
            state.status = match outcome {
                TransactionOutcome::Committed => TransactionStatus::Committed,
                TransactionOutcome::RolledBack => TransactionStatus::RolledBack,
            };
            std::mem::take(&mut state.callbacks)
        };

        let count = callbacks.len();
        debug!(outcome = ?outcome, callbacks = count, "Transaction completed");
        for callback in callbacks {
            callback(outcome).await;
        }
        Ok(count)
    }
}

impl TransactionCoordinator for LocalTransaction {
    fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    fn register_post_completion(&self, callback: PostCompletion) -> ManagerResult<()> {
        let mut state = self.state.lock();
        if !state.status.accepts_callbacks() {
            return Err(ManagerError::Transaction(format!(
                "cannot register work on a transaction in state {:?}",
                state.status
            )));
        }
        state.callbacks.push(callback);
        Ok(())
    }
}
