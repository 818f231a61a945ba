//! Transaction coordination contract

use crate::ManagerResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Status of the caller's transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    NoTransaction,
}

impl TransactionStatus {
    /// Only an active transaction can take post-completion work
    pub fn accepts_callbacks(&self) -> bool {
        matches!(self, TransactionStatus::Active)
    }
}

/// How a transaction ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// Work run once the transaction has completed
pub type PostCompletion = Box<dyn FnOnce(TransactionOutcome) -> BoxFuture<'static, ()> + Send>;

/// Ambient transaction a caller's work runs in
pub trait TransactionCoordinator: Send + Sync {
    fn status(&self) -> TransactionStatus;

    /// Register work to run after commit or rollback
    fn register_post_completion(&self, callback: PostCompletion) -> ManagerResult<()>;
}
