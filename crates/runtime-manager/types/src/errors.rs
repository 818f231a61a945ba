//! Error types for the runtime manager layer

use crate::{Context, ManagerId, SessionId};

/// Errors surfaced to callers of the runtime manager
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Runtime manager {0} is already closed")]
    ClosedManager(ManagerId),

    #[error("No session found for context {0}")]
    SessionNotFound(Context),

    #[error("Session {session_id} is already used by another context ({claimed_by}), not {context}")]
    InvalidBinding {
        session_id: SessionId,
        context: Context,
        claimed_by: Context,
    },

    #[error("Timed out after {waited_ms}ms waiting for the lock on {context}")]
    LockTimeout { context: Context, waited_ms: u64 },

    #[error("Session provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Mapper error: {0}")]
    Mapper(#[from] MapperError),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// Result type alias for runtime manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors raised by a session provider or by a session itself
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session provider is closed")]
    Closed,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for provider and session operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by a binding store
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for mapper operations
pub type MapperResult<T> = Result<T, MapperError>;
