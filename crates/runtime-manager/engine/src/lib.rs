//! Per-Instance Runtime Manager
//!
//! The runtime manager decides which stateful session serves each unit of
//! work, and makes sure that session is used by one caller at a time. A
//! context (a process instance, a correlation key, or nothing) is bound to
//! a session the first time a unit of work starts in it; the binding is
//! kept in a [`Mapper`](runtime_manager_types::Mapper) so it survives
//! restarts, and removed when the unit of work completes and its
//! transaction commits.
//!
//! # Architecture
//!
//! - [`AffinityManager`]: checkout, dispose, signal, validate and close
//! - [`LockTable`]: one async mutex per context, dropped once uncontended
//! - [`CheckoutScope`]: per-request cache of checked-out engines, carrying
//!   the request's transaction
//! - [`SessionHandle`]: exclusive use of one session between checkout and
//!   dispose
//! - [`InMemoryMapper`] and, with the `sqlite` feature, `SqliteMapper`
//! - [`LocalTransaction`]: in-process transaction coordinator
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = AffinityManager::new(provider, Arc::new(InMemoryMapper::new()), ManagerConfig::default());
//! let scope = CheckoutScope::new();
//! manager.init(&scope).await?;
//!
//! let handle = manager.checkout(Context::instance(42), &scope).await?;
//! handle.signal_event("approved", &serde_json::json!({})).await?;
//! manager.dispose(handle).await?;
//! ```

#![deny(unsafe_code)]

pub mod config;
mod handle;
mod listener;
pub mod lock_table;
mod manager;
pub mod mapper;
mod scope;
pub mod transaction;

// Re-export main types
pub use config::{Initialization, ManagerConfig};
pub use handle::SessionHandle;
pub use lock_table::{LockGuard, LockTable};
pub use manager::AffinityManager;
pub use mapper::InMemoryMapper;
#[cfg(feature = "sqlite")]
pub use mapper::SqliteMapper;
pub use scope::CheckoutScope;
pub use transaction::LocalTransaction;

pub use runtime_manager_types as types;
