//! Runtime Manager Domain Types
//!
//! A runtime manager binds **units of work** (running process instances,
//! business correlation keys, or nothing at all) to the **stateful sessions**
//! that execute them. This crate holds the vocabulary shared by the manager
//! and the collaborators it drives.
//!
//! # Key Concepts
//!
//! - **Context**: identifies a unit of work (`Empty`, `InstanceId`,
//!   `CorrelationKey`).
//! - **Binding**: the durable association of a context with a session,
//!   scoped to one manager.
//! - **Session**: an external stateful execution engine; opaque here except
//!   for the lifecycle surface the manager needs.
//! - **Mapper**: the store of bindings (in-memory or persisted).
//! - **SessionProvider**: creates, loads and releases sessions.
//! - **TransactionCoordinator**: lets completion work ride on the caller's
//!   transaction outcome.
//!
//! # Design Principles
//!
//! 1. A context is served by the same session for its whole lifetime.
//! 2. An instance-bound session never serves two instances.
//! 3. Failures are typed; consistency violations are surfaced, not swallowed.

#![deny(unsafe_code)]

mod context;
mod errors;
mod ids;
mod mapper;
mod session;
mod transaction;

pub use context::*;
pub use errors::*;
pub use ids::*;
pub use mapper::*;
pub use session::*;
pub use transaction::*;
