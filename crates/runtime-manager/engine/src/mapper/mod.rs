//! Binding store implementations

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryMapper;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMapper;
