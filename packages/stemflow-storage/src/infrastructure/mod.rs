//! Infrastructure layer - Storage adapters
//!
//! - `memory`: DashMap-backed adapter
//! - `sqlite`: SQLite adapter (feature `sqlite`)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryJobStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
