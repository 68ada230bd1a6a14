//! # Spool Store
//!
//! Collection-scoped document storage used by the spool scheduler.
//!
//! Supports:
//! - File-per-record JSON (default, durable)
//! - In-memory (for testing)
//! - SQLite (feature `sqlite`)

pub mod backend;
pub mod file;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use backend::{Filter, MemoryBackend, StorageBackend, StorageError, StorageExt, ID_FIELD};
pub use file::FileBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteConfig};
