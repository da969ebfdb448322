//! # starkindex-storage
//!
//! Persistence adapters implementing the StarkIndex storage port:
//!
//! - [`MemoryStorage`] — RAM-backed, for tests and ephemeral runs
//! - [`SqliteStorage`] — single-file deployments and local development
//! - [`PostgresStorage`] — pooled production deployments
//!
//! All three honor the same contract: atomic `(block, events, cursor)`
//! commits, idempotent `delete_from`, and conflict-ignoring event inserts.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use postgres::{PostgresOptions, PostgresStorage};
pub use sqlite::SqliteStorage;
