//! The persistence port — the abstract contract any relational store must
//! satisfy to back the indexer.
//!
//! The port never retries; retry policy belongs to the orchestrator. Every
//! method fails with [`StorageError::Transient`] (retryable) or
//! [`StorageError::Fatal`] (abort).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::types::{BlockHeader, Cursor, StoredEvent};

/// Rows from the `query` escape hatch, one JSON object per row.
pub type QueryRows = Vec<Value>;

/// A scoped write transaction over the blocks/events/cursor tables.
///
/// Everything staged through a transaction becomes visible atomically on
/// [`commit`](StorageTxn::commit); dropping an uncommitted transaction
/// discards it.
#[async_trait]
pub trait StorageTxn: Send {
    /// Insert or replace the block row keyed by `block_number`.
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError>;

    /// Insert event rows. Conflicts on the composite key
    /// `(block_hash, tx_hash, event_index)` are ignored so re-processing a
    /// committed block after a restart stays idempotent.
    async fn insert_events(&mut self, events: &[StoredEvent]) -> Result<(), StorageError>;

    /// Write the singleton cursor row.
    async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StorageError>;

    /// Delete all blocks and events with `block_number >= block_number`.
    /// Idempotent. Returns the number of block rows removed.
    async fn delete_from(&mut self, block_number: u64) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// The storage adapter contract.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create or upgrade the schema. Called once during `start()`.
    async fn migrate(&self) -> Result<(), StorageError>;

    /// Open a write transaction.
    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError>;

    /// Read the committed cursor, if any.
    async fn get_cursor(&self) -> Result<Option<Cursor>, StorageError>;

    /// Read a committed block header by number.
    async fn block_at(&self, number: u64) -> Result<Option<BlockHeader>, StorageError>;

    /// Escape hatch for user handlers: run an arbitrary read/write statement
    /// on a dedicated connection, outside the indexer's own transactions.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryRows, StorageError>;
}
