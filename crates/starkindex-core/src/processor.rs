//! Block processor — turns accepted candidates into committed rows and
//! reorg directives into atomic rollbacks.

use std::sync::Arc;

use crate::error::IndexerError;
use crate::registry::AbiRegistry;
use crate::storage::Storage;
use crate::types::{normalize_felt, BlockCandidate, BlockHeader, Cursor, StoredEvent};

/// The result of rolling storage back to a fork point.
#[derive(Debug)]
pub struct RollbackOutcome {
    /// The first rolled-back block, read before deletion. `None` when the
    /// rollback found nothing to delete (idempotent replay).
    pub forked_block: Option<BlockHeader>,
    /// The cursor after rollback; `None` when every stored block was removed.
    pub new_cursor: Option<Cursor>,
    /// Number of block rows deleted.
    pub deleted: u64,
}

/// Persists blocks and their matched events through the storage port.
pub struct BlockProcessor {
    storage: Arc<dyn Storage>,
    registry: Arc<AbiRegistry>,
}

impl BlockProcessor {
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<AbiRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Filter a candidate's events down to the subscribed set and decode
    /// them. Decode failures keep the event with `decoded = None`.
    pub fn prepare(&self, candidate: &BlockCandidate) -> Vec<StoredEvent> {
        let mut prepared = Vec::new();
        for raw in &candidate.events {
            let Some(entry) = self.registry.lookup(raw) else {
                // Unsubscribed contracts are dropped before persistence.
                continue;
            };
            match entry.event.decode(raw) {
                Ok(fields) => prepared.push(StoredEvent {
                    raw: raw.clone(),
                    event_name: Some(entry.event.name.clone()),
                    decoded: Some(fields),
                }),
                Err(e) => {
                    tracing::warn!(
                        event = %entry.event.name,
                        block = raw.block_number,
                        tx = %raw.tx_hash,
                        event_index = raw.event_index,
                        error = %e,
                        "ABI decode failed; storing raw"
                    );
                    prepared.push(StoredEvent {
                        raw: raw.clone(),
                        event_name: Some(entry.event.name.clone()),
                        decoded: None,
                    });
                }
            }
        }
        prepared
    }

    /// Commit a block: one transaction covering the block row, its matched
    /// events, and the cursor. Returns the stored events for dispatch.
    pub async fn apply_block(
        &self,
        candidate: &BlockCandidate,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let events = self.prepare(candidate);
        let cursor = Cursor::new(
            candidate.header.number,
            normalize_felt(&candidate.header.hash),
        );

        let mut txn = self.storage.begin().await?;
        let staged = async {
            txn.upsert_block(&candidate.header).await?;
            txn.insert_events(&events).await?;
            txn.set_cursor(&cursor).await
        }
        .await;

        match staged {
            Ok(()) => {
                txn.commit().await?;
                tracing::debug!(
                    block = candidate.header.number,
                    events = events.len(),
                    "block committed"
                );
                Ok(events)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e.into())
            }
        }
    }

    /// Roll back to a fork point: one transaction deleting every row with
    /// `block_number >= from_block` and moving the cursor to the block below.
    pub async fn apply_reorg(&self, from_block: u64) -> Result<RollbackOutcome, IndexerError> {
        let forked_block = self.storage.block_at(from_block).await?;

        let new_cursor = if from_block == 0 {
            None
        } else {
            match self.storage.block_at(from_block - 1).await? {
                Some(prev) => Some(Cursor::new(prev.number, normalize_felt(&prev.hash))),
                // The block below the fork is outside the stored range; its
                // hash is still known from the forked block's parent link.
                None => forked_block
                    .as_ref()
                    .map(|f| Cursor::new(from_block - 1, normalize_felt(&f.parent_hash))),
            }
        };

        if forked_block.is_none() {
            // Nothing at or above the fork point: rollback already happened.
            let deleted = 0;
            return Ok(RollbackOutcome {
                forked_block,
                new_cursor: self.storage.get_cursor().await?,
                deleted,
            });
        }

        let mut txn = self.storage.begin().await?;
        let staged = async {
            let deleted = txn.delete_from(from_block).await?;
            if let Some(cursor) = &new_cursor {
                txn.set_cursor(cursor).await?;
            }
            Ok::<u64, crate::error::StorageError>(deleted)
        }
        .await;

        match staged {
            Ok(deleted) => {
                txn.commit().await?;
                tracing::warn!(
                    from_block,
                    deleted,
                    new_tip = new_cursor.as_ref().map(|c| c.block_number),
                    "rolled back to fork point"
                );
                Ok(RollbackOutcome {
                    forked_block,
                    new_cursor,
                    deleted,
                })
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e.into())
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
//
// The processor is exercised end-to-end (against real adapters) in the
// workspace integration tests; unit coverage here sticks to event
// preparation, which needs no storage.
