//! In-memory storage adapter.
//!
//! Backs tests and short-lived indexers that don't need persistence.
//! Transactions stage their writes and apply them atomically under one lock
//! on commit; a dropped transaction leaves no trace. Commit failures can be
//! injected to exercise the orchestrator's retry and crash-recovery paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use starkindex_core::error::StorageError;
use starkindex_core::storage::{QueryRows, Storage, StorageTxn};
use starkindex_core::types::{normalize_felt, BlockHeader, Cursor, StoredEvent};

type EventKey = (String, String, u32); // (block_hash, tx_hash, event_index)

#[derive(Default)]
struct State {
    blocks: BTreeMap<u64, BlockHeader>,
    events: Vec<StoredEvent>,
    event_keys: HashSet<EventKey>,
    cursor: Option<Cursor>,
}

#[derive(Default)]
struct FailPlan {
    transient_commits: AtomicU32,
    fatal_commit: AtomicBool,
    commits_seen: AtomicU32,
    crash_at: AtomicU32, // 0 = disabled
}

/// In-memory implementation of the storage port.
#[derive(Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    fail: Arc<FailPlan>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient error.
    pub fn fail_commits(&self, n: u32) {
        self.fail.transient_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next commit fail fatally, discarding the staged writes —
    /// the closest in-process stand-in for a crash mid-commit.
    pub fn crash_next_commit(&self) {
        self.fail.fatal_commit.store(true, Ordering::SeqCst);
    }

    /// Crash on the `n`-th commit (1-based) counted from now.
    pub fn crash_on_commit(&self, n: u32) {
        self.fail.commits_seen.store(0, Ordering::SeqCst);
        self.fail.crash_at.store(n, Ordering::SeqCst);
    }

    // ── Test accessors ──────────────────────────────────────────────────────

    pub fn block_count(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.state.lock().unwrap().cursor.clone()
    }

    pub fn block_numbers(&self) -> Vec<u64> {
        self.state.lock().unwrap().blocks.keys().copied().collect()
    }
}

enum Op {
    UpsertBlock(BlockHeader),
    InsertEvents(Vec<StoredEvent>),
    SetCursor(Cursor),
    DeleteFrom(u64),
}

struct MemoryTxn {
    state: Arc<Mutex<State>>,
    fail: Arc<FailPlan>,
    ops: Vec<Op>,
}

#[async_trait]
impl StorageTxn for MemoryTxn {
    async fn upsert_block(&mut self, block: &BlockHeader) -> Result<(), StorageError> {
        self.ops.push(Op::UpsertBlock(block.clone()));
        Ok(())
    }

    async fn insert_events(&mut self, events: &[StoredEvent]) -> Result<(), StorageError> {
        self.ops.push(Op::InsertEvents(events.to_vec()));
        Ok(())
    }

    async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StorageError> {
        self.ops.push(Op::SetCursor(cursor.clone()));
        Ok(())
    }

    async fn delete_from(&mut self, block_number: u64) -> Result<u64, StorageError> {
        let count = {
            let state = self.state.lock().unwrap();
            state.blocks.range(block_number..).count() as u64
        };
        self.ops.push(Op::DeleteFrom(block_number));
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        if self.fail.fatal_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Fatal("injected commit failure".into()));
        }
        let crash_at = self.fail.crash_at.load(Ordering::SeqCst);
        if crash_at > 0 {
            let seen = self.fail.commits_seen.fetch_add(1, Ordering::SeqCst) + 1;
            if seen == crash_at {
                self.fail.crash_at.store(0, Ordering::SeqCst);
                return Err(StorageError::Fatal("injected commit failure".into()));
            }
        }
        let remaining = self.fail.transient_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail
                .transient_commits
                .store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Transient("injected commit failure".into()));
        }

        let mut this = self;
        let ops = std::mem::take(&mut this.ops);
        let mut state = this.state.lock().unwrap();
        for op in ops {
            match op {
                Op::UpsertBlock(block) => {
                    state.blocks.insert(block.number, block);
                }
                Op::InsertEvents(events) => {
                    for event in events {
                        let key = (
                            normalize_felt(&event.raw.block_hash),
                            normalize_felt(&event.raw.tx_hash),
                            event.raw.event_index,
                        );
                        // Composite primary key: replays are ignored.
                        if state.event_keys.insert(key) {
                            state.events.push(event);
                        }
                    }
                }
                Op::SetCursor(cursor) => {
                    state.cursor = Some(cursor);
                }
                Op::DeleteFrom(from) => {
                    let doomed: Vec<u64> = state.blocks.range(from..).map(|(n, _)| *n).collect();
                    for number in doomed {
                        state.blocks.remove(&number);
                    }
                    let mut keys = std::mem::take(&mut state.event_keys);
                    state.events.retain(|e| {
                        let keep = e.raw.block_number < from;
                        if !keep {
                            keys.remove(&(
                                normalize_felt(&e.raw.block_hash),
                                normalize_felt(&e.raw.tx_hash),
                                e.raw.event_index,
                            ));
                        }
                        keep
                    });
                    state.event_keys = keys;
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(()) // staged ops are simply dropped
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn migrate(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTxn>, StorageError> {
        Ok(Box::new(MemoryTxn {
            state: Arc::clone(&self.state),
            fail: Arc::clone(&self.fail),
            ops: Vec::new(),
        }))
    }

    async fn get_cursor(&self) -> Result<Option<Cursor>, StorageError> {
        Ok(self.state.lock().unwrap().cursor.clone())
    }

    async fn block_at(&self, number: u64) -> Result<Option<BlockHeader>, StorageError> {
        Ok(self.state.lock().unwrap().blocks.get(&number).cloned())
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<QueryRows, StorageError> {
        Err(StorageError::Fatal(
            "the in-memory adapter does not speak SQL; use SqliteStorage or PostgresStorage".into(),
        ))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use starkindex_core::types::{BlockStatus, RawEvent};

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: format!("0x{number:x}"),
            parent_hash: format!("0x{:x}", number.wrapping_sub(1)),
            timestamp: number,
            status: BlockStatus::Accepted,
        }
    }

    fn event(number: u64, event_index: u32) -> StoredEvent {
        StoredEvent {
            raw: RawEvent {
                block_hash: format!("0x{number:x}"),
                block_number: number,
                tx_hash: "0xt".into(),
                event_index,
                from_address: "0xaaa".into(),
                keys: vec!["0x1".into()],
                data: vec![],
            },
            event_name: None,
            decoded: None,
        }
    }

    async fn commit_block(store: &MemoryStorage, number: u64, events: &[StoredEvent]) {
        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(number)).await.unwrap();
        txn.insert_events(events).await.unwrap();
        txn.set_cursor(&Cursor::new(number, format!("0x{number:x}")))
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commit_applies_atomically() {
        let store = MemoryStorage::new();
        commit_block(&store, 100, &[event(100, 0), event(100, 1)]).await;

        assert_eq!(store.block_count(), 1);
        assert_eq!(store.event_count(), 2);
        assert_eq!(store.cursor().unwrap().block_number, 100);
    }

    #[tokio::test]
    async fn dropped_txn_leaves_no_trace() {
        let store = MemoryStorage::new();
        {
            let mut txn = store.begin().await.unwrap();
            txn.upsert_block(&header(100)).await.unwrap();
            txn.insert_events(&[event(100, 0)]).await.unwrap();
            // dropped without commit
        }
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.event_count(), 0);
        assert!(store.cursor().is_none());
    }

    #[tokio::test]
    async fn replayed_events_are_ignored() {
        let store = MemoryStorage::new();
        commit_block(&store, 100, &[event(100, 0)]).await;
        commit_block(&store, 100, &[event(100, 0)]).await; // replay

        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn delete_from_removes_blocks_and_events() {
        let store = MemoryStorage::new();
        for n in 100..=105 {
            commit_block(&store, n, &[event(n, 0)]).await;
        }

        let mut txn = store.begin().await.unwrap();
        let deleted = txn.delete_from(103).await.unwrap();
        txn.set_cursor(&Cursor::new(102, "0x66")).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.block_numbers(), vec![100, 101, 102]);
        assert_eq!(store.event_count(), 3);
        assert!(store.block_at(103).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_from_is_idempotent() {
        let store = MemoryStorage::new();
        commit_block(&store, 100, &[]).await;

        for expected in [1u64, 0] {
            let mut txn = store.begin().await.unwrap();
            assert_eq!(txn.delete_from(100).await.unwrap(), expected);
            txn.commit().await.unwrap();
        }
    }

    #[tokio::test]
    async fn injected_transient_failure_clears() {
        let store = MemoryStorage::new();
        store.fail_commits(1);

        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        let err = txn.commit().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.block_count(), 0);

        commit_block(&store, 100, &[]).await; // next commit succeeds
        assert_eq!(store.block_count(), 1);
    }

    #[tokio::test]
    async fn injected_crash_is_fatal_and_discards() {
        let store = MemoryStorage::new();
        store.crash_next_commit();

        let mut txn = store.begin().await.unwrap();
        txn.upsert_block(&header(100)).await.unwrap();
        let err = txn.commit().await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.block_count(), 0);
    }
}
