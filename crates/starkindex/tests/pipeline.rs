//! End-to-end pipeline tests against a scripted in-process chain.
//!
//! The mock node serves a mutable canonical chain over the `StarknetRpc`
//! trait and feeds newHeads through the subscription channel, which lets
//! these tests drive backfill, live handoff, reorgs, and crash recovery
//! without a network.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use starkindex::{
    DecodedEvent, EventHandler, EventSubscription, HandlerContext, Indexer, IndexerBuilder,
    IndexerError, IndexerStatus, ReorgHandler, ReorgNotice, StartingBlock, StarknetRpc,
};
use starkindex_core::abi::event_selector;
use starkindex_core::reorg::HeaderLookup;
use starkindex_core::types::{normalize_felt, BlockCandidate, BlockHeader, BlockStatus, RawEvent};
use starkindex_rpc::HeadSubscription;
use starkindex_storage::MemoryStorage;

const CONTRACT: &str = "0xaaa";
const OTHER_CONTRACT: &str = "0xfff";
const EVENT_NAME: &str = "tok::Token::Transfer";

// ─── Mock node ───────────────────────────────────────────────────────────────

struct ChainState {
    blocks: BTreeMap<u64, BlockCandidate>,
    head: u64,
}

struct MockChain {
    state: Mutex<ChainState>,
    head_feed: Mutex<Option<mpsc::Sender<BlockHeader>>>,
}

impl MockChain {
    fn with_blocks(blocks: Vec<BlockCandidate>) -> Arc<Self> {
        let head = blocks.iter().map(|b| b.header.number).max().unwrap_or(0);
        let blocks = blocks.into_iter().map(|b| (b.header.number, b)).collect();
        Arc::new(Self {
            state: Mutex::new(ChainState { blocks, head }),
            head_feed: Mutex::new(None),
        })
    }

    /// Append or overwrite blocks and advance the head.
    fn set_canonical(&self, blocks: Vec<BlockCandidate>) {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            state.head = state.head.max(block.header.number);
            state.blocks.insert(block.header.number, block);
        }
    }

    /// Push the current header at `number` through the live subscription.
    async fn announce(&self, number: u64) {
        let header = {
            let state = self.state.lock().unwrap();
            state.blocks[&number].header.clone()
        };
        let feed = self.head_feed.lock().unwrap().clone();
        feed.expect("no active subscription")
            .send(header)
            .await
            .expect("subscription receiver dropped");
    }

    async fn wait_for_subscription(&self) {
        while self.head_feed.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl HeaderLookup for MockChain {
    async fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(state.blocks.get(&number).map(|b| b.header.clone()))
    }
}

#[async_trait]
impl StarknetRpc for MockChain {
    async fn chain_head(&self) -> Result<u64, IndexerError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn block_with_receipts(
        &self,
        number: u64,
    ) -> Result<Option<BlockCandidate>, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(state.blocks.get(&number).cloned())
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription, IndexerError> {
        let (tx, rx) = mpsc::channel(16);
        *self.head_feed.lock().unwrap() = Some(tx);
        Ok(HeadSubscription::from_channel(rx))
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<(u64, u32)>>,
}

impl RecordingHandler {
    fn calls(&self) -> Vec<(u64, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(
        &self,
        event: &DecodedEvent,
        _ctx: &HandlerContext,
    ) -> Result<(), IndexerError> {
        self.calls
            .lock()
            .unwrap()
            .push((event.block_number, event.event_index));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReorgHandler {
    notices: Mutex<Vec<ReorgNotice>>,
}

impl RecordingReorgHandler {
    fn notices(&self) -> Vec<ReorgNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReorgHandler for RecordingReorgHandler {
    async fn on_reorg(
        &self,
        notice: &ReorgNotice,
        _ctx: &HandlerContext,
    ) -> Result<(), IndexerError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

// ─── Chain construction ──────────────────────────────────────────────────────

fn transfer_abi() -> Value {
    json!([
        {
            "type": "event",
            "name": EVENT_NAME,
            "kind": "struct",
            "members": [
                { "name": "from", "type": "core::starknet::contract_address::ContractAddress", "kind": "key" },
                { "name": "amount", "type": "core::felt252", "kind": "data" }
            ]
        }
    ])
}

fn hash(number: u64, fork: &str) -> String {
    format!("0x{fork}{number:x}")
}

fn transfer_event(number: u64, fork: &str, event_index: u32, from_address: &str) -> RawEvent {
    RawEvent {
        block_hash: hash(number, fork),
        block_number: number,
        tx_hash: format!("0xe{number:x}"),
        event_index,
        from_address: from_address.into(),
        keys: vec![event_selector(EVENT_NAME), "0x1".into()],
        data: vec![format!("0x{number:x}")],
    }
}

fn block(number: u64, fork: &str, parent_hash: String, transfers: u32) -> BlockCandidate {
    let events = (0..transfers)
        .map(|i| transfer_event(number, fork, i, CONTRACT))
        .collect();
    BlockCandidate {
        header: BlockHeader {
            number,
            hash: hash(number, fork),
            parent_hash,
            timestamp: number * 3,
            status: BlockStatus::Accepted,
        },
        events,
    }
}

/// A parent-linked run of blocks on one fork, `transfers` events each.
fn chain(range: RangeInclusive<u64>, fork: &str, transfers: u32) -> Vec<BlockCandidate> {
    range
        .map(|n| block(n, fork, hash(n - 1, fork), transfers))
        .collect()
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Setup {
    indexer: Indexer,
    handler: Arc<RecordingHandler>,
    reorgs: Arc<RecordingReorgHandler>,
    storage: Arc<MemoryStorage>,
}

fn setup(
    mock: Arc<MockChain>,
    storage: Arc<MemoryStorage>,
    starting_block: StartingBlock,
    abi: Value,
    reorg_window: usize,
) -> Setup {
    let handler = Arc::new(RecordingHandler::default());
    let reorgs = Arc::new(RecordingReorgHandler::default());

    let indexer = IndexerBuilder::new()
        .provider(mock)
        .storage(storage.clone() as Arc<dyn starkindex::Storage>)
        .starting_block(starting_block)
        .reorg_window(reorg_window)
        .build();

    indexer
        .on_event(EventSubscription {
            contract_address: CONTRACT.into(),
            abi,
            event_name: "Transfer".into(),
            handler: handler.clone(),
        })
        .unwrap();
    indexer.on_reorg(reorgs.clone()).unwrap();

    Setup {
        indexer,
        handler,
        reorgs,
        storage,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn cursor_at(storage: &MemoryStorage, number: u64) -> impl FnMut() -> bool + '_ {
    move || {
        storage
            .cursor()
            .is_some_and(|c| c.block_number == number)
    }
}

const WAIT: Duration = Duration::from_secs(5);

// ─── Scenarios ───────────────────────────────────────────────────────────────

/// Linear backfill of a fixed range: every block row, every subscribed
/// event, handlers in (block_number, event_index) order.
#[tokio::test]
async fn linear_backfill_indexes_range() {
    let mut blocks = chain(100..=105, "a", 2);
    for candidate in &mut blocks {
        // A third event from an unsubscribed contract; must be dropped.
        let n = candidate.header.number;
        candidate.events.push(transfer_event(n, "a", 2, OTHER_CONTRACT));
    }
    let mock = MockChain::with_blocks(blocks);
    let storage = Arc::new(MemoryStorage::new());
    let s = setup(
        mock,
        storage.clone(),
        StartingBlock::Number(100),
        transfer_abi(),
        64,
    );

    s.indexer.start().await.unwrap();
    assert!(wait_until(cursor_at(&storage, 105), WAIT).await);
    assert!(s.indexer.health_check().database);
    s.indexer.stop().await;

    assert_eq!(s.storage.block_count(), 6);
    assert_eq!(s.storage.event_count(), 12);
    assert!(s
        .storage
        .events()
        .iter()
        .all(|e| e.raw.from_address == CONTRACT));

    let calls = s.handler.calls();
    assert_eq!(calls.len(), 12);
    let mut ordered = calls.clone();
    ordered.sort();
    assert_eq!(calls, ordered, "handlers out of (block, event_index) order");

    // Decoded payloads carry the ABI field names.
    let first = &s.storage.events()[0];
    assert_eq!(first.decoded.as_ref().unwrap()["amount"], "0x64");
    assert_eq!(first.decoded.as_ref().unwrap()["from"], "0x1");
}

/// `starting_block = Latest`: nothing is backfilled below the head at
/// start; the gap close plus live heads carry the cursor forward.
#[tokio::test]
async fn live_handoff_from_latest() {
    let mock = MockChain::with_blocks(chain(198..=200, "a", 1));
    let storage = Arc::new(MemoryStorage::new());
    let s = setup(
        mock.clone(),
        storage.clone(),
        StartingBlock::Latest,
        transfer_abi(),
        64,
    );

    s.indexer.start().await.unwrap();
    mock.wait_for_subscription().await;

    for n in 201..=203 {
        mock.set_canonical(vec![block(n, "a", hash(n - 1, "a"), 1)]);
        mock.announce(n).await;
    }

    assert!(wait_until(cursor_at(&storage, 203), WAIT).await);
    s.indexer.stop().await;

    // 198 and 199 exist on the node but were never requested.
    assert_eq!(s.storage.block_numbers(), vec![200, 201, 202, 203]);
    assert_eq!(s.handler.calls().len(), 4);
}

/// A sibling head at the tip: rollback to the fork point, replay the new
/// chain, reorg handler exactly once with the first rolled-back block.
#[tokio::test]
async fn single_block_reorg_rolls_back_and_replays() {
    let mock = MockChain::with_blocks(chain(499..=500, "a", 1));
    let storage = Arc::new(MemoryStorage::new());
    let s = setup(
        mock.clone(),
        storage.clone(),
        StartingBlock::Number(499),
        transfer_abi(),
        64,
    );

    s.indexer.start().await.unwrap();
    assert!(wait_until(cursor_at(&storage, 500), WAIT).await);
    mock.wait_for_subscription().await;

    mock.set_canonical(vec![block(501, "a", hash(500, "a"), 1)]);
    mock.announce(501).await;
    assert!(wait_until(cursor_at(&storage, 501), WAIT).await);

    // The fork: 500' and 501' replace 500 and 501; 500' still links to 499.
    mock.set_canonical(vec![
        block(500, "b", hash(499, "a"), 1),
        block(501, "b", hash(500, "b"), 1),
    ]);
    mock.announce(501).await;

    assert!(
        wait_until(
            || {
                s.storage
                    .events()
                    .iter()
                    .any(|e| e.raw.block_number == 501 && e.raw.block_hash == hash(501, "b"))
            },
            WAIT
        )
        .await
    );
    s.indexer.stop().await;

    let notices = s.reorgs.notices();
    assert_eq!(notices.len(), 1, "reorg handler must run exactly once");
    assert_eq!(notices[0].from_block, 500);
    assert_eq!(
        notices[0].forked_block.hash,
        normalize_felt(&hash(500, "a")),
        "forked_block is the first rolled-back block"
    );
    assert_eq!(notices[0].new_tip.as_ref().unwrap().block_number, 499);

    // Old-chain rows at and above the fork point are gone.
    assert_eq!(s.storage.block_numbers(), vec![499, 500, 501]);
    let block_500 = s.storage.events();
    let hashes: Vec<&str> = block_500
        .iter()
        .filter(|e| e.raw.block_number >= 500)
        .map(|e| e.raw.block_hash.as_str())
        .collect();
    assert!(hashes.iter().all(|h| h.starts_with("0xb")));
}

/// A fork diverging beyond the reorg window is fatal: the pipeline halts
/// and the on-disk cursor stays where it was.
#[tokio::test]
async fn deep_reorg_halts_with_cursor_preserved() {
    let mock = MockChain::with_blocks(chain(997..=1000, "a", 0));
    let storage = Arc::new(MemoryStorage::new());
    let s = setup(
        mock.clone(),
        storage.clone(),
        StartingBlock::Number(997),
        transfer_abi(),
        4,
    );

    let status = s.indexer.status();
    s.indexer.start().await.unwrap();
    assert!(wait_until(cursor_at(&storage, 1000), WAIT).await);
    mock.wait_for_subscription().await;

    // An entirely disagreeing chain: divergence is below the window.
    mock.set_canonical(chain(995..=1001, "b", 0));
    mock.announce(1001).await;

    assert!(
        wait_until(
            || matches!(*status.borrow(), IndexerStatus::Failed(_)),
            WAIT
        )
        .await,
        "deep reorg must surface as a fatal status"
    );
    s.indexer.stop().await;

    let cursor = s.storage.cursor().unwrap();
    assert_eq!(cursor.block_number, 1000);
    assert_eq!(cursor.block_hash, normalize_felt(&hash(1000, "a")));
    assert_eq!(s.storage.block_count(), 4);
}

/// An event whose payload does not fit the registered ABI is stored raw
/// with `decoded = None`, and no handler runs for it.
#[tokio::test]
async fn abi_mismatch_stores_raw_and_skips_handler() {
    // The registered ABI expects two data fields; the chain emits one.
    let wide_abi = json!([
        {
            "type": "event",
            "name": EVENT_NAME,
            "kind": "struct",
            "members": [
                { "name": "from", "type": "core::starknet::contract_address::ContractAddress", "kind": "key" },
                { "name": "amount", "type": "core::felt252", "kind": "data" },
                { "name": "memo", "type": "core::felt252", "kind": "data" }
            ]
        }
    ]);
    let mock = MockChain::with_blocks(chain(100..=100, "a", 1));
    let storage = Arc::new(MemoryStorage::new());
    let s = setup(
        mock,
        storage.clone(),
        StartingBlock::Number(100),
        wide_abi,
        64,
    );

    s.indexer.start().await.unwrap();
    assert!(wait_until(cursor_at(&storage, 100), WAIT).await);
    s.indexer.stop().await;

    let events = s.storage.events();
    assert_eq!(events.len(), 1, "undecodable event must still be persisted");
    assert!(events[0].decoded.is_none());
    assert!(s.handler.calls().is_empty(), "no typed payload, no handler");
}

/// Crash between staging and commit: the cursor never moves past the last
/// commit, and a restart finishes the block without duplicating rows.
#[tokio::test]
async fn crash_mid_commit_recovers_without_duplicates() {
    let mock = MockChain::with_blocks(chain(100..=102, "a", 1));
    let storage = Arc::new(MemoryStorage::new());
    storage.crash_on_commit(3);

    let s = setup(
        mock.clone(),
        storage.clone(),
        StartingBlock::Number(100),
        transfer_abi(),
        64,
    );
    let status = s.indexer.status();
    s.indexer.start().await.unwrap();
    assert!(
        wait_until(
            || matches!(*status.borrow(), IndexerStatus::Failed(_)),
            WAIT
        )
        .await
    );
    s.indexer.stop().await;

    // Safe state: cursor at the last commit, no partial writes.
    assert_eq!(storage.cursor().unwrap().block_number, 101);
    assert_eq!(storage.block_count(), 2);
    assert_eq!(storage.event_count(), 2);

    // Restart on the same storage: block 102 is re-processed to completion.
    let restarted = setup(
        mock,
        storage.clone(),
        StartingBlock::Number(100),
        transfer_abi(),
        64,
    );
    restarted.indexer.start().await.unwrap();
    assert!(wait_until(cursor_at(&storage, 102), WAIT).await);
    restarted.indexer.stop().await;

    assert_eq!(storage.block_count(), 3);
    assert_eq!(storage.event_count(), 3, "primary key must prevent duplicates");
    assert_eq!(restarted.handler.calls(), vec![(102, 0)]);
}

/// Registration is frozen at `start()`.
#[tokio::test]
async fn registration_after_start_is_rejected() {
    let mock = MockChain::with_blocks(chain(10..=10, "a", 0));
    let storage = Arc::new(MemoryStorage::new());
    let s = setup(
        mock,
        storage.clone(),
        StartingBlock::Number(10),
        transfer_abi(),
        64,
    );

    // A second reorg handler is rejected even before start.
    let extra_reorg = Arc::new(RecordingReorgHandler::default());
    assert!(matches!(
        s.indexer.on_reorg(extra_reorg.clone()),
        Err(IndexerError::Configuration(_))
    ));

    s.indexer.start().await.unwrap();
    assert!(wait_until(cursor_at(&storage, 10), WAIT).await);

    assert!(matches!(
        s.indexer.on_event(EventSubscription {
            contract_address: CONTRACT.into(),
            abi: transfer_abi(),
            event_name: "Transfer".into(),
            handler: Arc::new(RecordingHandler::default()),
        }),
        Err(IndexerError::Configuration(_))
    ));
    assert!(matches!(
        s.indexer.on_reorg(extra_reorg),
        Err(IndexerError::Configuration(_))
    ));

    s.indexer.stop().await;
}

/// Missing required options surface as configuration errors at `start()`.
#[tokio::test]
async fn missing_storage_is_a_configuration_error() {
    let indexer = IndexerBuilder::new()
        .rpc_node_url("https://node.example")
        .ws_node_url("wss://node.example")
        .build();
    assert!(matches!(
        indexer.start().await,
        Err(IndexerError::Configuration(_))
    ));
}
