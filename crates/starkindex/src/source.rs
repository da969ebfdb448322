//! The chain source — one ordered stream of block candidates.
//!
//! Two sub-sources joined at the handoff point:
//!
//! 1. **Historical** — `getBlockWithReceipts` paged with a worker pool of
//!    `W` concurrent fetches; `buffered(W)` re-sequences the results into
//!    strictly ascending block-number order. A bounded channel of depth
//!    `2 * W` provides backpressure to the consumer.
//! 2. **Live** — a newHeads subscription; each head's receipts are fetched
//!    via RPC. When the subscription drops, the source reconnects with
//!    exponential backoff and re-reads the head so missed blocks are
//!    emitted before the subscription re-engages (the same machinery
//!    closes the gap at the historical→live handoff).
//!
//! Heads announcing a number at or below what was already emitted are
//! forwarded too — they are the live signal of a reorg, and the detector
//! downstream decides.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use starkindex_core::retry::Backoff;
use starkindex_core::types::{BlockCandidate, IndexPhase};
use starkindex_core::IndexerError;
use starkindex_rpc::StarknetRpc;

/// What the source emits to the orchestrator.
pub enum SourceEvent {
    Candidate {
        candidate: BlockCandidate,
        phase: IndexPhase,
    },
    /// The source cannot continue; the orchestrator decides how to halt.
    Fatal(IndexerError),
}

/// Tuning knobs for the source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Concurrent historical fetches (W).
    pub historical_concurrency: usize,
    pub reconnect_initial: Duration,
    pub reconnect_cap: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            historical_concurrency: 8,
            reconnect_initial: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
        }
    }
}

/// Handle to the background source task.
pub struct BlockStream {
    rx: mpsc::Receiver<SourceEvent>,
    task: JoinHandle<()>,
}

impl BlockStream {
    /// Start producing candidates from `start_block` onward.
    pub fn spawn(
        rpc: Arc<dyn StarknetRpc>,
        start_block: u64,
        config: SourceConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.historical_concurrency.max(1) * 2);
        let task = tokio::spawn(run_source(rpc, start_block, config, tx, shutdown));
        Self { rx, task }
    }

    /// Next event, or `None` once the source task has ended.
    pub async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_source(
    rpc: Arc<dyn StarknetRpc>,
    start_block: u64,
    config: SourceConfig,
    tx: mpsc::Sender<SourceEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let head_at_start = match rpc.chain_head().await {
        Ok(head) => head,
        Err(e) => {
            let _ = tx.send(SourceEvent::Fatal(e)).await;
            return;
        }
    };

    // Phase 1: drain the historical range up to the head observed at start,
    // exclusive. Everything later belongs to the live stage's gap close.
    let mut next = start_block;
    if head_at_start > 0 && next <= head_at_start - 1 {
        let target = head_at_start - 1;
        tracing::info!(from = next, to = target, "backfill starting");

        let mut fetches = futures::stream::iter(next..=target)
            .map(|number| {
                let rpc = Arc::clone(&rpc);
                async move { fetch_candidate(rpc.as_ref(), number).await }
            })
            .buffered(config.historical_concurrency.max(1));

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                fetched = fetches.next() => match fetched {
                    None => break,
                    Some(Ok(candidate)) => {
                        if tx
                            .send(SourceEvent::Candidate {
                                candidate,
                                phase: IndexPhase::Backfill,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(SourceEvent::Fatal(e)).await;
                        return;
                    }
                },
            }
        }
        next = target + 1;
        tracing::info!(handoff = next, "backfill drained; switching to live");
    }

    // Phase 2: live subscription with reconnect and gap close.
    let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_cap, 0.2);
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut heads = match rpc.subscribe_new_heads().await {
            Ok(subscription) => {
                backoff.reset();
                subscription
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, delay_ms = delay.as_millis(), "newHeads connect failed");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        // Gap close: the subscription does not resume where it left off.
        // Emit everything between the last emitted block and the current
        // head before trusting notifications again.
        match rpc.chain_head().await {
            Ok(current) => {
                for number in next..=current {
                    match fetch_candidate(rpc.as_ref(), number).await {
                        Ok(candidate) => {
                            if tx
                                .send(SourceEvent::Candidate {
                                    candidate,
                                    phase: IndexPhase::Live,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(SourceEvent::Fatal(e)).await;
                            return;
                        }
                    }
                }
                next = next.max(current + 1);
            }
            Err(e) => {
                let _ = tx.send(SourceEvent::Fatal(e)).await;
                return;
            }
        }

        // Consume heads until the connection drops.
        loop {
            let head = tokio::select! {
                _ = shutdown.changed() => return,
                head = heads.next() => head,
            };
            let Some(head) = head else {
                break; // disconnected; reconnect with backoff
            };

            // A head at or below the last emitted block is a reorg signal:
            // re-fetch that number so the detector sees the new chain.
            let range = if head.number >= next {
                next..=head.number
            } else {
                head.number..=head.number
            };
            for number in range {
                match fetch_candidate(rpc.as_ref(), number).await {
                    Ok(candidate) => {
                        if tx
                            .send(SourceEvent::Candidate {
                                candidate,
                                phase: IndexPhase::Live,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(SourceEvent::Fatal(e)).await;
                        return;
                    }
                }
            }
            next = next.max(head.number + 1);
        }

        let delay = backoff.next_delay();
        tracing::warn!(
            delay_ms = delay.as_millis(),
            "newHeads subscription dropped; reconnecting"
        );
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Fetch a block with receipts, tolerating brief node lag between a head
/// announcement and the block becoming queryable.
pub(crate) async fn fetch_candidate(
    rpc: &dyn StarknetRpc,
    number: u64,
) -> Result<BlockCandidate, IndexerError> {
    const ATTEMPTS: u32 = 5;
    for attempt in 1..=ATTEMPTS {
        match rpc.block_with_receipts(number).await? {
            Some(candidate) => return Ok(candidate),
            None if attempt < ATTEMPTS => {
                tracing::debug!(block = number, attempt, "block not yet available");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            None => break,
        }
    }
    Err(IndexerError::MalformedResponse(format!(
        "node never served block {number}"
    )))
}
