//! The orchestrator: owns component lifetimes and the cursor, drives the
//! source → detector → processor → dispatcher loop, and is the only place
//! allowed to halt the pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use starkindex_core::handler::{HandlerContext, HandlerDispatcher, ReorgNotice};
use starkindex_core::health::{Health, HealthTracker};
use starkindex_core::processor::BlockProcessor;
use starkindex_core::registry::{AbiRegistry, EventSubscription};
use starkindex_core::reorg::{Directive, ReorgDetector};
use starkindex_core::retry::{RetryConfig, RetryPolicy};
use starkindex_core::storage::Storage;
use starkindex_core::types::{BlockCandidate, Cursor, IndexPhase};
use starkindex_core::{IndexerError, ReorgHandler};
use starkindex_rpc::{NodeConfig, StarknetNodeClient, StarknetRpc};

use crate::config::{IndexerConfig, StartingBlock};
use crate::source::{fetch_candidate, BlockStream, SourceConfig, SourceEvent};

/// Lifecycle state, published on the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerStatus {
    Idle,
    Backfilling,
    Live,
    Stopped,
    /// The pipeline halted on a fatal condition; the cursor is preserved.
    Failed(String),
}

/// The Starknet chain indexer.
///
/// Register subscriptions with [`on_event`](Indexer::on_event) and at most
/// one [`on_reorg`](Indexer::on_reorg) handler, then call
/// [`start`](Indexer::start). Registration after `start()` is a
/// configuration error.
pub struct Indexer {
    config: IndexerConfig,
    storage: Option<Arc<dyn Storage>>,
    provider: Option<Arc<dyn StarknetRpc>>,
    subscriptions: Mutex<Vec<EventSubscription>>,
    reorg_handler: Mutex<Option<Arc<dyn ReorgHandler>>>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    status_tx: watch::Sender<IndexerStatus>,
    health: Arc<HealthTracker>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Indexer {
    pub(crate) fn from_parts(
        config: IndexerConfig,
        storage: Option<Arc<dyn Storage>>,
        provider: Option<Arc<dyn StarknetRpc>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(IndexerStatus::Idle);
        Self {
            config,
            storage,
            provider,
            subscriptions: Mutex::new(Vec::new()),
            reorg_handler: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown_tx,
            status_tx,
            health: Arc::new(HealthTracker::new()),
            task: Mutex::new(None),
        }
    }

    /// Register an event subscription. Must be called before `start()`.
    pub fn on_event(&self, subscription: EventSubscription) -> Result<(), IndexerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(IndexerError::Configuration(
                "subscriptions must be registered before start()".into(),
            ));
        }
        self.subscriptions.lock().unwrap().push(subscription);
        Ok(())
    }

    /// Register the reorg handler. At most one; before `start()` only.
    pub fn on_reorg(&self, handler: Arc<dyn ReorgHandler>) -> Result<(), IndexerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(IndexerError::Configuration(
                "the reorg handler must be registered before start()".into(),
            ));
        }
        let mut slot = self.reorg_handler.lock().unwrap();
        if slot.is_some() {
            return Err(IndexerError::Configuration(
                "only one reorg handler may be registered".into(),
            ));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Subscribe to lifecycle status changes. Fatal conditions surface here.
    pub fn status(&self) -> watch::Receiver<IndexerStatus> {
        self.status_tx.subscribe()
    }

    /// Liveness of the external dependencies, from the last observed
    /// interaction within a 30-second window.
    pub fn health_check(&self) -> Health {
        self.health.snapshot()
    }

    /// Validate configuration, run migrations, resolve the cursor, and
    /// start the pipeline. Returns once the background task is running.
    pub async fn start(&self) -> Result<(), IndexerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(IndexerError::Configuration("already started".into()));
        }

        // No-op when the application already installed a subscriber.
        crate::logging::init_tracing(self.config.log_level);

        let storage = self
            .storage
            .as_ref()
            .cloned()
            .ok_or_else(|| IndexerError::Configuration("no storage adapter configured".into()))?;

        let rpc: Arc<dyn StarknetRpc> = match &self.provider {
            Some(provider) => Arc::clone(provider),
            None => {
                if self.config.rpc_node_url.is_empty() || self.config.ws_node_url.is_empty() {
                    return Err(IndexerError::Configuration(
                        "rpc_node_url and ws_node_url are required".into(),
                    ));
                }
                Arc::new(StarknetNodeClient::new(
                    self.config.rpc_node_url.clone(),
                    self.config.ws_node_url.clone(),
                    NodeConfig {
                        rpc_timeout: self.config.rpc_timeout,
                        ws_handshake_timeout: self.config.ws_handshake_timeout,
                    },
                    Arc::clone(&self.health),
                )?)
            }
        };

        storage.migrate().await?;
        self.health.mark_database();

        let cursor = storage.get_cursor().await?;
        let start_block = match &cursor {
            Some(cursor) => cursor.next_block(),
            None => match self.config.starting_block {
                StartingBlock::Number(number) => number,
                StartingBlock::Latest => rpc.chain_head().await?,
            },
        };

        // Freeze the registry: subscriptions registered from here on fail.
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        let registry = Arc::new(AbiRegistry::from_subscriptions(&subscriptions)?);
        let reorg_handler = self.reorg_handler.lock().unwrap().clone();

        tracing::info!(
            start_block,
            subscriptions = registry.len(),
            reorg_window = self.config.reorg_window,
            "indexer starting"
        );

        let pipeline = Pipeline {
            rpc,
            storage: Arc::clone(&storage),
            processor: BlockProcessor::new(storage, Arc::clone(&registry)),
            dispatcher: HandlerDispatcher::new(registry, reorg_handler),
            detector: ReorgDetector::new(self.config.reorg_window, cursor),
            retry: RetryPolicy::new(RetryConfig::default()),
            health: Arc::clone(&self.health),
            status_tx: self.status_tx.clone(),
        };

        let source = BlockStream::spawn(
            Arc::clone(&pipeline.rpc),
            start_block,
            SourceConfig {
                historical_concurrency: self.config.historical_concurrency,
                ..SourceConfig::default()
            },
            self.shutdown_tx.subscribe(),
        );

        let shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(run_pipeline(pipeline, source, shutdown));
        *self.task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Signal cancellation, let the in-flight block finish cleanly, and
    /// join the pipeline task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "pipeline task join failed");
                }
            }
        }
        self.status_tx.send_if_modified(|status| {
            if matches!(status, IndexerStatus::Failed(_)) {
                false
            } else {
                *status = IndexerStatus::Stopped;
                true
            }
        });
        tracing::info!("indexer stopped");
    }
}

/// Everything the pipeline loop owns.
struct Pipeline {
    rpc: Arc<dyn StarknetRpc>,
    storage: Arc<dyn Storage>,
    processor: BlockProcessor,
    dispatcher: HandlerDispatcher,
    detector: ReorgDetector,
    retry: RetryPolicy,
    health: Arc<HealthTracker>,
    status_tx: watch::Sender<IndexerStatus>,
}

async fn run_pipeline(
    mut pipeline: Pipeline,
    mut source: BlockStream,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = source.next() => event,
        };
        match event {
            None => break, // source ended (shutdown)
            Some(SourceEvent::Fatal(e)) => {
                tracing::error!(error = %e, "chain source failed");
                let _ = pipeline
                    .status_tx
                    .send(IndexerStatus::Failed(e.to_string()));
                break;
            }
            Some(SourceEvent::Candidate { candidate, phase }) => {
                publish_phase(&pipeline.status_tx, phase);
                if let Err(e) = step(&mut pipeline, candidate, phase).await {
                    tracing::error!(error = %e, "pipeline halted");
                    let _ = pipeline
                        .status_tx
                        .send(IndexerStatus::Failed(e.to_string()));
                    break;
                }
            }
        }
    }
}

fn publish_phase(status_tx: &watch::Sender<IndexerStatus>, phase: IndexPhase) {
    let status = match phase {
        IndexPhase::Backfill => IndexerStatus::Backfilling,
        IndexPhase::Live => IndexerStatus::Live,
    };
    status_tx.send_if_modified(|current| {
        if *current == status || matches!(current, IndexerStatus::Failed(_)) {
            false
        } else {
            *current = status.clone();
            true
        }
    });
}

/// Process one candidate to completion, including any rollback-and-replay
/// it triggers. Replay candidates are queued rather than recursed so a
/// reorg discovered mid-replay re-enters the same loop.
async fn step(
    pipeline: &mut Pipeline,
    candidate: BlockCandidate,
    phase: IndexPhase,
) -> Result<(), IndexerError> {
    let mut queue = VecDeque::from([candidate]);

    while let Some(candidate) = queue.pop_front() {
        let directive = pipeline
            .detector
            .decide(candidate, &*pipeline.rpc)
            .await?;

        match directive {
            Directive::Duplicate { number } => {
                tracing::debug!(block = number, "already committed; skipping");
            }
            Directive::Accept(candidate) => {
                let events = retry_transient(&pipeline.retry, || {
                    pipeline.processor.apply_block(&candidate)
                })
                .await?;
                pipeline.health.mark_database();
                pipeline.detector.record(&candidate.header);

                tracing::info!(
                    block = candidate.header.number,
                    events = events.len(),
                    %phase,
                    "block indexed"
                );

                let ctx = HandlerContext {
                    db: Arc::clone(&pipeline.storage),
                    cursor: pipeline
                        .detector
                        .cursor()
                        .cloned()
                        .unwrap_or_else(|| Cursor::new(candidate.header.number, "0x0")),
                    phase,
                };
                pipeline.dispatcher.dispatch_block(&events, &ctx).await;
            }
            Directive::Reorg { from_block } => {
                let outcome = retry_transient(&pipeline.retry, || {
                    pipeline.processor.apply_reorg(from_block)
                })
                .await?;
                pipeline.health.mark_database();
                pipeline
                    .detector
                    .rollback(from_block, outcome.new_cursor.clone());

                if let Some(forked_block) = outcome.forked_block {
                    let notice = ReorgNotice {
                        forked_block,
                        from_block,
                        new_tip: outcome.new_cursor.clone(),
                    };
                    let ctx = HandlerContext {
                        db: Arc::clone(&pipeline.storage),
                        cursor: outcome
                            .new_cursor
                            .unwrap_or_else(|| Cursor::new(0, "0x0")),
                        phase,
                    };
                    pipeline.dispatcher.dispatch_reorg(&notice, &ctx).await;
                }

                // Re-drive the rolled-back range from the node's canonical
                // chain; anything the source still emits for it will land
                // as a duplicate.
                let head = pipeline.rpc.chain_head().await?;
                for number in from_block..=head {
                    queue.push_back(fetch_candidate(&*pipeline.rpc, number).await?);
                }
            }
        }
    }
    Ok(())
}

/// Retry a transient-failing operation with bounded exponential backoff.
async fn retry_transient<T, F, Fut>(retry: &RetryPolicy, mut op: F) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, IndexerError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match retry.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(attempt, error = %e, "retry budget exhausted");
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}
