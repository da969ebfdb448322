//! User handler traits and the post-commit dispatcher.
//!
//! Handlers run strictly after the block's transaction commits
//! (at-least-once delivery). A failing handler is caught, logged with its
//! event context, and the pipeline proceeds — handlers own their
//! idempotency and retries.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::IndexerError;
use crate::registry::AbiRegistry;
use crate::storage::Storage;
use crate::types::{BlockHeader, Cursor, DecodedFields, IndexPhase, StoredEvent};

/// A decoded event as delivered to handlers.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    /// Emitting contract address.
    pub contract_address: String,
    /// Fully-qualified ABI event name.
    pub event_name: String,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub event_index: u32,
    /// Decoded field values keyed by ABI member name.
    pub fields: DecodedFields,
}

impl DecodedEvent {
    /// Get a decoded field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Deserialize the decoded fields into a typed struct.
    pub fn fields_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Build the handler-facing view of a stored event. `None` when the
    /// event failed to decode — there is no typed payload to pass.
    pub fn from_stored(stored: &StoredEvent) -> Option<Self> {
        Some(Self {
            contract_address: stored.raw.from_address.clone(),
            event_name: stored.event_name.clone()?,
            block_number: stored.raw.block_number,
            block_hash: stored.raw.block_hash.clone(),
            tx_hash: stored.raw.tx_hash.clone(),
            event_index: stored.raw.event_index,
            fields: stored.decoded.clone()?,
        })
    }
}

/// What a handler invocation gets to work with.
pub struct HandlerContext {
    /// Storage handle on a dedicated connection, separate from the
    /// transaction that committed the triggering block.
    pub db: Arc<dyn Storage>,
    /// The committed cursor at dispatch time.
    pub cursor: Cursor,
    /// Whether the pipeline is backfilling or live.
    pub phase: IndexPhase,
}

/// Describes a completed rollback, passed to the reorg handler.
#[derive(Debug, Clone)]
pub struct ReorgNotice {
    /// The first rolled-back block of the abandoned chain.
    pub forked_block: BlockHeader,
    /// First block number that was deleted.
    pub from_block: u64,
    /// The canonical tip after rollback, if any blocks remain.
    pub new_tip: Option<Cursor>,
}

/// Trait for user-provided event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DecodedEvent, ctx: &HandlerContext)
        -> Result<(), IndexerError>;
}

/// Trait for the (at most one) reorg handler.
#[async_trait]
pub trait ReorgHandler: Send + Sync {
    async fn on_reorg(&self, notice: &ReorgNotice, ctx: &HandlerContext)
        -> Result<(), IndexerError>;
}

/// Invokes handlers for committed blocks and rollbacks.
///
/// Dispatch is sequential on the committing task: events of one block in
/// `event_index` order, block N fully dispatched before block N+1.
pub struct HandlerDispatcher {
    registry: Arc<AbiRegistry>,
    reorg_handler: Option<Arc<dyn ReorgHandler>>,
}

impl HandlerDispatcher {
    pub fn new(registry: Arc<AbiRegistry>, reorg_handler: Option<Arc<dyn ReorgHandler>>) -> Self {
        Self {
            registry,
            reorg_handler,
        }
    }

    /// Invoke handlers for a committed block's events.
    pub async fn dispatch_block(&self, events: &[StoredEvent], ctx: &HandlerContext) {
        let mut ordered: Vec<&StoredEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.raw.event_index);

        for stored in ordered {
            let Some(decoded) = DecodedEvent::from_stored(stored) else {
                // Decode failed earlier: stored raw, nothing to hand over.
                continue;
            };
            let Some(entry) = self.registry.lookup(&stored.raw) else {
                continue;
            };
            let invocation = entry.handler.handle(&decoded, ctx);
            match std::panic::AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        event = %decoded.event_name,
                        block = decoded.block_number,
                        tx = %decoded.tx_hash,
                        event_index = decoded.event_index,
                        error = %e,
                        "event handler failed; continuing"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        event = %decoded.event_name,
                        block = decoded.block_number,
                        tx = %decoded.tx_hash,
                        "event handler panicked; continuing"
                    );
                }
            }
        }
    }

    /// Invoke the reorg handler, if one is registered.
    pub async fn dispatch_reorg(&self, notice: &ReorgNotice, ctx: &HandlerContext) {
        let Some(handler) = &self.reorg_handler else {
            return;
        };
        let invocation = handler.on_reorg(notice, ctx);
        match std::panic::AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    from_block = notice.from_block,
                    error = %e,
                    "reorg handler failed; continuing"
                );
            }
            Err(_) => {
                tracing::error!(from_block = notice.from_block, "reorg handler panicked");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
