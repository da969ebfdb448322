//! Typed Starknet provider: the `StarknetRpc` trait the pipeline consumes,
//! and its JSON-RPC implementation over HTTP + WebSocket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use starkindex_core::health::HealthTracker;
use starkindex_core::reorg::HeaderLookup;
use starkindex_core::types::{BlockCandidate, BlockHeader, BlockStatus, RawEvent};
use starkindex_core::IndexerError;

use crate::error::TransportError;
use crate::http::{HttpClientConfig, HttpRpcClient};
use crate::ws::{HeadSubscription, WsConfig};

/// Starknet node error code for an unknown block.
const BLOCK_NOT_FOUND: i64 = 24;

/// Everything the pipeline needs from a Starknet node.
///
/// Implemented by [`StarknetNodeClient`] for real nodes and by scripted
/// mocks in tests.
#[async_trait]
pub trait StarknetRpc: HeaderLookup {
    /// Current chain head number (`starknet_blockNumber`).
    async fn chain_head(&self) -> Result<u64, IndexerError>;

    /// Full block + receipt-extracted events, or `None` if the block does
    /// not exist (`starknet_getBlockWithReceipts`).
    async fn block_with_receipts(&self, number: u64)
        -> Result<Option<BlockCandidate>, IndexerError>;

    /// Open a fresh newHeads subscription. Each call is one connection;
    /// the caller reconnects by calling again.
    async fn subscribe_new_heads(&self) -> Result<HeadSubscription, IndexerError>;
}

/// Node connection settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub rpc_timeout: Duration,
    pub ws_handshake_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(15),
            ws_handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// JSON-RPC implementation of [`StarknetRpc`].
pub struct StarknetNodeClient {
    http: HttpRpcClient,
    ws_url: String,
    ws_config: WsConfig,
    health: Arc<HealthTracker>,
}

impl StarknetNodeClient {
    pub fn new(
        rpc_url: impl Into<String>,
        ws_url: impl Into<String>,
        config: NodeConfig,
        health: Arc<HealthTracker>,
    ) -> Result<Self, IndexerError> {
        let http = HttpRpcClient::new(
            rpc_url,
            HttpClientConfig {
                request_timeout: config.rpc_timeout,
                ..HttpClientConfig::default()
            },
        )
        .map_err(IndexerError::from)?;

        Ok(Self {
            http,
            ws_url: ws_url.into(),
            ws_config: WsConfig {
                handshake_timeout: config.ws_handshake_timeout,
            },
            health,
        })
    }

    /// Call a block-scoped method, mapping "Block not found" to `None`.
    async fn block_call(&self, method: &str, number: u64) -> Result<Option<Value>, IndexerError> {
        let params = json!({ "block_id": { "block_number": number } });
        match self.http.call(method, params).await {
            Ok(result) => {
                self.health.mark_rpc();
                Ok(Some(result))
            }
            Err(TransportError::Rpc(e)) if e.code == BLOCK_NOT_FOUND => {
                self.health.mark_rpc();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl HeaderLookup for StarknetNodeClient {
    async fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let Some(result) = self
            .block_call("starknet_getBlockWithTxHashes", number)
            .await?
        else {
            return Ok(None);
        };
        parse_header(&result).map(Some)
    }
}

#[async_trait]
impl StarknetRpc for StarknetNodeClient {
    async fn chain_head(&self) -> Result<u64, IndexerError> {
        let result = self
            .http
            .call("starknet_blockNumber", json!({}))
            .await
            .map_err(IndexerError::from)?;
        self.health.mark_rpc();
        result.as_u64().ok_or_else(|| {
            IndexerError::MalformedResponse(format!("starknet_blockNumber returned {result}"))
        })
    }

    async fn block_with_receipts(
        &self,
        number: u64,
    ) -> Result<Option<BlockCandidate>, IndexerError> {
        let Some(result) = self
            .block_call("starknet_getBlockWithReceipts", number)
            .await?
        else {
            return Ok(None);
        };
        parse_candidate(&result).map(Some)
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription, IndexerError> {
        HeadSubscription::connect(&self.ws_url, &self.ws_config, Arc::clone(&self.health))
            .await
            .map_err(IndexerError::from)
    }
}

// ─── Response parsing ────────────────────────────────────────────────────────

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value, IndexerError> {
    value
        .get(name)
        .ok_or_else(|| IndexerError::MalformedResponse(format!("missing field '{name}'")))
}

fn str_field(value: &Value, name: &str) -> Result<String, IndexerError> {
    field(value, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| IndexerError::MalformedResponse(format!("field '{name}' is not a string")))
}

fn u64_field(value: &Value, name: &str) -> Result<u64, IndexerError> {
    field(value, name)?
        .as_u64()
        .ok_or_else(|| IndexerError::MalformedResponse(format!("field '{name}' is not a u64")))
}

/// Parse the header common to `getBlockWithTxHashes` and
/// `getBlockWithReceipts` results.
pub fn parse_header(block: &Value) -> Result<BlockHeader, IndexerError> {
    let status = block
        .get("status")
        .and_then(Value::as_str)
        .map(BlockStatus::from_rpc)
        .unwrap_or(BlockStatus::Accepted);
    Ok(BlockHeader {
        number: u64_field(block, "block_number")?,
        hash: str_field(block, "block_hash")?,
        parent_hash: str_field(block, "parent_hash")?,
        timestamp: u64_field(block, "timestamp").unwrap_or(0),
        status,
    })
}

/// Parse a `getBlockWithReceipts` result into a candidate, flattening
/// receipt events into block order.
pub fn parse_candidate(block: &Value) -> Result<BlockCandidate, IndexerError> {
    let header = parse_header(block)?;
    let transactions = field(block, "transactions")?
        .as_array()
        .ok_or_else(|| IndexerError::MalformedResponse("'transactions' is not an array".into()))?;

    let mut events = Vec::new();
    let mut event_index = 0u32;
    for entry in transactions {
        let receipt = field(entry, "receipt")?;
        let tx_hash = str_field(receipt, "transaction_hash")?;
        let receipt_events = receipt
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for event in &receipt_events {
            let felts = |name: &str| -> Result<Vec<String>, IndexerError> {
                field(event, name)?
                    .as_array()
                    .ok_or_else(|| {
                        IndexerError::MalformedResponse(format!("event '{name}' is not an array"))
                    })?
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            IndexerError::MalformedResponse(format!(
                                "event '{name}' holds a non-string felt"
                            ))
                        })
                    })
                    .collect()
            };
            events.push(RawEvent {
                block_hash: header.hash.clone(),
                block_number: header.number,
                tx_hash: tx_hash.clone(),
                event_index,
                from_address: str_field(event, "from_address")?,
                keys: felts("keys")?,
                data: felts("data")?,
            });
            event_index += 1;
        }
    }

    Ok(BlockCandidate { header, events })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
