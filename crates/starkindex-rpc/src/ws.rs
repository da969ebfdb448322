//! WebSocket newHeads subscription.
//!
//! One [`HeadSubscription`] wraps one WebSocket connection. The stream ends
//! (`next()` returns `None`) when the connection drops; reconnecting with
//! fresh state is the caller's job — the chain source owns the backoff and
//! the missed-block gap close.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use starkindex_core::health::HealthTracker;
use starkindex_core::types::{BlockHeader, BlockStatus};

use crate::error::TransportError;
use crate::jsonrpc::JsonRpcResponse;

const SUBSCRIBE_METHOD: &str = "starknet_subscribeNewHeads";
const NOTIFICATION_METHOD: &str = "starknet_subscriptionNewHeads";

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connect + subscribe handshake timeout.
    pub handshake_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// A live stream of new chain heads over one WebSocket connection.
pub struct HeadSubscription {
    rx: mpsc::Receiver<BlockHeader>,
    task: Option<JoinHandle<()>>,
}

impl HeadSubscription {
    /// Connect, subscribe, and start forwarding heads.
    pub async fn connect(
        url: &str,
        config: &WsConfig,
        health: Arc<HealthTracker>,
    ) -> Result<Self, TransportError> {
        let handshake = async {
            let (ws, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
            let (mut sink, mut stream) = ws.split();

            let request = json!({
                "jsonrpc": "2.0",
                "method": SUBSCRIBE_METHOD,
                "params": {},
                "id": 1,
            });
            sink.send(Message::Text(request.to_string()))
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;

            // Drain until the subscription confirmation arrives.
            let subscription_id = loop {
                let msg = stream
                    .next()
                    .await
                    .ok_or_else(|| TransportError::WebSocket("closed during subscribe".into()))?
                    .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                let Message::Text(text) = msg else { continue };
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&text) {
                    if let Some(result) = resp.result {
                        break subscription_id_value(&result)?;
                    }
                    if let Some(err) = resp.error {
                        return Err(TransportError::Rpc(err));
                    }
                }
            };
            Ok::<_, TransportError>((sink, stream, subscription_id))
        };

        let (mut sink, mut stream, subscription_id) =
            tokio::time::timeout(config.handshake_timeout, handshake)
                .await
                .map_err(|_| TransportError::Timeout {
                    ms: config.handshake_timeout.as_millis() as u64,
                })??;

        tracing::info!(url, subscription = %subscription_id, "newHeads subscription open");
        health.mark_ws();

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            loop {
                let msg = match stream.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WS receive error");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if let Some(head) = parse_notification(&text, &subscription_id) {
                            health.mark_ws();
                            if tx.send(head).await.is_err() {
                                break; // receiver dropped
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            tracing::debug!("newHeads subscription closed");
        });

        Ok(Self {
            rx,
            task: Some(task),
        })
    }

    /// Wrap a pre-filled channel; used by in-process mocks.
    pub fn from_channel(rx: mpsc::Receiver<BlockHeader>) -> Self {
        Self { rx, task: None }
    }

    /// Next head, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<BlockHeader> {
        self.rx.recv().await
    }
}

impl Drop for HeadSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn subscription_id_value(result: &Value) -> Result<String, TransportError> {
    match result {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(TransportError::WebSocket(format!(
            "unexpected subscription id: {other}"
        ))),
    }
}

/// Parse a `starknet_subscriptionNewHeads` notification into a header.
/// Payloads for other subscriptions or with missing fields are skipped —
/// the gap close re-fetches anything a dropped notification would cover.
fn parse_notification(text: &str, subscription_id: &str) -> Option<BlockHeader> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("method").and_then(Value::as_str) != Some(NOTIFICATION_METHOD) {
        return None;
    }
    let params = value.get("params")?;
    let notified = params.get("subscription")?;
    let matches = match notified {
        Value::String(s) => s == subscription_id,
        Value::Number(n) => n.to_string() == subscription_id,
        _ => false,
    };
    if !matches {
        return None;
    }

    let result = params.get("result")?;
    let header = BlockHeader {
        number: result.get("block_number")?.as_u64()?,
        hash: result.get("block_hash")?.as_str()?.to_string(),
        parent_hash: result.get("parent_hash")?.as_str()?.to_string(),
        timestamp: result.get("timestamp").and_then(Value::as_u64).unwrap_or(0),
        status: BlockStatus::Accepted,
    };
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_notification_extracts_header() {
        let text = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": NOTIFICATION_METHOD,
            "params": {
                "subscription": "0xsub",
                "result": {
                    "block_number": 201,
                    "block_hash": "0xc9",
                    "parent_hash": "0xc8",
                    "timestamp": 1700000000u64,
                }
            }
        }))
        .unwrap();

        let head = parse_notification(&text, "0xsub").unwrap();
        assert_eq!(head.number, 201);
        assert_eq!(head.hash, "0xc9");
        assert_eq!(head.parent_hash, "0xc8");
    }

    #[test]
    fn parse_notification_ignores_other_subscriptions() {
        let text = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": NOTIFICATION_METHOD,
            "params": { "subscription": "0xother", "result": {} }
        }))
        .unwrap();
        assert!(parse_notification(&text, "0xsub").is_none());
    }

    #[test]
    fn parse_notification_ignores_responses() {
        let text = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": "0xsub"
        }))
        .unwrap();
        assert!(parse_notification(&text, "0xsub").is_none());
    }

    #[tokio::test]
    async fn from_channel_yields_and_ends() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = HeadSubscription::from_channel(rx);
        tx.send(BlockHeader {
            number: 1,
            hash: "0x1".into(),
            parent_hash: "0x0".into(),
            timestamp: 0,
            status: BlockStatus::Accepted,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(sub.next().await.unwrap().number, 1);
        assert!(sub.next().await.is_none());
    }
}
