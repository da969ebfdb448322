//! Transport-level error types and their mapping onto the pipeline taxonomy.

use thiserror::Error;

use starkindex_core::IndexerError;

use crate::jsonrpc::JsonRpcError;

/// Errors that can occur during an RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, reset, timeout).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connect/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Protocol-level error returned by the node.
    #[error("{0}")]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. }
        )
    }
}

impl From<TransportError> for IndexerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Http(_) | TransportError::WebSocket(_) | TransportError::Timeout { .. } => {
                IndexerError::TransientNetwork(e.to_string())
            }
            TransportError::Rpc(_) | TransportError::Deserialization(_) => {
                IndexerError::MalformedResponse(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Http("reset".into()).is_retryable());
        assert!(TransportError::Timeout { ms: 15_000 }.is_retryable());
        assert!(!TransportError::Rpc(JsonRpcError {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        })
        .is_retryable());
    }

    #[test]
    fn maps_onto_pipeline_taxonomy() {
        let transient: IndexerError = TransportError::Http("reset".into()).into();
        assert!(matches!(transient, IndexerError::TransientNetwork(_)));

        let malformed: IndexerError = TransportError::Rpc(JsonRpcError {
            code: -32700,
            message: "parse error".into(),
            data: None,
        })
        .into();
        assert!(matches!(malformed, IndexerError::MalformedResponse(_)));
    }
}
