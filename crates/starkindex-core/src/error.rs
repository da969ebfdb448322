//! Error taxonomy for the indexing pipeline.
//!
//! Only the orchestrator is allowed to halt the pipeline; every other
//! component surfaces these as values.

use thiserror::Error;

/// Errors from a persistence adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Retryable: connection drops, pool timeouts, lock contention.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Not retryable: schema violations, corrupt data, closed pools.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Returns `true` if the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Per-event ABI decode failure. Never kills the pipeline — the event is
/// persisted raw with `decoded = None` and a warning is logged.
#[derive(Debug, Error)]
pub enum AbiError {
    #[error("event '{name}' not found in ABI")]
    EventNotFound { name: String },

    #[error("ABI entry is malformed: {reason}")]
    Malformed { reason: String },

    #[error("field '{field}': ran out of {section} felts")]
    MissingFelts { field: String, section: &'static str },

    #[error("{count} undecoded {section} felt(s) left over")]
    TrailingFelts { count: usize, section: &'static str },

    #[error("field '{field}': invalid felt value: {reason}")]
    InvalidFelt { field: String, reason: String },
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Network-level failure after the retry budget was exhausted.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The node returned a response the pipeline cannot interpret.
    #[error("malformed RPC response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A fork diverged deeper than the reorg window can resolve.
    #[error("reorg at block {at} deeper than the {window}-block window")]
    DeepReorg { at: u64, window: usize },

    /// Required options missing, or registration attempted after `start()`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A user handler failed. Caught and logged by the dispatcher.
    #[error("handler for '{event}' failed: {reason}")]
    Handler { event: String, reason: String },

    /// The pipeline was asked to stop.
    #[error("indexer stopped")]
    Stopped,
}

impl IndexerError {
    /// Returns `true` if the underlying condition is retryable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(IndexerError::TransientNetwork("reset".into()).is_transient());
        assert!(IndexerError::Storage(StorageError::Transient("busy".into())).is_transient());
        assert!(!IndexerError::Storage(StorageError::Fatal("corrupt".into())).is_transient());
        assert!(!IndexerError::DeepReorg { at: 100, window: 64 }.is_transient());
    }
}
