//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

/// Normalize a felt hex string: lowercase, `0x` prefix, no leading zeros.
///
/// Starknet nodes are inconsistent about zero-padding block hashes and
/// addresses, so every comparison in the pipeline goes through this.
pub fn normalize_felt(s: &str) -> String {
    let stripped = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let trimmed = stripped.trim_start_matches('0');
    if trimmed.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{}", trimmed.to_lowercase())
    }
}

/// Returns `true` if two felt hex strings denote the same value.
pub fn felt_eq(a: &str, b: &str) -> bool {
    normalize_felt(a) == normalize_felt(b)
}

// ─── Blocks ──────────────────────────────────────────────────────────────────

/// Finality status of a block as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Accepted,
    Pending,
}

impl BlockStatus {
    /// Parse the node's status string (`"ACCEPTED_ON_L2"`, `"PENDING"`, …).
    pub fn from_rpc(s: &str) -> Self {
        if s.eq_ignore_ascii_case("pending") {
            Self::Pending
        } else {
            Self::Accepted
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Pending => "pending",
        }
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block header — enough for chain linkage and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…` felt hex).
    pub hash: String,
    /// Parent block hash (`0x…` felt hex).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
    /// Finality status.
    pub status: BlockStatus,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && felt_eq(&self.parent_hash, &parent.hash)
    }
}

/// A block plus the receipt-extracted events it carries, in emission order.
///
/// This is what the chain source emits and the reorg detector judges.
#[derive(Debug, Clone)]
pub struct BlockCandidate {
    pub header: BlockHeader,
    pub events: Vec<RawEvent>,
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// A raw, undecoded Starknet event lifted out of a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Hash of the block the event was emitted in.
    pub block_hash: String,
    /// Number of that block (denormalized for range queries).
    pub block_number: u64,
    /// Hash of the emitting transaction.
    pub tx_hash: String,
    /// Position of the event within the block, across all receipts.
    pub event_index: u32,
    /// Contract address that emitted the event.
    pub from_address: String,
    /// Event keys; `keys[0]` is the selector.
    pub keys: Vec<String>,
    /// Event data felts.
    pub data: Vec<String>,
}

impl RawEvent {
    /// The event selector (`keys[0]`), if present.
    pub fn selector(&self) -> Option<&str> {
        self.keys.first().map(|s| s.as_str())
    }
}

/// Decoded field values keyed by ABI member name.
pub type DecodedFields = serde_json::Map<String, serde_json::Value>;

/// An event as persisted: always the raw payload, plus the decoded mapping
/// when a registered subscription matched and ABI decoding succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub raw: RawEvent,
    /// Fully-qualified ABI event name of the matching subscription.
    pub event_name: Option<String>,
    /// `None` when decoding failed (the event is still stored raw).
    pub decoded: Option<DecodedFields>,
}

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// The committed high-water mark of processed blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last committed block number.
    pub block_number: u64,
    /// Last committed block hash.
    pub block_hash: String,
    /// Unix timestamp (seconds) of when this cursor was committed.
    pub updated_at: i64,
}

impl Cursor {
    pub fn new(block_number: u64, block_hash: impl Into<String>) -> Self {
        Self {
            block_number,
            block_hash: block_hash.into(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The next block to process (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.block_number + 1
    }
}

// ─── Pipeline phase ──────────────────────────────────────────────────────────

/// The current phase of the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Catching up on the historical range.
    Backfill,
    /// Following the chain tip via the live subscription.
    Live,
}

impl std::fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backfill => write!(f, "backfill"),
            Self::Live => write!(f, "live"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_padding_and_case() {
        assert_eq!(normalize_felt("0x00ABc"), "0xabc");
        assert_eq!(normalize_felt("0X0abc"), "0xabc");
        assert_eq!(normalize_felt("abc"), "0xabc");
        assert_eq!(normalize_felt("0x0"), "0x0");
        assert_eq!(normalize_felt("0x000"), "0x0");
    }

    #[test]
    fn felt_eq_ignores_representation() {
        assert!(felt_eq("0x0aB", "0xAB"));
        assert!(!felt_eq("0xab", "0xac"));
    }

    #[test]
    fn block_extends_parent() {
        let parent = BlockHeader {
            number: 100,
            hash: "0xaaa".into(),
            parent_hash: "0x000".into(),
            timestamp: 1000,
            status: BlockStatus::Accepted,
        };
        let child = BlockHeader {
            number: 101,
            hash: "0xbbb".into(),
            parent_hash: "0x0aaa".into(), // padded on purpose
            timestamp: 1012,
            status: BlockStatus::Accepted,
        };
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn status_from_rpc() {
        assert_eq!(BlockStatus::from_rpc("ACCEPTED_ON_L2"), BlockStatus::Accepted);
        assert_eq!(BlockStatus::from_rpc("ACCEPTED_ON_L1"), BlockStatus::Accepted);
        assert_eq!(BlockStatus::from_rpc("PENDING"), BlockStatus::Pending);
    }

    #[test]
    fn cursor_next_block() {
        let cursor = Cursor::new(500, "0x123");
        assert_eq!(cursor.next_block(), 501);
        assert!(cursor.updated_at > 0);
    }
}
