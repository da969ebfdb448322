//! Indexer configuration and the fluent builder.

use std::sync::Arc;
use std::time::Duration;

use starkindex_core::storage::Storage;
use starkindex_rpc::StarknetRpc;

use crate::indexer::Indexer;

/// Where to begin when no cursor has been persisted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingBlock {
    /// Begin at this block number.
    Number(u64),
    /// Begin at the chain head observed during `start()`.
    Latest,
}

/// Log verbosity for [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// HTTPS JSON-RPC endpoint (required).
    pub rpc_node_url: String,
    /// WebSocket endpoint for the newHeads subscription (required).
    pub ws_node_url: String,
    /// Consulted only when no cursor exists in storage.
    pub starting_block: StartingBlock,
    /// Log verbosity. `start()` installs a matching subscriber via
    /// `logging::init_tracing` unless the application already set one.
    pub log_level: LogLevel,
    /// Concurrent historical fetches (W).
    pub historical_concurrency: usize,
    /// Reorg window (K) — must exceed the chain's max expected reorg depth.
    pub reorg_window: usize,
    /// Per-RPC-call timeout.
    pub rpc_timeout: Duration,
    /// WebSocket connect + subscribe timeout.
    pub ws_handshake_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            rpc_node_url: String::new(),
            ws_node_url: String::new(),
            starting_block: StartingBlock::Latest,
            log_level: LogLevel::Info,
            historical_concurrency: 8,
            reorg_window: 64,
            rpc_timeout: Duration::from_secs(15),
            ws_handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Fluent builder for [`Indexer`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use starkindex::{IndexerBuilder, StartingBlock};
/// use starkindex_storage::SqliteStorage;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let indexer = IndexerBuilder::new()
///     .rpc_node_url("https://starknet-mainnet.example/rpc/v0_8")
///     .ws_node_url("wss://starknet-mainnet.example/ws/v0_8")
///     .storage(Arc::new(SqliteStorage::open("./index.db").await?))
///     .starting_block(StartingBlock::Number(500_000))
///     .build();
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    storage: Option<Arc<dyn Storage>>,
    provider: Option<Arc<dyn StarknetRpc>>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc_node_url(mut self, url: impl Into<String>) -> Self {
        self.config.rpc_node_url = url.into();
        self
    }

    pub fn ws_node_url(mut self, url: impl Into<String>) -> Self {
        self.config.ws_node_url = url.into();
        self
    }

    /// The persistence adapter backing this indexer.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Bring your own provider instead of the JSON-RPC node client; the
    /// node URLs are then ignored. Used for custom transports and tests.
    pub fn provider(mut self, provider: Arc<dyn StarknetRpc>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn starting_block(mut self, starting_block: StartingBlock) -> Self {
        self.config.starting_block = starting_block;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn historical_concurrency(mut self, concurrency: usize) -> Self {
        self.config.historical_concurrency = concurrency;
        self
    }

    pub fn reorg_window(mut self, window: usize) -> Self {
        self.config.reorg_window = window;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn ws_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.ws_handshake_timeout = timeout;
        self
    }

    /// Build the indexer. Required options are validated by `start()`.
    pub fn build(self) -> Indexer {
        Indexer::from_parts(self.config, self.storage, self.provider)
    }
}
