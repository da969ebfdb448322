//! # starkindex
//!
//! A chain indexer for Starknet. It subscribes to the live head, backfills
//! a configurable historical range, decodes contract events against
//! user-supplied Cairo ABIs, persists blocks and events durably, and
//! invokes user handlers — while reconciling chain reorganizations so the
//! stored state always reflects the canonical chain within the reorg
//! window.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use starkindex::{EventSubscription, IndexerBuilder, StartingBlock};
//! use starkindex_storage::SqliteStorage;
//!
//! # async fn example(abi: serde_json::Value, handler: Arc<dyn starkindex::EventHandler>) -> Result<(), Box<dyn std::error::Error>> {
//! let indexer = IndexerBuilder::new()
//!     .rpc_node_url("https://starknet-mainnet.example/rpc/v0_8")
//!     .ws_node_url("wss://starknet-mainnet.example/ws/v0_8")
//!     .storage(Arc::new(SqliteStorage::open("./index.db").await?))
//!     .starting_block(StartingBlock::Number(500_000))
//!     .build();
//!
//! indexer.on_event(EventSubscription {
//!     contract_address: "0x049d...".into(),
//!     abi,
//!     event_name: "Transfer".into(),
//!     handler,
//! })?;
//!
//! indexer.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod indexer;
pub mod logging;
pub mod source;

pub use config::{IndexerBuilder, IndexerConfig, LogLevel, StartingBlock};
pub use indexer::{Indexer, IndexerStatus};
pub use logging::init_tracing;

pub use starkindex_core::{
    AbiError, BlockCandidate, BlockHeader, BlockStatus, Cursor, DecodedEvent, EventHandler,
    EventSubscription, HandlerContext, IndexPhase, IndexerError, RawEvent, ReorgHandler,
    ReorgNotice, Storage, StorageError, StoredEvent,
};
pub use starkindex_core::health::Health;
pub use starkindex_rpc::{StarknetNodeClient, StarknetRpc};
