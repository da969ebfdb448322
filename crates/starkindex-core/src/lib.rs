//! # starkindex-core
//!
//! Core pipeline for the StarkIndex chain indexer: the data model, the
//! subscription/ABI registry, reorg detection over a canonical tail, the
//! abstract persistence port, the block processor, and the post-commit
//! handler dispatcher.
//!
//! This crate is transport- and dialect-agnostic: RPC clients live in
//! `starkindex-rpc`, storage adapters in `starkindex-storage`, and the
//! orchestrator that wires everything together in `starkindex`.

pub mod abi;
pub mod error;
pub mod handler;
pub mod health;
pub mod processor;
pub mod registry;
pub mod reorg;
pub mod retry;
pub mod storage;
pub mod tail;
pub mod types;

pub use error::{AbiError, IndexerError, StorageError};
pub use handler::{DecodedEvent, EventHandler, HandlerContext, ReorgHandler, ReorgNotice};
pub use registry::{AbiRegistry, EventSubscription};
pub use reorg::{Directive, HeaderLookup, ReorgDetector};
pub use storage::{Storage, StorageTxn};
pub use types::{
    BlockCandidate, BlockHeader, BlockStatus, Cursor, IndexPhase, RawEvent, StoredEvent,
};
