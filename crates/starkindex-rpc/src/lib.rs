//! # starkindex-rpc
//!
//! Starknet JSON-RPC transports for StarkIndex: an HTTP client with bounded
//! retry, a WebSocket newHeads subscription, and the typed [`StarknetRpc`]
//! provider trait the pipeline is written against.

pub mod client;
pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod ws;

pub use client::{NodeConfig, StarknetNodeClient, StarknetRpc};
pub use error::TransportError;
pub use http::{HttpClientConfig, HttpRpcClient};
pub use ws::{HeadSubscription, WsConfig};
