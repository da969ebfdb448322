//! Subscription registry — routes raw events to ABI descriptors and handlers.
//!
//! Built once from the subscriptions registered before `start()` and
//! immutable afterwards, so the pipeline reads it without locking.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::abi::{AbiEvent, ContractAbi};
use crate::error::IndexerError;
use crate::handler::EventHandler;
use crate::types::{normalize_felt, RawEvent};

/// A user subscription: which contract, which event, how to decode it,
/// and what to call once a decoded instance is committed.
pub struct EventSubscription {
    /// Emitting contract address (`0x…` felt hex).
    pub contract_address: String,
    /// The contract's Cairo ABI (JSON array).
    pub abi: Value,
    /// Event name — fully qualified, or trailing segment when unambiguous.
    pub event_name: String,
    pub handler: Arc<dyn EventHandler>,
}

/// One resolved subscription in the dispatch table.
pub struct RegisteredEvent {
    /// Normalized contract address.
    pub contract_address: String,
    pub event: AbiEvent,
    pub handler: Arc<dyn EventHandler>,
}

/// Dispatch table keyed by event selector; selector collisions across
/// contracts are disambiguated by contract address.
#[derive(Default)]
pub struct AbiRegistry {
    by_selector: HashMap<String, Vec<RegisteredEvent>>,
    len: usize,
}

impl std::fmt::Debug for AbiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbiRegistry")
            .field("selectors", &self.by_selector.len())
            .field("len", &self.len)
            .finish()
    }
}

impl AbiRegistry {
    /// Resolve every subscription against its ABI and build the table.
    pub fn from_subscriptions(subs: &[EventSubscription]) -> Result<Self, IndexerError> {
        let mut by_selector: HashMap<String, Vec<RegisteredEvent>> = HashMap::new();
        let mut len = 0usize;

        for sub in subs {
            let abi = ContractAbi::parse(&sub.abi).map_err(|e| {
                IndexerError::Configuration(format!(
                    "invalid ABI for contract {}: {e}",
                    sub.contract_address
                ))
            })?;
            let event = abi.event(&sub.event_name).map_err(|e| {
                IndexerError::Configuration(format!(
                    "subscription for contract {}: {e}",
                    sub.contract_address
                ))
            })?;

            let entry = RegisteredEvent {
                contract_address: normalize_felt(&sub.contract_address),
                event: event.clone(),
                handler: Arc::clone(&sub.handler),
            };
            by_selector
                .entry(event.selector.clone())
                .or_default()
                .push(entry);
            len += 1;
        }

        Ok(Self { by_selector, len })
    }

    /// Find the subscription matching a raw event's `(from_address, keys[0])`.
    pub fn lookup(&self, raw: &RawEvent) -> Option<&RegisteredEvent> {
        let selector = normalize_felt(raw.selector()?);
        let address = normalize_felt(&raw.from_address);
        self.by_selector
            .get(&selector)?
            .iter()
            .find(|entry| entry.contract_address == address)
    }

    /// Returns `true` if the raw event matches any subscription.
    pub fn matches(&self, raw: &RawEvent) -> bool {
        self.lookup(raw).is_some()
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
