//! Cairo ABI event descriptors, selector computation, and payload decoding.
//!
//! The ABI is consumed as the JSON array emitted by the Cairo compiler.
//! Only `type == "event"` entries matter here; everything else is skipped.

use serde_json::Value;
use std::collections::HashMap;
use tiny_keccak::{Hasher, Keccak};

use crate::error::AbiError;
use crate::types::{normalize_felt, DecodedFields, RawEvent};

/// `starknet_keccak`: keccak-256 masked to 250 bits, as a normalized felt.
///
/// This is the hash Starknet uses for event selectors (`keys[0]`).
pub fn starknet_keccak(input: &[u8]) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(input);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out[0] &= 0x03; // clear the top 6 bits
    normalize_felt(&format!("0x{}", hex::encode(out)))
}

/// Compute the selector for a fully-qualified event name.
pub fn event_selector(name: &str) -> String {
    starknet_keccak(name.as_bytes())
}

/// Whether an event field is consumed from `keys` or `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Key,
    Data,
}

/// One member of an ABI event.
#[derive(Debug, Clone)]
pub struct AbiEventField {
    pub name: String,
    /// Cairo type path, e.g. `core::integer::u256`.
    pub ty: String,
    pub kind: FieldKind,
}

impl AbiEventField {
    /// Number of felts this field occupies on the wire.
    fn width(&self) -> usize {
        if self.ty == "core::integer::u256" {
            2
        } else {
            1
        }
    }
}

/// An ABI event descriptor: the decode recipe for one event type.
#[derive(Debug, Clone)]
pub struct AbiEvent {
    /// Fully-qualified name, e.g. `contracts::token::Token::Transfer`.
    pub name: String,
    /// `starknet_keccak(name)`, normalized.
    pub selector: String,
    pub fields: Vec<AbiEventField>,
}

impl AbiEvent {
    /// Decode a raw event's `keys`/`data` against this descriptor.
    ///
    /// Fields are walked in ABI order; `key` fields consume from `keys[1..]`
    /// (`keys[0]` is the selector), `data` fields from `data`. Any shortfall
    /// or leftover is a length mismatch.
    pub fn decode(&self, raw: &RawEvent) -> Result<DecodedFields, AbiError> {
        let keys: Vec<&str> = raw.keys.iter().skip(1).map(|s| s.as_str()).collect();
        let data: Vec<&str> = raw.data.iter().map(|s| s.as_str()).collect();
        let mut key_pos = 0usize;
        let mut data_pos = 0usize;

        let mut fields = DecodedFields::new();
        for field in &self.fields {
            let (source, pos, section) = match field.kind {
                FieldKind::Key => (&keys, &mut key_pos, "key"),
                FieldKind::Data => (&data, &mut data_pos, "data"),
            };
            if *pos + field.width() > source.len() {
                return Err(AbiError::MissingFelts {
                    field: field.name.clone(),
                    section,
                });
            }
            let value = if field.width() == 2 {
                decode_u256(field, source[*pos], source[*pos + 1])?
            } else {
                Value::String(normalize_felt(source[*pos]))
            };
            *pos += field.width();
            fields.insert(field.name.clone(), value);
        }

        if key_pos < keys.len() {
            return Err(AbiError::TrailingFelts {
                count: keys.len() - key_pos,
                section: "key",
            });
        }
        if data_pos < data.len() {
            return Err(AbiError::TrailingFelts {
                count: data.len() - data_pos,
                section: "data",
            });
        }
        Ok(fields)
    }
}

/// Combine a `u256` (low, high) felt pair into a single hex value.
fn decode_u256(field: &AbiEventField, low: &str, high: &str) -> Result<Value, AbiError> {
    let parse = |s: &str| -> Result<u128, AbiError> {
        let stripped = normalize_felt(s);
        u128::from_str_radix(stripped.trim_start_matches("0x"), 16).map_err(|e| {
            AbiError::InvalidFelt {
                field: field.name.clone(),
                reason: e.to_string(),
            }
        })
    };
    let low = parse(low)?;
    let high = parse(high)?;
    let hex = if high == 0 {
        format!("0x{low:x}")
    } else {
        format!("0x{high:x}{low:032x}")
    };
    Ok(Value::String(hex))
}

/// The events declared by one contract's ABI, keyed by fully-qualified name.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    events: HashMap<String, AbiEvent>,
}

impl ContractAbi {
    /// Parse a Cairo ABI JSON array, keeping the struct-kind event entries.
    pub fn parse(abi: &Value) -> Result<Self, AbiError> {
        let entries = abi.as_array().ok_or_else(|| AbiError::Malformed {
            reason: "ABI is not a JSON array".into(),
        })?;

        let mut events = HashMap::new();
        for entry in entries {
            if entry.get("type").and_then(Value::as_str) != Some("event") {
                continue;
            }
            // Enum-kind entries are containers for their variants; the
            // selectors on the wire belong to the struct-kind events.
            if entry.get("kind").and_then(Value::as_str) == Some("enum") {
                continue;
            }
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| AbiError::Malformed {
                    reason: "event entry without a name".into(),
                })?
                .to_string();

            let mut fields = Vec::new();
            if let Some(members) = entry.get("members").and_then(Value::as_array) {
                for member in members {
                    let field_name = member
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| AbiError::Malformed {
                            reason: format!("member of '{name}' without a name"),
                        })?;
                    let ty = member
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("core::felt252");
                    let kind = match member.get("kind").and_then(Value::as_str) {
                        Some("key") => FieldKind::Key,
                        _ => FieldKind::Data,
                    };
                    fields.push(AbiEventField {
                        name: field_name.to_string(),
                        ty: ty.to_string(),
                        kind,
                    });
                }
            }

            let selector = event_selector(&name);
            events.insert(
                name.clone(),
                AbiEvent {
                    name,
                    selector,
                    fields,
                },
            );
        }
        Ok(Self { events })
    }

    /// Look up an event by name — fully qualified, or by trailing path
    /// segment when unambiguous (`"Transfer"` matches `…::Token::Transfer`).
    pub fn event(&self, name: &str) -> Result<&AbiEvent, AbiError> {
        if let Some(event) = self.events.get(name) {
            return Ok(event);
        }
        let mut matches = self
            .events
            .values()
            .filter(|e| e.name.rsplit("::").next() == Some(name));
        match (matches.next(), matches.next()) {
            (Some(event), None) => Ok(event),
            _ => Err(AbiError::EventNotFound { name: name.into() }),
        }
    }

    /// Number of declared events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
