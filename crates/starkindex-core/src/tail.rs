//! Canonical tail — a sliding window of the most recent committed headers,
//! contiguous by parent-hash linkage. This is what the reorg detector walks
//! to find fork points.

use std::collections::VecDeque;

use crate::types::{normalize_felt, BlockHeader};

/// Sliding window of committed block headers, oldest first.
#[derive(Debug)]
pub struct CanonicalTail {
    window: VecDeque<BlockHeader>,
    capacity: usize,
}

impl CanonicalTail {
    /// Create a tail holding at most `capacity` headers. The capacity must
    /// exceed the chain's expected maximum reorg depth.
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a committed header, evicting from the front past capacity.
    ///
    /// Callers only push headers that extend the current tip; a debug
    /// assertion guards the linkage invariant.
    pub fn push(&mut self, header: BlockHeader) {
        if let Some(tip) = self.window.back() {
            debug_assert!(
                header.extends(tip),
                "tail push must extend the tip: tip={} new={}",
                tip.number,
                header.number
            );
        }
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(header);
    }

    /// The most recent committed header.
    pub fn tip(&self) -> Option<&BlockHeader> {
        self.window.back()
    }

    /// The oldest header still in the window.
    pub fn front(&self) -> Option<&BlockHeader> {
        self.window.front()
    }

    /// The committed hash at `number`, if still inside the window.
    pub fn hash_at(&self, number: u64) -> Option<String> {
        let front = self.window.front()?.number;
        if number < front {
            return None;
        }
        let idx = (number - front) as usize;
        self.window.get(idx).map(|h| normalize_felt(&h.hash))
    }

    /// Drop every header with `number >= from`, e.g. after a rollback.
    pub fn truncate_from(&mut self, from: u64) {
        while let Some(back) = self.window.back() {
            if back.number >= from {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
