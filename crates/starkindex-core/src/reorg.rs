//! Reorg detection — validates each candidate block against the canonical
//! tail and emits a directive: accept, skip a duplicate, or roll back.
//!
//! After a `Reorg` directive the caller must roll storage back, call
//! [`ReorgDetector::rollback`], and re-drive candidates starting at
//! `from_block`; only then does the detector resume accepting.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::tail::CanonicalTail;
use crate::types::{felt_eq, normalize_felt, BlockCandidate, BlockHeader, Cursor};

/// Header-by-number access used for the ancestor walk when a fork is found.
#[async_trait]
pub trait HeaderLookup: Send + Sync {
    async fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError>;
}

/// What the pipeline should do with a candidate block.
#[derive(Debug)]
pub enum Directive {
    /// The candidate extends the canonical chain — persist it.
    Accept(BlockCandidate),
    /// Already committed with the same hash (seen on restart and replay).
    Duplicate { number: u64 },
    /// A fork: delete everything at `from_block` and above, then replay.
    Reorg { from_block: u64 },
}

/// Owns the canonical tail and judges candidates against it.
pub struct ReorgDetector {
    tail: CanonicalTail,
    cursor: Option<Cursor>,
    window: usize,
}

impl ReorgDetector {
    /// `window` is the maximum reorg depth (K); `cursor` seeds the detector
    /// with the persisted position when resuming.
    pub fn new(window: usize, cursor: Option<Cursor>) -> Self {
        Self {
            tail: CanonicalTail::new(window),
            cursor,
            window,
        }
    }

    /// The committed high-water mark as the detector sees it.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Judge one candidate. `lookup` is consulted only when a fork walk is
    /// needed.
    pub async fn decide<L>(
        &mut self,
        candidate: BlockCandidate,
        lookup: &L,
    ) -> Result<Directive, IndexerError>
    where
        L: HeaderLookup + ?Sized,
    {
        let Some((tip_number, tip_hash)) = self.tip() else {
            // Fresh start: nothing committed to link against.
            return Ok(Directive::Accept(candidate));
        };
        let header = &candidate.header;

        if header.number == tip_number + 1 {
            if felt_eq(&header.parent_hash, &tip_hash) {
                return Ok(Directive::Accept(candidate));
            }
            tracing::warn!(
                block = header.number,
                parent = %header.parent_hash,
                expected = %tip_hash,
                "parent hash mismatch at tip"
            );
            return self.walk_back(header, lookup).await;
        }

        if header.number <= tip_number {
            if let Some(committed) = self.committed_hash_at(header.number) {
                if felt_eq(&header.hash, &committed) {
                    return Ok(Directive::Duplicate {
                        number: header.number,
                    });
                }
            }
            tracing::warn!(
                block = header.number,
                tip = tip_number,
                "candidate below tip with unknown hash"
            );
            return self.walk_back(header, lookup).await;
        }

        // The source guarantees a contiguous stream; a gap is a bug upstream.
        Err(IndexerError::MalformedResponse(format!(
            "candidate {} leaves a gap above tip {tip_number}",
            header.number
        )))
    }

    /// Record a committed block: advance the cursor and extend the tail.
    pub fn record(&mut self, header: &BlockHeader) {
        self.cursor = Some(Cursor::new(header.number, normalize_felt(&header.hash)));
        self.tail.push(header.clone());
    }

    /// Reflect a completed rollback: truncate the tail and reset the cursor.
    pub fn rollback(&mut self, from_block: u64, new_cursor: Option<Cursor>) {
        self.tail.truncate_from(from_block);
        self.cursor = new_cursor;
    }

    fn tip(&self) -> Option<(u64, String)> {
        if let Some(tip) = self.tail.tip() {
            return Some((tip.number, normalize_felt(&tip.hash)));
        }
        self.cursor
            .as_ref()
            .map(|c| (c.block_number, normalize_felt(&c.block_hash)))
    }

    fn committed_hash_at(&self, number: u64) -> Option<String> {
        if let Some(hash) = self.tail.hash_at(number) {
            return Some(hash);
        }
        self.cursor
            .as_ref()
            .filter(|c| c.block_number == number)
            .map(|c| normalize_felt(&c.block_hash))
    }

    /// Walk the new chain's ancestry backwards until its parent hash matches
    /// a committed header. The match is the fork point; the rollback starts
    /// one block above it.
    async fn walk_back<L>(
        &self,
        header: &BlockHeader,
        lookup: &L,
    ) -> Result<Directive, IndexerError>
    where
        L: HeaderLookup + ?Sized,
    {
        // With an empty tail only the cursor links the chain: walk back the
        // single block it covers.
        if self.tail.is_empty() {
            let cursor = self.cursor.as_ref().expect("tip() implies a cursor");
            return Ok(Directive::Reorg {
                from_block: cursor.block_number,
            });
        }

        let front = self.tail.front().map(|h| h.number).unwrap_or(0);
        let mut number = header.number;
        let mut parent = normalize_felt(&header.parent_hash);

        loop {
            if number == 0 || number - 1 < front {
                return Err(IndexerError::DeepReorg {
                    at: header.number,
                    window: self.window,
                });
            }
            if self
                .committed_hash_at(number - 1)
                .is_some_and(|h| h == parent)
            {
                tracing::info!(fork_point = number - 1, "fork point located");
                return Ok(Directive::Reorg { from_block: number });
            }
            number -= 1;
            let ancestor = lookup.header_by_number(number).await?.ok_or_else(|| {
                IndexerError::MalformedResponse(format!(
                    "node has no header for block {number} during fork walk"
                ))
            })?;
            parent = normalize_felt(&ancestor.parent_hash);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
