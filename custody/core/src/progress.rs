// Copyright (c) 2024 The Botho Foundation

//! Scan progress cursors and per-pass statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-address scan cursor.
///
/// `last_scanned_block` only moves forward, except through an explicit
/// manual reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub address: String,
    /// Highest block fully covered; `None` if never scanned
    pub last_scanned_block: Option<u64>,
    /// Native balance seen on the last balance check
    pub last_seen_balance: Option<u128>,
    pub last_scan_at: Option<DateTime<Utc>>,
    /// Last pass that scanned every asset regardless of balance
    pub last_full_scan_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl ScanProgress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_scanned_block: None,
            last_seen_balance: None,
            last_scan_at: None,
            last_full_scan_at: None,
            next_eligible_at: None,
        }
    }

    /// Whether the address may be scanned at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Whether the zero-balance shortcut must be bypassed this pass.
    pub fn needs_full_scan(&self, now: DateTime<Utc>, force_refresh: chrono::Duration) -> bool {
        match self.last_full_scan_at {
            Some(at) => now - at >= force_refresh,
            None => true,
        }
    }
}

/// Inclusive block window `[from, to]`. Empty when `from > to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    pub from: u64,
    pub to: u64,
}

impl ScanRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.to - self.from + 1
        }
    }

    /// Next window for an address, bounded by `max_blocks`.
    ///
    /// A never-scanned address starts `initial_lookback` blocks behind the
    /// head.
    pub fn next_for(
        last_scanned: Option<u64>,
        latest: u64,
        max_blocks: u64,
        initial_lookback: u64,
    ) -> Self {
        let from = match last_scanned {
            Some(block) => block + 1,
            None => latest.saturating_sub(initial_lookback),
        };
        let to = latest.min(from.saturating_add(max_blocks.max(1) - 1));
        Self { from, to }
    }

    /// Split into consecutive sub-windows of at most `size` blocks.
    pub fn chunks(&self, size: u64) -> Vec<ScanRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        if self.is_empty() {
            return out;
        }
        let mut start = self.from;
        loop {
            let end = self.to.min(start.saturating_add(size - 1));
            out.push(ScanRange::new(start, end));
            if end >= self.to {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl std::fmt::Display for ScanRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Global cursor for the sequential block follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub chain_id: u64,
    pub last_block: u64,
    pub last_hash: String,
    /// Next block the backfill walks down to; `None` when finished
    pub backfill_next: Option<u64>,
    /// Lowest block the backfill covers
    pub backfill_floor: u64,
}

/// Aggregate outcome of a scanning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub new: u64,
    pub updated: u64,
    pub duplicate: u64,
    pub confirmed: u64,
    pub errors: u64,
}

impl ScanStats {
    pub fn merge(&mut self, other: &ScanStats) {
        self.new += other.new;
        self.updated += other.updated;
        self.duplicate += other.duplicate;
        self.confirmed += other.confirmed;
        self.errors += other.errors;
    }

    pub fn found_anything(&self) -> bool {
        self.new + self.updated + self.duplicate > 0
    }
}

impl std::fmt::Display for ScanStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "new={} updated={} duplicate={} confirmed={} errors={}",
            self.new, self.updated, self.duplicate, self.confirmed, self.errors
        )
    }
}
