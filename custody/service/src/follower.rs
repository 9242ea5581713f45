// Copyright (c) 2024 The Botho Foundation

//! Block-tip driven front-end.
//!
//! Walks blocks in order from a single chain cursor, recording native and
//! token transfers to every monitored address. Before each step the stored
//! hash at the cursor is compared with the canonical one; on a mismatch the
//! follower walks back through the hashes it remembers, orphaning deposits at
//! each replaced height, and rewinds to the fork point.
//!
//! A bounded backfill walks downward from the starting cursor, one batch at a
//! time, interleaved with tip following.

use bth_custody_core::{
    config::FollowerSettings, ChainCursor, DepositSource, ObservedTransfer, ScanRange, ScanStats,
};
use std::{collections::HashSet, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    chain::Block,
    engine::DepositEngine,
    error::{EngineError, RpcError},
    metrics,
    retry::RetryError,
    schedule::ShutdownSignal,
};

/// A detected reorg and how it was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reorg {
    /// Highest height still agreeing with the canonical chain
    pub fork_point: u64,
    /// Heights walked back over
    pub depth: u64,
    pub orphaned: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowReport {
    pub head: u64,
    pub processed: Option<ScanRange>,
    pub reorg: Option<Reorg>,
    pub stats: ScanStats,
    pub credited: u64,
}

impl FollowReport {
    /// Whether the step stopped short of the head.
    pub fn behind(&self) -> bool {
        self.processed.map_or(false, |range| range.to < self.head)
    }
}

pub struct BlockFollower {
    engine: DepositEngine,
    chain_id: u64,
    settings: FollowerSettings,
}

fn missing_block(height: u64) -> EngineError {
    EngineError::Chain(RetryError::Permanent {
        operation: "block_hash",
        source: RpcError::Malformed(format!("no canonical block at height {}", height)),
    })
}

impl BlockFollower {
    pub fn new(engine: DepositEngine, chain_id: u64, settings: FollowerSettings) -> Self {
        Self {
            engine,
            chain_id,
            settings,
        }
    }

    /// The monitored address set, read fresh for every batch so addresses
    /// provisioned between steps are matched from their first block.
    pub fn recipients(&self) -> Result<HashSet<String>, EngineError> {
        let recipients: HashSet<String> = self
            .engine
            .db()
            .monitored_addresses(self.chain_id)?
            .into_iter()
            .map(|a| a.address.to_ascii_lowercase())
            .collect();
        metrics::ADDRESSES_MONITORED.set(recipients.len() as i64);
        Ok(recipients)
    }

    /// Stored cursor, created one block below the head on first use.
    async fn cursor(&self, latest: u64) -> Result<ChainCursor, EngineError> {
        if let Some(cursor) = self.engine.db().chain_cursor(self.chain_id)? {
            return Ok(cursor);
        }

        let start = latest.saturating_sub(1);
        let hash = self
            .engine
            .chain()
            .block_hash(start)
            .await?
            .ok_or_else(|| missing_block(start))?;
        let cursor = self.engine.db().init_cursor(&ChainCursor {
            chain_id: self.chain_id,
            last_block: start,
            last_hash: hash.to_ascii_lowercase(),
            backfill_next: Some(start),
            backfill_floor: start.saturating_sub(self.settings.backfill_lookback),
        })?;
        info!(
            chain_id = self.chain_id,
            block = cursor.last_block,
            backfill_floor = cursor.backfill_floor,
            "Initialized chain cursor"
        );
        Ok(cursor)
    }

    /// Walk back from the cursor while remembered hashes disagree with the
    /// canonical chain, orphaning each replaced height, then rewind.
    async fn unwind(
        &self,
        cursor: &ChainCursor,
        canonical_tip: String,
    ) -> Result<Reorg, EngineError> {
        let chain = self.engine.chain();
        let floor = cursor.last_block.saturating_sub(self.settings.reorg_window);

        let mut height = cursor.last_block;
        let mut canonical = canonical_tip;
        let mut orphaned = 0;
        loop {
            orphaned += self.engine.orphan_height(height, &canonical)?;
            if height == 0 {
                break;
            }

            let below = height - 1;
            let canonical_below = chain
                .block_hash(below)
                .await?
                .ok_or_else(|| missing_block(below))?
                .to_ascii_lowercase();
            let replaced = self
                .engine
                .db()
                .followed_hash(self.chain_id, below)?
                .map_or(false, |stored| !stored.eq_ignore_ascii_case(&canonical_below));

            if replaced && below >= floor {
                height = below;
                canonical = canonical_below;
                continue;
            }
            if replaced {
                error!(
                    height = below,
                    window = self.settings.reorg_window,
                    "Reorg deeper than the remembered window; deposits below were not re-checked"
                );
            }
            height = below;
            canonical = canonical_below;
            break;
        }

        // `height` is now the fork point and `canonical` its hash.
        let fork_point = height;
        self.engine
            .db()
            .rewind_cursor(self.chain_id, fork_point, &canonical)?;

        let reorg = Reorg {
            fork_point,
            depth: cursor.last_block - fork_point,
            orphaned,
        };
        warn!(
            stored = %cursor.last_hash,
            fork_point,
            depth = reorg.depth,
            orphaned,
            "Chain reorganization detected"
        );
        Ok(reorg)
    }

    /// Transfers to monitored addresses in `blocks`, which cover `range`.
    async fn collect_transfers(
        &self,
        blocks: &[Block],
        range: ScanRange,
    ) -> Result<Vec<ObservedTransfer>, EngineError> {
        let wanted = self.recipients()?;
        let mut transfers = self.engine.native_transfers(blocks, &wanted);

        let contracts = self.engine.registry().contracts();
        let mut recipients: Vec<String> = wanted.into_iter().collect();
        recipients.sort();
        for chunk in range.chunks(self.engine.settings().log_range) {
            transfers.extend(
                self.engine
                    .fetch_token_transfers(&contracts, &recipients, chunk)
                    .await?,
            );
        }
        Ok(transfers)
    }

    /// Check for a reorg, then process up to `batch_size` new blocks.
    pub async fn step(&self) -> Result<FollowReport, EngineError> {
        let latest = self.engine.latest_block().await?;
        let mut report = FollowReport {
            head: latest,
            ..FollowReport::default()
        };

        let mut cursor = self.cursor(latest).await?;
        match self.engine.chain().block_hash(cursor.last_block).await? {
            None => {
                debug!(
                    cursor = cursor.last_block,
                    head = latest,
                    "Head is behind the cursor"
                );
                return Ok(report);
            }
            Some(hash) if hash.eq_ignore_ascii_case(&cursor.last_hash) => {}
            Some(hash) => {
                report.reorg = Some(self.unwind(&cursor, hash.to_ascii_lowercase()).await?);
                cursor = self
                    .engine
                    .db()
                    .chain_cursor(self.chain_id)?
                    .ok_or_else(|| missing_block(cursor.last_block))?;
            }
        }

        let from = cursor.last_block + 1;
        if from > latest {
            return Ok(report);
        }
        let to = latest.min(cursor.last_block + self.settings.batch_size.max(1));
        let blocks = self.engine.fetch_blocks(ScanRange::new(from, to)).await?;

        // Keep the prefix that links onto the cursor; the rest is retried.
        let mut linked = Vec::with_capacity(blocks.len());
        let mut parent = cursor.last_hash.clone();
        for block in blocks {
            if !block.parent_hash.eq_ignore_ascii_case(&parent) {
                warn!(
                    block = block.number,
                    "Block does not extend the followed chain; stopping batch"
                );
                break;
            }
            parent = block.hash.to_ascii_lowercase();
            linked.push(block);
        }
        let Some(last) = linked.last().map(|b| b.number) else {
            return Ok(report);
        };
        let range = ScanRange::new(from, last);

        let transfers: Vec<ObservedTransfer> = self
            .collect_transfers(&linked, range)
            .await?
            .into_iter()
            .filter(|t| t.block_number <= last)
            .collect();
        report.stats = self
            .engine
            .record_transfers(&transfers, latest, DepositSource::Follower)?;

        let processed: Vec<(u64, String)> = linked
            .iter()
            .map(|b| (b.number, b.hash.to_ascii_lowercase()))
            .collect();
        if !self.engine.db().advance_cursor(self.chain_id, &processed)? {
            warn!(block = last, "Cursor moved concurrently; skipping advance");
        }
        report.processed = Some(range);

        let settlement = self.engine.confirm_and_settle(latest).await?;
        report.stats.confirmed += settlement.confirmed;
        report.credited = settlement.credited;

        self.engine.db().prune_followed_blocks(
            self.chain_id,
            last.saturating_sub(self.settings.reorg_window),
        )?;
        metrics::FOLLOWED_BLOCK.set(last as i64);
        metrics::record_blocks("follower", range);

        if report.stats.found_anything() || report.credited > 0 {
            info!(
                blocks = %range,
                head = latest,
                stats = %report.stats,
                credited = report.credited,
                "Followed blocks"
            );
        }
        Ok(report)
    }

    /// Process the next backfill batch below the starting cursor. Returns the
    /// range covered, or `None` once the backfill is complete.
    pub async fn backfill_step(&self) -> Result<Option<ScanRange>, EngineError> {
        let Some(cursor) = self.engine.db().chain_cursor(self.chain_id)? else {
            return Ok(None);
        };
        let Some(next) = cursor.backfill_next else {
            return Ok(None);
        };
        if next < cursor.backfill_floor {
            self.engine.db().set_backfill_next(self.chain_id, None)?;
            return Ok(None);
        }

        let batch = self.settings.batch_size.max(1);
        let from = next.saturating_sub(batch - 1).max(cursor.backfill_floor);
        let range = ScanRange::new(from, next);

        let latest = self.engine.latest_block().await?;
        let blocks = self.engine.fetch_blocks(range).await?;
        let transfers = self.collect_transfers(&blocks, range).await?;
        let stats = self
            .engine
            .record_transfers(&transfers, latest, DepositSource::Follower)?;

        let remaining = if from > cursor.backfill_floor {
            Some(from - 1)
        } else {
            None
        };
        self.engine.db().set_backfill_next(self.chain_id, remaining)?;
        metrics::record_blocks("backfill", range);

        let credited = self.engine.settle_pending()?;
        if remaining.is_none() {
            info!(floor = cursor.backfill_floor, "Backfill complete");
        }
        if stats.found_anything() {
            info!(blocks = %range, stats = %stats, credited, "Backfilled blocks");
        }
        Ok(Some(range))
    }

    /// Follow the tip until shutdown.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(chain_id = self.chain_id, "Starting block follower");

        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        let mut backfilling = true;
        loop {
            let pause = match self.step().await {
                Ok(report) if report.behind() => Duration::ZERO,
                Ok(_) => poll,
                Err(e) => {
                    metrics::record_unit_error("block");
                    warn!("Follow step failed: {}", e);
                    poll
                }
            };

            if backfilling {
                match self.backfill_step().await {
                    Ok(range) => backfilling = range.is_some(),
                    Err(e) => {
                        metrics::record_unit_error("backfill");
                        warn!("Backfill step failed: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Block follower shutting down");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
