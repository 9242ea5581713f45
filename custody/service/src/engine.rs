// Copyright (c) 2024 The Botho Foundation

//! The deposit engine shared by both front-ends.
//!
//! The address scanner and the block follower only decide *which* blocks and
//! recipients to look at. Turning chain data into ledger rows, confirming
//! and crediting all happen here, so the two paths cannot drift apart.

use bth_custody_core::{
    address::address_to_topic, config::CustodyConfig, confirmations_at, Amount, Asset,
    DepositKey, DepositSource, DepositStatus, ObservedTransfer, ScanRange, ScanStats,
    TokenRegistry, UpsertOutcome,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

use crate::{
    chain::{Block, ChainClient, LogFilter},
    db::Database,
    error::{ChainError, DbError, EngineError},
    metrics,
};

/// Page size when draining the credit queue.
const SETTLE_PAGE: u32 = 200;

/// Knobs shared by both front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub required_confirmations: u64,
    /// Blocks per log query
    pub log_range: u64,
    /// Recipients per log filter
    pub address_group_size: usize,
}

impl EngineSettings {
    pub fn from_config(config: &CustodyConfig) -> Self {
        Self {
            required_confirmations: config.chain.required_confirmations,
            log_range: config.scanner.log_range,
            address_group_size: config.scanner.address_group_size,
        }
    }
}

/// Outcome of one confirmation-and-credit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementReport {
    pub confirmed: u64,
    pub credited: u64,
    /// Ready deposits whose block was replaced
    pub orphaned: u64,
}

#[derive(Clone)]
pub struct DepositEngine {
    chain: Arc<dyn ChainClient>,
    db: Database,
    registry: Arc<TokenRegistry>,
    settings: EngineSettings,
}

impl DepositEngine {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        db: Database,
        registry: Arc<TokenRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            chain,
            db,
            registry,
            settings,
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Current head, recorded in the head gauge.
    pub async fn latest_block(&self) -> Result<u64, ChainError> {
        let latest = self.chain.latest_block().await?;
        metrics::CHAIN_HEAD.set(latest as i64);
        Ok(latest)
    }

    /// Upsert observed transfers with their depth at `latest`.
    pub fn record_transfers(
        &self,
        transfers: &[ObservedTransfer],
        latest: u64,
        source: DepositSource,
    ) -> Result<ScanStats, DbError> {
        let mut stats = ScanStats::default();
        for transfer in transfers {
            let confirmations = confirmations_at(latest, transfer.block_number);
            let write = self.db.upsert_deposit(
                transfer,
                confirmations,
                self.settings.required_confirmations,
                source,
            )?;

            metrics::record_upsert(write.outcome);
            match write.outcome {
                UpsertOutcome::New => {
                    stats.new += 1;
                    info!(
                        deposit = %transfer.key,
                        to = %transfer.to_address,
                        asset = %transfer.token_symbol,
                        amount = %transfer.amount,
                        block = transfer.block_number,
                        confirmations,
                        "New deposit"
                    );
                }
                UpsertOutcome::Updated => stats.updated += 1,
                UpsertOutcome::Duplicate => stats.duplicate += 1,
            }
            if write.newly_confirmed {
                stats.confirmed += 1;
                metrics::CONFIRMATIONS.inc();
            }
            if write.status == DepositStatus::Orphaned {
                debug!(deposit = %transfer.key, "Observation of orphaned deposit ignored");
            }
        }
        Ok(stats)
    }

    /// Token transfers to `recipients` from `contracts` within `range`.
    ///
    /// `range` must fit in one log query; recipients are split into groups
    /// to respect provider filter limits.
    pub async fn fetch_token_transfers(
        &self,
        contracts: &[String],
        recipients: &[String],
        range: ScanRange,
    ) -> Result<Vec<ObservedTransfer>, EngineError> {
        if contracts.is_empty() || recipients.is_empty() || range.is_empty() {
            return Ok(Vec::new());
        }

        let wanted: HashSet<&str> = recipients.iter().map(String::as_str).collect();
        let mut transfers = Vec::new();

        for group in recipients.chunks(self.settings.address_group_size.max(1)) {
            let topics = group
                .iter()
                .map(|a| address_to_topic(a))
                .collect::<Result<Vec<_>, _>>()?;
            let filter = LogFilter::transfers_to(contracts.to_vec(), topics, range.from, range.to);

            for log in self.chain.get_logs(&filter).await? {
                let Some(decoded) = log.decode_transfer() else {
                    continue;
                };
                let Some(asset) = self.registry.by_contract(&log.address) else {
                    continue;
                };
                if decoded.amount == 0 || !wanted.contains(decoded.to.as_str()) {
                    continue;
                }
                transfers.push(ObservedTransfer {
                    key: DepositKey::token(&log.transaction_hash, log.log_index),
                    to_address: decoded.to,
                    from_address: decoded.from,
                    token_symbol: asset.symbol.clone(),
                    token_address: asset.contract.clone(),
                    amount: decoded.amount,
                    block_number: log.block_number,
                    block_hash: log.block_hash.map(|h| h.to_ascii_lowercase()),
                });
            }
        }

        Ok(transfers)
    }

    /// Full blocks for every height in `range`.
    pub async fn fetch_blocks(&self, range: ScanRange) -> Result<Vec<Block>, ChainError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let heights: Vec<u64> = (range.from..=range.to).collect();
        self.chain.get_blocks_with_transactions(&heights).await
    }

    /// Native-coin transfers in `blocks` whose recipient is in `recipients`.
    pub fn native_transfers(
        &self,
        blocks: &[Block],
        recipients: &HashSet<String>,
    ) -> Vec<ObservedTransfer> {
        let native = self.registry.native();
        let mut transfers = Vec::new();
        for block in blocks {
            for tx in &block.transactions {
                let Some(to) = tx.to.as_deref().map(str::to_ascii_lowercase) else {
                    continue;
                };
                if tx.value == 0 || !recipients.contains(&to) {
                    continue;
                }
                transfers.push(ObservedTransfer {
                    key: DepositKey::native(&tx.hash),
                    to_address: to,
                    from_address: tx.from.to_ascii_lowercase(),
                    token_symbol: native.symbol.clone(),
                    token_address: None,
                    amount: tx.value,
                    block_number: block.number,
                    block_hash: Some(block.hash.to_ascii_lowercase()),
                });
            }
        }
        transfers
    }

    /// Raise depth of pending deposits to `latest`, confirm those that
    /// reached the threshold, then credit every confirmed, uncredited one.
    ///
    /// A deposit is only confirmed while its block is still canonical.
    /// One recorded under a replaced block is orphaned instead; one whose
    /// height cannot be checked right now stays pending for the next pass.
    pub async fn confirm_and_settle(&self, latest: u64) -> Result<SettlementReport, EngineError> {
        let mut report = SettlementReport::default();

        let ready = self
            .db
            .refresh_confirmations(latest, self.settings.required_confirmations)?;
        let mut canonical: HashMap<u64, Option<String>> = HashMap::new();
        for deposit in ready {
            let height = deposit.block_number;
            if let Some(recorded) = deposit.block_hash.as_deref() {
                let hash = match canonical.get(&height) {
                    Some(hash) => hash.clone(),
                    None => match self.chain.block_hash(height).await {
                        Ok(hash) => {
                            let hash = hash.map(|h| h.to_ascii_lowercase());
                            canonical.insert(height, hash.clone());
                            hash
                        }
                        Err(e) => {
                            warn!(
                                deposit = %deposit.key,
                                block = height,
                                error = %e,
                                "Could not verify block hash"
                            );
                            continue;
                        }
                    },
                };
                match hash {
                    Some(hash) if !hash.eq_ignore_ascii_case(recorded) => {
                        report.orphaned += self.orphan_height(height, &hash)?;
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        debug!(deposit = %deposit.key, block = height, "Block not available yet");
                        continue;
                    }
                }
            }

            if self.db.mark_confirmed(&deposit.key, height)? {
                report.confirmed += 1;
                metrics::CONFIRMATIONS.inc();
                info!(deposit = %deposit.key, block = height, "Deposit confirmed");
            }
        }

        report.credited = self.settle_pending()?;
        Ok(report)
    }

    /// Credit every confirmed deposit not yet credited. Returns the number
    /// credited by this call.
    pub fn settle_pending(&self) -> Result<u64, DbError> {
        let mut credited = 0;
        loop {
            let ids = self.db.deposits_awaiting_credit(SETTLE_PAGE)?;
            let exhausted = (ids.len() as u32) < SETTLE_PAGE;

            let mut progressed = false;
            for id in ids {
                match self.db.settle_deposit(id)? {
                    Some(settled) => {
                        credited += 1;
                        progressed = true;
                        metrics::CREDITS.inc();
                        info!(
                            deposit_id = settled.deposit_id,
                            user_id = settled.user_id,
                            asset = %settled.asset,
                            amount = %settled.amount,
                            balance = %settled.balance,
                            "Credited deposit"
                        );
                    }
                    None => debug!(deposit_id = id, "Deposit already settled"),
                }
            }

            if exhausted || !progressed {
                return Ok(credited);
            }
        }
    }

    /// Orphan live deposits at `height` not in `canonical_hash`.
    pub fn orphan_height(&self, height: u64, canonical_hash: &str) -> Result<u64, DbError> {
        let orphaned = self.db.orphan_at_height(height, canonical_hash)?;
        if orphaned > 0 {
            metrics::ORPHANED.inc_by(orphaned);
            warn!(
                height,
                canonical = canonical_hash,
                orphaned,
                "Orphaned deposits after reorg"
            );
        }
        Ok(orphaned)
    }

    /// Balance of `address` in `asset`, for the scanner's balance check.
    pub async fn fetch_balance(
        &self,
        address: &str,
        asset: &Asset,
    ) -> Result<Amount, ChainError> {
        self.chain.get_balance(address, asset).await
    }
}
