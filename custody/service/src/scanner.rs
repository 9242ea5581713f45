// Copyright (c) 2024 The Botho Foundation

//! Address scanner: one pass over one address's outstanding block range.

use bth_custody_core::{
    config::ScannerSettings, Amount, DepositSource, MonitoredAddress, ScanRange, ScanStats,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::{
    db::ScanRecord,
    engine::DepositEngine,
    error::EngineError,
    metrics,
};

/// Result of scanning one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressScan {
    pub range: ScanRange,
    /// Highest block covered without gaps, if any was
    pub covered: Option<u64>,
    pub stats: ScanStats,
}

/// Lower `covered` so it ends before a failed window starting at `failed_from`.
fn stop_before(covered: &mut Option<u64>, failed_from: u64) {
    *covered = match (*covered, failed_from.checked_sub(1)) {
        (Some(current), Some(bound)) => Some(current.min(bound)),
        _ => None,
    };
}

#[derive(Clone)]
pub struct AddressScanner {
    engine: DepositEngine,
    settings: ScannerSettings,
}

impl AddressScanner {
    pub fn new(engine: DepositEngine, settings: ScannerSettings) -> Self {
        Self { engine, settings }
    }

    pub fn engine(&self) -> &DepositEngine {
        &self.engine
    }

    /// Scan `address` from its progress cursor toward `latest`.
    ///
    /// Chain failures inside the pass are counted in the returned stats and
    /// stop progress at the failure point; only store failures are returned
    /// as `Err`.
    pub async fn scan_address(
        &self,
        address: &MonitoredAddress,
        latest: u64,
    ) -> Result<AddressScan, EngineError> {
        let started = std::time::Instant::now();
        let db = self.engine.db();
        let registry = self.engine.registry();
        let now = Utc::now();
        let progress = db.scan_progress(&address.address)?;

        let range = ScanRange::next_for(
            progress.last_scanned_block,
            latest,
            self.settings.block_window,
            self.settings.initial_lookback,
        );
        let next_eligible_at =
            now + ChronoDuration::seconds(self.settings.rescan_interval_secs as i64);

        if range.is_empty() {
            db.record_scan(&ScanRecord {
                address: &address.address,
                covered: None,
                native_balance: None,
                full_scan: false,
                scanned_at: now,
                next_eligible_at,
            })?;
            return Ok(AddressScan {
                range,
                covered: None,
                stats: ScanStats::default(),
            });
        }

        let full_scan = progress.needs_full_scan(
            now,
            ChronoDuration::seconds(self.settings.force_refresh_secs as i64),
        );
        let mut stats = ScanStats::default();

        // 1. Balance check decides which assets need a scan this pass
        let mut native_balance: Option<Amount> = None;
        let mut scan_native = false;
        let mut contracts = Vec::new();
        for asset in registry.all() {
            let wanted = match self.engine.fetch_balance(&address.address, asset).await {
                Ok(balance) => {
                    let seen = db.seen_balance(&address.address, &asset.symbol)?;
                    db.record_seen_balance(&address.address, &asset.symbol, balance)?;
                    if asset.is_native() {
                        native_balance = Some(balance);
                    }
                    full_scan || balance > 0 || seen != Some(balance)
                }
                Err(e) => {
                    stats.errors += 1;
                    metrics::record_unit_error("balance_check");
                    warn!(
                        address = %address.address,
                        asset = %asset.symbol,
                        "Balance check failed, scanning anyway: {}",
                        e
                    );
                    true
                }
            };
            if !wanted {
                continue;
            }
            match &asset.contract {
                Some(contract) => contracts.push(contract.clone()),
                None => scan_native = true,
            }
        }

        let mut covered = Some(range.to);
        let recipients = vec![address.address.to_ascii_lowercase()];

        // 2. Token transfer logs, chunked by block range
        if !contracts.is_empty() {
            for chunk in range.chunks(self.engine.settings().log_range) {
                let found = match self
                    .engine
                    .fetch_token_transfers(&contracts, &recipients, chunk)
                    .await
                {
                    Ok(found) => found,
                    Err(e) => {
                        stats.errors += 1;
                        metrics::record_unit_error("token_logs");
                        warn!(
                            address = %address.address,
                            range = %chunk,
                            "Token log scan failed: {}",
                            e
                        );
                        stop_before(&mut covered, chunk.from);
                        break;
                    }
                };
                let recorded = self
                    .engine
                    .record_transfers(&found, latest, DepositSource::Scanner)?;
                stats.merge(&recorded);
                tokio::task::yield_now().await;
            }
        }

        // 3. Native transfers, block by block in sub-batches
        if scan_native {
            let wanted: HashSet<String> = recipients.iter().cloned().collect();
            for batch in range.chunks(self.settings.native_batch_size) {
                let blocks = match self.engine.fetch_blocks(batch).await {
                    Ok(blocks) => blocks,
                    Err(e) => {
                        stats.errors += 1;
                        metrics::record_unit_error("native_blocks");
                        warn!(
                            address = %address.address,
                            range = %batch,
                            "Native block scan failed: {}",
                            e
                        );
                        stop_before(&mut covered, batch.from);
                        break;
                    }
                };
                let found = self.engine.native_transfers(&blocks, &wanted);
                let recorded = self
                    .engine
                    .record_transfers(&found, latest, DepositSource::Scanner)?;
                stats.merge(&recorded);
                tokio::task::yield_now().await;
            }
        }

        // 4. Advance only across what was covered without gaps
        let covered = covered.filter(|block| *block >= range.from);
        let caught_up = covered == Some(latest);
        db.record_scan(&ScanRecord {
            address: &address.address,
            covered,
            native_balance,
            full_scan,
            scanned_at: now,
            next_eligible_at: if caught_up || stats.errors > 0 {
                next_eligible_at
            } else {
                now
            },
        })?;

        metrics::ADDRESS_SCAN_SECONDS.observe(started.elapsed().as_secs_f64());
        if let Some(to) = covered {
            metrics::record_blocks("scanner", ScanRange::new(range.from, to));
        }
        debug!(
            address = %address.address,
            range = %range,
            covered = ?covered,
            stats = %stats,
            "Address pass complete"
        );

        Ok(AddressScan {
            range,
            covered,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::mock::MockChain,
        db::{
            test_utils::{addr, insert_raw_address, test_db, tx},
            Database,
        },
        engine::tests::{engine, USDT},
    };
    use bth_custody_core::{DepositKey, DepositStatus};
    use std::sync::{atomic::Ordering, Arc};

    fn settings() -> ScannerSettings {
        ScannerSettings {
            block_window: 11,
            native_batch_size: 3,
            initial_lookback: 10,
            ..ScannerSettings::default()
        }
    }

    fn monitored(db: &Database, byte: u8) -> MonitoredAddress {
        let id = db.insert_monitored_address(&addr(byte), byte as i64, 1).unwrap();
        MonitoredAddress {
            id,
            address: addr(byte),
            user_id: byte as i64,
            chain_id: 1,
        }
    }

    fn start_at(db: &Database, address: &str, block: u64) {
        db.record_scan(&ScanRecord {
            address,
            covered: Some(block),
            native_balance: None,
            full_scan: false,
            scanned_at: Utc::now(),
            next_eligible_at: Utc::now(),
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_token_deposit_scenario() {
        let db = test_db();
        let me = monitored(&db, 0xab);
        start_at(&db, &me.address, 99);

        let chain = Arc::new(MockChain::new(116));
        chain.add_token_transfer(105, &tx(1), 0, USDT, &addr(0x11), &me.address, 5);
        chain.set_balance(&me.address, Some(USDT), 5);

        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());
        let scan = scanner.scan_address(&me, 116).await.unwrap();
        assert_eq!(scan.range, ScanRange::new(100, 110));
        assert_eq!(scan.covered, Some(110));
        assert_eq!(scan.stats.new, 1);
        assert_eq!(scan.stats.errors, 0);

        let key = DepositKey::token(tx(1), 0);
        let row = db.get_deposit(&key).unwrap().unwrap();
        assert_eq!(row.status, DepositStatus::Confirmed);
        assert_eq!(row.confirmations, 12);
        assert!(!row.credited);
        assert_eq!(db.scan_progress(&me.address).unwrap().last_scanned_block, Some(110));

        scanner.engine().confirm_and_settle(116).await.unwrap();
        assert!(db.get_deposit(&key).unwrap().unwrap().credited);
        assert_eq!(db.balance(me.user_id, "USDT").unwrap(), 5);

        // A later pass over the same block sees it again without a second credit
        db.reset_progress(&me.address, Some(104)).unwrap();
        chain.set_head(120);
        let again = scanner.scan_address(&me, 120).await.unwrap();
        assert_eq!(again.range, ScanRange::new(105, 115));
        assert_eq!(again.stats.new, 0);
        assert_eq!(again.stats.updated + again.stats.duplicate, 1);

        scanner.engine().confirm_and_settle(120).await.unwrap();
        assert_eq!(db.balance(me.user_id, "USDT").unwrap(), 5);
        assert_eq!(db.get_deposit(&key).unwrap().unwrap().confirmations, 16);
    }

    #[tokio::test]
    async fn test_idle_address_costs_only_balance_checks() {
        let db = test_db();
        let me = monitored(&db, 0xab);
        let chain = Arc::new(MockChain::new(200));
        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());

        // First pass is a full scan and records zero balances
        scanner.scan_address(&me, 200).await.unwrap();
        let log_calls = chain.log_calls.load(Ordering::SeqCst);
        let block_calls = chain.block_calls.load(Ordering::SeqCst);
        assert!(log_calls > 0);
        assert!(block_calls > 0);

        chain.set_head(205);
        let scan = scanner.scan_address(&me, 205).await.unwrap();
        assert_eq!(scan.covered, Some(205));
        assert_eq!(chain.log_calls.load(Ordering::SeqCst), log_calls);
        assert_eq!(chain.block_calls.load(Ordering::SeqCst), block_calls);
        assert_eq!(db.scan_progress(&me.address).unwrap().last_scanned_block, Some(205));
    }

    #[tokio::test]
    async fn test_partial_failure_stops_progress_at_failure() {
        let db = test_db();
        let me = monitored(&db, 0xab);
        start_at(&db, &me.address, 99);

        let chain = Arc::new(MockChain::new(116));
        chain.set_balance(&me.address, Some(USDT), 5);
        chain.add_token_transfer(101, &tx(1), 0, USDT, &addr(0x11), &me.address, 5);
        // Log chunks are [100,104], [105,109], [110,110]
        chain.fail_logs_from(105);

        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());
        let scan = scanner.scan_address(&me, 116).await.unwrap();
        assert_eq!(scan.stats.errors, 1);
        assert_eq!(scan.stats.new, 1);
        assert_eq!(scan.covered, Some(104));
        assert_eq!(db.scan_progress(&me.address).unwrap().last_scanned_block, Some(104));

        // Retry re-covers the failed window
        chain.heal();
        let retry = scanner.scan_address(&me, 116).await.unwrap();
        assert_eq!(retry.range.from, 105);
        assert_eq!(retry.stats.errors, 0);
    }

    #[tokio::test]
    async fn test_native_failure_keeps_earlier_batches() {
        let db = test_db();
        let me = monitored(&db, 0xab);
        start_at(&db, &me.address, 99);

        let chain = Arc::new(MockChain::new(116));
        chain.set_balance(&me.address, None, 1_000);
        chain.add_native_transfer(100, &tx(2), &addr(0x11), &me.address, 1_000);
        // Native batches are [100,102], [103,105], ...
        chain.fail_block(104);

        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());
        let scan = scanner.scan_address(&me, 116).await.unwrap();
        assert_eq!(scan.covered, Some(102));
        assert_eq!(scan.stats.new, 1);
        assert_eq!(scan.stats.errors, 1);
    }

    #[tokio::test]
    async fn test_balance_failure_still_scans() {
        let db = test_db();
        let me = monitored(&db, 0xab);
        start_at(&db, &me.address, 99);

        let chain = Arc::new(MockChain::new(116));
        chain.add_token_transfer(105, &tx(1), 0, USDT, &addr(0x11), &me.address, 5);
        chain.fail_balances(true);

        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());
        let scan = scanner.scan_address(&me, 116).await.unwrap();
        assert_eq!(scan.stats.errors, 2);
        assert_eq!(scan.stats.new, 1);
        assert_eq!(scan.covered, Some(110));
    }

    #[tokio::test]
    async fn test_degenerate_window_is_noop() {
        let db = test_db();
        let me = monitored(&db, 0xab);
        start_at(&db, &me.address, 116);

        let chain = Arc::new(MockChain::new(116));
        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());
        let scan = scanner.scan_address(&me, 116).await.unwrap();
        assert!(scan.range.is_empty());
        assert_eq!(scan.stats, ScanStats::default());
        assert_eq!(chain.balance_calls.load(Ordering::SeqCst), 0);
        assert_eq!(db.scan_progress(&me.address).unwrap().last_scanned_block, Some(116));
    }

    #[tokio::test]
    async fn test_checksummed_address_is_credited() {
        let db = test_db();
        let checksummed = format!("0x{}", "aB".repeat(20));
        insert_raw_address(&db, &checksummed, 42, 1);
        let me = db.monitored_addresses(1).unwrap().remove(0);
        start_at(&db, &me.address, 99);

        let chain = Arc::new(MockChain::new(116));
        chain.add_token_transfer(105, &tx(1), 0, USDT, &addr(0x11), &checksummed, 5);
        chain.add_native_transfer(106, &tx(2), &addr(0x11), &checksummed, 1_000);
        chain.set_balance(&checksummed, Some(USDT), 5);
        chain.set_balance(&checksummed, None, 1_000);

        let scanner = AddressScanner::new(engine(chain.clone(), db.clone()), settings());
        let scan = scanner.scan_address(&me, 116).await.unwrap();
        assert_eq!(scan.stats.new, 2);

        let report = scanner.engine().confirm_and_settle(118).await.unwrap();
        assert_eq!(report.credited, 2);
        assert_eq!(db.balance(42, "USDT").unwrap(), 5);
        assert_eq!(db.balance(42, "ETH").unwrap(), 1_000);
    }
}
