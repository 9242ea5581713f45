// Copyright (c) 2024 The Botho Foundation

//! Address-page driven front-end.
//!
//! Pages through monitored addresses by a strictly increasing id cursor and
//! scans the due ones with bounded concurrency. Each address moves
//! `Queued -> Scanning -> Done | Error` and is queued again when the cursor
//! wraps around.

use bth_custody_core::{config::ScannerSettings, MonitoredAddress, ScanStats};
use chrono::Utc;
use futures::{stream, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    metrics,
    scanner::AddressScanner,
    schedule::{RecurringTask, ShutdownSignal},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressState {
    Queued,
    Scanning,
    Done,
    Error,
}

/// Outcome of one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReport {
    pub page_len: usize,
    pub scanned: usize,
    /// Addresses in the page that were not due yet
    pub skipped: usize,
    /// Addresses whose pass failed or hit errors
    pub failed: usize,
    pub stats: ScanStats,
    pub credited: u64,
    /// The cursor reached the end and restarted from the first address
    pub wrapped: bool,
}

pub struct ScanWorker {
    scanner: AddressScanner,
    chain_id: u64,
    settings: ScannerSettings,
    cursor: i64,
    states: Arc<Mutex<HashMap<i64, AddressState>>>,
}

impl ScanWorker {
    pub fn new(scanner: AddressScanner, chain_id: u64, settings: ScannerSettings) -> Self {
        Self {
            scanner,
            chain_id,
            settings,
            cursor: 0,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state_of(&self, address_id: i64) -> Option<AddressState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&address_id).copied())
    }

    fn set_state(&self, address_id: i64, state: AddressState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(address_id, state);
        }
    }

    /// Scan the next page of addresses, then confirm and credit.
    pub async fn run_page(&mut self) -> Result<PageReport, EngineError> {
        let engine = self.scanner.engine().clone();
        let latest = engine.latest_block().await?;
        let mut report = PageReport::default();

        let page = engine
            .db()
            .monitored_page(self.chain_id, self.cursor, self.settings.page_size)?;
        if page.is_empty() {
            if self.cursor != 0 {
                self.cursor = 0;
                report.wrapped = true;
                if let Ok(mut states) = self.states.lock() {
                    for state in states.values_mut() {
                        *state = AddressState::Queued;
                    }
                }
                debug!("Address cursor wrapped");
            }
            return Ok(report);
        }
        report.page_len = page.len();
        if let Some(last) = page.last() {
            self.cursor = last.id;
        }

        let now = Utc::now();
        let mut due: Vec<MonitoredAddress> = Vec::with_capacity(page.len());
        for address in page {
            if engine.db().scan_progress(&address.address)?.is_due(now) {
                self.set_state(address.id, AddressState::Queued);
                due.push(address);
            } else {
                report.skipped += 1;
            }
        }

        let this = &*self;
        let results: Vec<(MonitoredAddress, Result<_, EngineError>)> = stream::iter(due)
            .map(|address| async move {
                this.set_state(address.id, AddressState::Scanning);
                let result = this.scanner.scan_address(&address, latest).await;
                (address, result)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (address, result) in results {
            report.scanned += 1;
            match result {
                Ok(scan) => {
                    report.stats.merge(&scan.stats);
                    if scan.stats.errors > 0 {
                        report.failed += 1;
                        self.set_state(address.id, AddressState::Error);
                    } else {
                        self.set_state(address.id, AddressState::Done);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    report.stats.errors += 1;
                    metrics::record_unit_error("address");
                    warn!(address = %address.address, "Address pass failed: {}", e);
                    self.set_state(address.id, AddressState::Error);
                }
            }
        }

        let settlement = engine.confirm_and_settle(latest).await?;
        report.stats.confirmed += settlement.confirmed;
        report.credited = settlement.credited;

        if report.stats.found_anything() || report.failed > 0 {
            info!(
                head = latest,
                scanned = report.scanned,
                failed = report.failed,
                credited = report.credited,
                stats = %report.stats,
                "Address page complete"
            );
        }
        Ok(report)
    }

    /// Refresh the monitored set: update the gauge and forget addresses that
    /// are no longer monitored.
    pub fn reload_addresses(&self) -> Result<usize, EngineError> {
        let addresses = self.scanner.engine().db().monitored_addresses(self.chain_id)?;
        metrics::ADDRESSES_MONITORED.set(addresses.len() as i64);
        if let Ok(mut states) = self.states.lock() {
            states.retain(|id, _| addresses.iter().any(|a| a.id == *id));
        }
        debug!(count = addresses.len(), "Reloaded monitored addresses");
        Ok(addresses.len())
    }

    /// Page forever until shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(chain_id = self.chain_id, "Starting address scan worker");

        let reload = Arc::new(AtomicBool::new(true));
        let flag = reload.clone();
        let period = Duration::from_secs(self.settings.reload_interval_secs.max(1));
        let reload_task = RecurringTask::new("address-reload", period).with_jitter(period / 10);
        let reload_handle = tokio::spawn(reload_task.run(shutdown.resubscribe(), move || {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::Relaxed);
            }
        }));

        let idle = Duration::from_millis(self.settings.idle_sleep_ms);
        let mut scanned_this_cycle = 0;
        loop {
            if reload.swap(false, Ordering::Relaxed) {
                if let Err(e) = self.reload_addresses() {
                    warn!("Failed to reload monitored addresses: {}", e);
                }
            }

            let pause = match self.run_page().await {
                Ok(report) => {
                    scanned_this_cycle += report.scanned;
                    if report.page_len == 0 {
                        let any = scanned_this_cycle > 0;
                        scanned_this_cycle = 0;
                        if report.wrapped && any {
                            Duration::ZERO
                        } else {
                            idle
                        }
                    } else {
                        Duration::ZERO
                    }
                }
                Err(e) => {
                    metrics::record_unit_error("page");
                    warn!("Address page failed: {}", e);
                    idle
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Address scan worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        let _ = reload_handle.await;
    }
}
