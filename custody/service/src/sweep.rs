// Copyright (c) 2024 The Botho Foundation

//! Hook for the sweeper: record the inbound deposit behind a sweep.
//!
//! The sweeper moves funds out of a custodial address into treasury. By then
//! the scanner may already have moved past the block that paid the address,
//! so the sweeper reports the inbound transfer here. The write goes through
//! the same ledger upsert as scanning, so a deposit the scanner already found
//! is left as it is.

use bth_custody_core::{
    confirmations_at, normalize_address, Amount, DepositKey, DepositSource, DepositStatus,
    ObservedTransfer, UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{engine::DepositEngine, error::EngineError, metrics};

/// An inbound transfer reported by the sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweptDeposit {
    pub tx_hash: String,
    /// Log index for token transfers; `None` for the native coin
    #[serde(default)]
    pub log_index: Option<u32>,
    pub from_address: String,
    pub to_address: String,
    pub asset: String,
    pub amount: Amount,
    pub block_number: u64,
    #[serde(default)]
    pub block_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepRecord {
    pub deposit_id: i64,
    pub outcome: UpsertOutcome,
    pub status: DepositStatus,
    /// Deposits credited while settling after the write
    pub credited: u64,
}

#[derive(Clone)]
pub struct SweepRecorder {
    engine: DepositEngine,
}

impl SweepRecorder {
    pub fn new(engine: DepositEngine) -> Self {
        Self { engine }
    }

    fn observed(&self, swept: &SweptDeposit) -> Result<ObservedTransfer, EngineError> {
        let asset = self
            .engine
            .registry()
            .by_symbol(&swept.asset)
            .ok_or_else(|| EngineError::UnknownAsset(swept.asset.clone()))?;
        if asset.is_native() != swept.log_index.is_none() {
            return Err(EngineError::UnknownAsset(format!(
                "{} (log index does not match asset kind)",
                swept.asset
            )));
        }

        let to_address = normalize_address(&swept.to_address)?;
        if self.engine.db().user_for_address(&to_address)?.is_none() {
            return Err(EngineError::NotMonitored(to_address));
        }

        let tx_hash = swept.tx_hash.to_ascii_lowercase();
        let key = match swept.log_index {
            Some(index) => DepositKey::token(&tx_hash, index),
            None => DepositKey::native(&tx_hash),
        };
        Ok(ObservedTransfer {
            key,
            to_address,
            from_address: normalize_address(&swept.from_address)?,
            token_symbol: asset.symbol.clone(),
            token_address: asset.contract.clone(),
            amount: swept.amount,
            block_number: swept.block_number,
            block_hash: swept.block_hash.as_ref().map(|h| h.to_ascii_lowercase()),
        })
    }

    /// Upsert the swept transfer at the current head, then credit whatever
    /// is ready.
    pub async fn record(&self, swept: &SweptDeposit) -> Result<SweepRecord, EngineError> {
        let transfer = self.observed(swept)?;
        let latest = self.engine.latest_block().await?;
        let confirmations = confirmations_at(latest, transfer.block_number);

        let write = self.engine.db().upsert_deposit(
            &transfer,
            confirmations,
            self.engine.settings().required_confirmations,
            DepositSource::Sweeper,
        )?;
        metrics::record_upsert(write.outcome);
        if write.newly_confirmed {
            metrics::CONFIRMATIONS.inc();
        }

        let credited = self.engine.settle_pending()?;
        info!(
            deposit = %transfer.key,
            outcome = ?write.outcome,
            status = %write.status,
            credited,
            "Recorded swept deposit"
        );
        Ok(SweepRecord {
            deposit_id: write.id,
            outcome: write.outcome,
            status: write.status,
            credited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::mock::MockChain,
        db::test_utils::{addr, test_db, tx},
        engine::tests::{engine, USDT},
        scanner::AddressScanner,
    };
    use bth_custody_core::config::ScannerSettings;
    use std::sync::Arc;

    fn swept(log_index: Option<u32>, asset: &str, block: u64) -> SweptDeposit {
        SweptDeposit {
            tx_hash: tx(1),
            log_index,
            from_address: addr(0x11),
            to_address: addr(0xab),
            asset: asset.to_string(),
            amount: 5,
            block_number: block,
            block_hash: None,
        }
    }

    #[tokio::test]
    async fn test_records_and_credits_missed_deposit() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        let recorder = SweepRecorder::new(engine(Arc::new(MockChain::new(200)), db.clone()));

        let first = recorder.record(&swept(Some(0), "USDT", 105)).await.unwrap();
        assert_eq!(first.outcome, UpsertOutcome::New);
        assert_eq!(first.status, DepositStatus::Confirmed);
        assert_eq!(first.credited, 1);

        let again = recorder.record(&swept(Some(0), "USDT", 105)).await.unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Duplicate);
        assert_eq!(again.credited, 0);
        assert_eq!(db.balance(42, "USDT").unwrap(), 5);

        let deposit = db.get_deposit(&DepositKey::token(tx(1), 0)).unwrap().unwrap();
        assert_eq!(deposit.source, DepositSource::Sweeper);
    }

    #[tokio::test]
    async fn test_deposit_found_by_scanner_is_not_doubled() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        let chain = Arc::new(MockChain::new(120));
        chain.add_token_transfer(105, &tx(1), 0, USDT, &addr(0x11), &addr(0xab), 5);
        chain.set_balance(&addr(0xab), Some(USDT), 5);

        let engine = engine(chain, db.clone());
        let scanner = AddressScanner::new(
            engine.clone(),
            ScannerSettings {
                initial_lookback: 30,
                ..ScannerSettings::default()
            },
        );
        let monitored = db.monitored_addresses(1).unwrap().remove(0);
        scanner.scan_address(&monitored, 120).await.unwrap();
        engine.confirm_and_settle(120).await.unwrap();
        assert_eq!(db.balance(42, "USDT").unwrap(), 5);

        let record = SweepRecorder::new(engine)
            .record(&swept(Some(0), "USDT", 105))
            .await
            .unwrap();
        assert_ne!(record.outcome, UpsertOutcome::New);
        assert_eq!(record.credited, 0);
        assert_eq!(db.balance(42, "USDT").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_rejects_unknown_asset_and_address() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        let recorder = SweepRecorder::new(engine(Arc::new(MockChain::new(200)), db));

        assert!(matches!(
            recorder.record(&swept(Some(0), "DOGE", 105)).await,
            Err(EngineError::UnknownAsset(_))
        ));
        assert!(matches!(
            recorder.record(&swept(Some(0), "ETH", 105)).await,
            Err(EngineError::UnknownAsset(_))
        ));

        let mut stranger = swept(None, "ETH", 105);
        stranger.to_address = addr(0xcd);
        assert!(matches!(
            recorder.record(&stranger).await,
            Err(EngineError::NotMonitored(_))
        ));
    }
}
