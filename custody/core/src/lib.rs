// Copyright (c) 2024 The Botho Foundation

//! Core types for the custodial deposit reconciliation engine.
//!
//! This crate holds the domain model shared by the scanning front-ends and
//! the settlement jobs:
//!
//! - Monitored custodial addresses and address/topic encoding
//! - The token registry (native coin plus token contracts in scope)
//! - Deposits, their identity and their status machine
//! - Scan progress cursors and per-pass statistics
//! - Staking positions and daily accruals
//! - Configuration structures

pub mod address;
pub mod config;
pub mod deposit;
pub mod progress;
pub mod staking;
pub mod tokens;

pub use address::{normalize_address, AddressError, MonitoredAddress};
pub use config::{ConfigError, CustodyConfig};
pub use deposit::{
    confirmations_at, Amount, Deposit, DepositKey, DepositSource, DepositStatus,
    LedgerPosition, ObservedTransfer, UpsertOutcome,
};
pub use progress::{ChainCursor, ScanProgress, ScanRange, ScanStats};
pub use staking::{AccrualReport, StakingAccrual, StakingPosition, StakingStatus};
pub use tokens::{Asset, TokenRegistry, TRANSFER_TOPIC};
