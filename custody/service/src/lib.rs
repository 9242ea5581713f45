// Copyright (c) 2024 The Botho Foundation

//! Custodial deposit reconciliation service.
//!
//! Watches an account-based chain for native and token transfers into
//! monitored custodial addresses, records each transfer exactly once in a
//! SQLite ledger, tracks confirmation depth, orphans deposits replaced by
//! reorgs and credits user balances once a deposit is final.
//!
//! Two front-ends feed the same [`engine::DepositEngine`]:
//!
//! - [`worker::ScanWorker`] pages through monitored addresses and scans each
//!   one's outstanding block range
//! - [`follower::BlockFollower`] follows the chain tip block by block with
//!   reorg detection and a bounded backfill
//!
//! A daily [`staking::StakingJob`] accrues staking rewards, and
//! [`sweep::SweepRecorder`] lets the sweeper report inbound transfers.

pub mod chain;
pub mod db;
pub mod engine;
pub mod error;
pub mod follower;
pub mod metrics;
pub mod retry;
pub mod scanner;
pub mod schedule;
pub mod service;
pub mod staking;
pub mod sweep;
pub mod worker;

pub use engine::DepositEngine;
pub use error::{DbError, EngineError, RpcError};
pub use service::{CustodyService, RunMode};
