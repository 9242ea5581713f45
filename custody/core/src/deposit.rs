// Copyright (c) 2024 The Botho Foundation

//! Deposit types and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Amount in the asset's smallest unit.
pub type Amount = u128;

/// Stored `log_index` for native transfers, which carry no log.
pub const NATIVE_LOG_INDEX: i64 = -1;

/// Status of a deposit.
///
/// Transitions: `Pending -> Confirmed`, and any state to `Orphaned` when the
/// containing block stops being canonical. An orphaned deposit may be revived
/// if the transaction is re-included in a canonical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Seen on chain, below the required confirmation depth
    Pending,
    /// Reached the required confirmation depth
    Confirmed,
    /// The containing block was replaced by a reorg; no longer valid
    Orphaned,
}

impl DepositStatus {
    /// Status implied by a confirmation count.
    pub fn for_confirmations(confirmations: u64, required: u64) -> Self {
        if confirmations >= required {
            DepositStatus::Confirmed
        } else {
            DepositStatus::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "confirmed" => Ok(DepositStatus::Confirmed),
            "orphaned" => Ok(DepositStatus::Orphaned),
            _ => Err(format!("Unknown deposit status: {}", s)),
        }
    }
}

/// Which component recorded (or last re-observed) a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositSource {
    /// Per-address paging scanner
    Scanner,
    /// Sequential block follower
    Follower,
    /// Sweeper hook after consolidating an address into treasury
    Sweeper,
}

impl DepositSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositSource::Scanner => "scanner",
            DepositSource::Follower => "follower",
            DepositSource::Sweeper => "sweeper",
        }
    }
}

impl std::fmt::Display for DepositSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DepositSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scanner" => Ok(DepositSource::Scanner),
            "follower" => Ok(DepositSource::Follower),
            "sweeper" => Ok(DepositSource::Sweeper),
            _ => Err(format!("Unknown deposit source: {}", s)),
        }
    }
}

/// Transaction identity of a deposit: the tx hash plus the log index for
/// token transfers. Native transfers have no log index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositKey {
    /// Lowercase 0x-prefixed transaction hash
    pub tx_hash: String,
    pub log_index: Option<u32>,
}

impl DepositKey {
    pub fn native(tx_hash: impl AsRef<str>) -> Self {
        Self {
            tx_hash: tx_hash.as_ref().to_ascii_lowercase(),
            log_index: None,
        }
    }

    pub fn token(tx_hash: impl AsRef<str>, log_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.as_ref().to_ascii_lowercase(),
            log_index: Some(log_index),
        }
    }

    /// Value stored in the `log_index` column.
    pub fn log_index_column(&self) -> i64 {
        self.log_index.map(i64::from).unwrap_or(NATIVE_LOG_INDEX)
    }

    pub fn from_columns(tx_hash: String, log_index: i64) -> Self {
        Self {
            tx_hash,
            log_index: u32::try_from(log_index).ok(),
        }
    }
}

impl std::fmt::Display for DepositKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.log_index {
            Some(index) => write!(f, "{}:{}", self.tx_hash, index),
            None => write!(f, "{}:native", self.tx_hash),
        }
    }
}

/// An inbound transfer as seen on chain, before it is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTransfer {
    pub key: DepositKey,
    pub to_address: String,
    pub from_address: String,
    pub token_symbol: String,
    /// `None` for native transfers
    pub token_address: Option<String>,
    pub amount: Amount,
    pub block_number: u64,
    pub block_hash: Option<String>,
}

/// A deposit row in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: i64,
    pub key: DepositKey,
    pub to_address: String,
    pub from_address: String,
    pub token_symbol: String,
    pub token_address: Option<String>,
    pub amount: Amount,
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub status: DepositStatus,
    pub confirmations: u64,
    pub credited: bool,
    pub source: DepositSource,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

/// Result of an idempotent ledger upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// First observation; a row was inserted
    New,
    /// Known row changed (more confirmations, confirmed, or revived)
    Updated,
    /// Known row and nothing to change
    Duplicate,
}

/// The part of a deposit that re-observation may change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPosition {
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub confirmations: u64,
    pub status: DepositStatus,
}

impl LedgerPosition {
    /// Whether `other` refers to the same block. Unknown hashes match.
    pub fn same_block(&self, other: &LedgerPosition) -> bool {
        self.block_number == other.block_number
            && match (&self.block_hash, &other.block_hash) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// Merge a fresh observation into this stored position.
    ///
    /// Returns `None` if nothing changes. In the same block, confirmations
    /// only grow and status only moves forward. An orphaned deposit stays
    /// orphaned unless it is seen in a different block, in which case the
    /// observation replaces it. A live deposit seen in a different block
    /// follows the observation but never leaves `Confirmed`.
    pub fn reconcile(&self, observed: &LedgerPosition) -> Option<LedgerPosition> {
        let same_block = self.same_block(observed);

        let next = match self.status {
            DepositStatus::Orphaned if same_block => return None,
            DepositStatus::Orphaned => observed.clone(),
            _ if same_block => LedgerPosition {
                block_number: self.block_number,
                block_hash: self.block_hash.clone().or_else(|| observed.block_hash.clone()),
                confirmations: self.confirmations.max(observed.confirmations),
                status: if self.status == DepositStatus::Confirmed {
                    DepositStatus::Confirmed
                } else {
                    observed.status
                },
            },
            DepositStatus::Confirmed => LedgerPosition {
                status: DepositStatus::Confirmed,
                ..observed.clone()
            },
            DepositStatus::Pending => observed.clone(),
        };

        (next != *self).then_some(next)
    }
}

/// Confirmation depth of a block given the current head.
///
/// A block that is the head has one confirmation; a block above the head
/// (stale head read) has none.
pub fn confirmations_at(latest: u64, block_number: u64) -> u64 {
    if latest < block_number {
        0
    } else {
        latest - block_number + 1
    }
}
