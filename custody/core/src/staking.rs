// Copyright (c) 2024 The Botho Foundation

//! Time-locked staking positions and their daily accruals.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::deposit::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakingStatus {
    Active,
    Matured,
    Cancelled,
}

impl StakingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakingStatus::Active => "active",
            StakingStatus::Matured => "matured",
            StakingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StakingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StakingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(StakingStatus::Active),
            "matured" => Ok(StakingStatus::Matured),
            "cancelled" => Ok(StakingStatus::Cancelled),
            _ => Err(format!("Unknown staking status: {}", s)),
        }
    }
}

/// A user's staking position. Created and cancelled elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingPosition {
    pub id: i64,
    pub user_id: i64,
    pub asset: String,
    pub amount: Amount,
    pub daily_reward: Amount,
    pub accrued_total: Amount,
    pub status: StakingStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl StakingPosition {
    /// Whether a reward accrues for `day`.
    pub fn accrues_on(&self, day: NaiveDate) -> bool {
        self.status == StakingStatus::Active && self.start_date <= day && day <= self.end_date
    }

    /// Whether the lock has expired as of `day`.
    pub fn has_matured(&self, day: NaiveDate) -> bool {
        self.end_date < day
    }
}

/// One day's reward for a position. Unique on `(position_id, accrual_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingAccrual {
    pub position_id: i64,
    pub accrual_date: NaiveDate,
    pub amount: Amount,
}

/// Outcome of one run of the daily accrual job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualReport {
    /// Positions credited a reward for the day
    pub accrued: u64,
    /// Positions that already had the day's accrual
    pub already_accrued: u64,
    /// Positions moved from active to matured
    pub matured: u64,
}
