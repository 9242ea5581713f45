// Copyright (c) 2024 The Botho Foundation

//! Daily staking accrual job.

use bth_custody_core::{config::StakingSettings, AccrualReport};
use chrono::{NaiveDate, Utc};
use std::time::Duration;
use tracing::{error, info};

use crate::{
    db::Database,
    error::DbError,
    metrics,
    schedule::{RecurringTask, ShutdownSignal},
};

pub struct StakingJob {
    db: Database,
    settings: StakingSettings,
}

impl StakingJob {
    pub fn new(db: Database, settings: StakingSettings) -> Self {
        Self { db, settings }
    }

    /// Accrue rewards for `day` and mature expired positions. Safe to rerun
    /// for the same day.
    pub fn run_for(&self, day: NaiveDate) -> Result<AccrualReport, DbError> {
        let report = self.db.accrue_daily(day)?;
        metrics::ACCRUALS.inc_by(report.accrued);
        info!(
            day = %day,
            accrued = report.accrued,
            already_accrued = report.already_accrued,
            matured = report.matured,
            "Staking accrual complete"
        );
        Ok(report)
    }

    /// Run once shortly after each UTC day rollover until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        if !self.settings.enabled {
            info!("Staking accrual disabled");
            return;
        }

        let task = RecurringTask::daily_after_rollover(
            "staking-accrual",
            Utc::now(),
            Duration::from_secs(self.settings.rollover_offset_secs),
        );
        task.run(shutdown, || {
            let day = Utc::now().date_naive();
            let result = self.run_for(day);
            async move {
                if let Err(e) = result {
                    metrics::record_unit_error("accrual");
                    error!(day = %day, "Staking accrual failed: {}", e);
                }
            }
        })
        .await;
    }
}
