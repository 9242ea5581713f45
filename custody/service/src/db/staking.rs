// Copyright (c) 2024 The Botho Foundation

//! Staking positions and the per-day accrual ledger.

use bth_custody_core::{AccrualReport, Amount, StakingAccrual, StakingPosition, StakingStatus};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{amount_at, parse_amount, parsed_at, Database};
use crate::error::DbError;

const DATE_FORMAT: &str = "%Y-%m-%d";

fn date_at(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(index)?;
    NaiveDate::parse_from_str(&text, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<StakingPosition> {
    Ok(StakingPosition {
        id: row.get(0)?,
        user_id: row.get(1)?,
        asset: row.get(2)?,
        amount: amount_at(row, 3)?,
        daily_reward: amount_at(row, 4)?,
        accrued_total: amount_at(row, 5)?,
        status: parsed_at(row, 6)?,
        start_date: date_at(row, 7)?,
        end_date: date_at(row, 8)?,
    })
}

impl Database {
    /// Create a position. Positions are normally opened by the API layer.
    pub fn insert_staking_position(
        &self,
        user_id: i64,
        asset: &str,
        amount: Amount,
        daily_reward: Amount,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock()?;
        conn.execute(
            r#"
            INSERT INTO staking_positions (
                user_id, asset, amount, daily_reward, accrued_total, status, start_date, end_date
            ) VALUES (?1, ?2, ?3, ?4, '0', ?5, ?6, ?7)
            "#,
            params![
                user_id,
                asset,
                amount.to_string(),
                daily_reward.to_string(),
                StakingStatus::Active.as_str(),
                start_date.format(DATE_FORMAT).to_string(),
                end_date.format(DATE_FORMAT).to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn staking_position(&self, id: i64) -> Result<Option<StakingPosition>, DbError> {
        let conn = self.conn.lock()?;
        let position = conn
            .query_row(
                r#"
                SELECT id, user_id, asset, amount, daily_reward, accrued_total, status,
                       start_date, end_date
                FROM staking_positions WHERE id = ?1
                "#,
                params![id],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    pub fn staking_accruals(&self, position_id: i64) -> Result<Vec<StakingAccrual>, DbError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT position_id, accrual_date, amount FROM staking_accruals
            WHERE position_id = ?1 ORDER BY accrual_date ASC
            "#,
        )?;
        let accruals = stmt
            .query_map(params![position_id], |row| {
                Ok(StakingAccrual {
                    position_id: row.get(0)?,
                    accrual_date: date_at(row, 1)?,
                    amount: amount_at(row, 2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accruals)
    }

    /// Accrue `day`'s reward for every active position covering it, then
    /// mature positions whose lock ended before `day`.
    ///
    /// One transaction; the `(position_id, accrual_date)` key makes a rerun
    /// for the same day a no-op.
    pub fn accrue_daily(&self, day: NaiveDate) -> Result<AccrualReport, DbError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp();
        let day_text = day.format(DATE_FORMAT).to_string();
        let mut report = AccrualReport::default();

        let active: Vec<StakingPosition> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, user_id, asset, amount, daily_reward, accrued_total, status,
                       start_date, end_date
                FROM staking_positions
                WHERE status = 'active' AND start_date <= ?1
                ORDER BY id ASC
                "#,
            )?;
            let rows = stmt
                .query_map(params![day_text], row_to_position)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for position in &active {
            if position.has_matured(day) {
                let changed = tx.execute(
                    r#"
                    UPDATE staking_positions SET status = 'matured'
                    WHERE id = ?1 AND status = 'active'
                    "#,
                    params![position.id],
                )?;
                report.matured += changed as u64;
                continue;
            }
            if !position.accrues_on(day) {
                continue;
            }

            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO staking_accruals
                    (position_id, accrual_date, amount, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![position.id, day_text, position.daily_reward.to_string(), now],
            )?;
            if inserted == 0 {
                report.already_accrued += 1;
                continue;
            }

            let total = position
                .accrued_total
                .checked_add(position.daily_reward)
                .ok_or_else(|| {
                    DbError::Corrupt(format!("accrued total overflow for position {}", position.id))
                })?;
            tx.execute(
                "UPDATE staking_positions SET accrued_total = ?1 WHERE id = ?2",
                params![total.to_string(), position.id],
            )?;
            report.accrued += 1;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Total accrued across active positions, for the status report.
    pub fn staking_summary(&self) -> Result<(u64, Amount), DbError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare("SELECT accrued_total FROM staking_positions WHERE status = 'active'")?;
        let totals = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut sum: Amount = 0;
        for text in &totals {
            sum = sum.saturating_add(parse_amount("accrued_total", text)?);
        }
        Ok((totals.len() as u64, sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_accrual_once_per_day() {
        let db = test_db();
        let id = db
            .insert_staking_position(1, "ETH", 1_000, 25, date("2024-01-01"), date("2024-01-10"))
            .unwrap();

        let first = db.accrue_daily(date("2024-01-05")).unwrap();
        assert_eq!(first.accrued, 1);

        let rerun = db.accrue_daily(date("2024-01-05")).unwrap();
        assert_eq!(rerun.accrued, 0);
        assert_eq!(rerun.already_accrued, 1);

        let position = db.staking_position(id).unwrap().unwrap();
        assert_eq!(position.accrued_total, 25);
        assert_eq!(db.staking_accruals(id).unwrap().len(), 1);
    }

    #[test]
    fn test_matures_after_end_date_without_accrual() {
        let db = test_db();
        // 2.5 units of a 1-decimal asset
        let id = db
            .insert_staking_position(1, "ETH", 1_000, 25, date("2024-01-01"), date("2024-01-10"))
            .unwrap();

        db.accrue_daily(date("2024-01-10")).unwrap();
        let report = db.accrue_daily(date("2024-01-11")).unwrap();
        assert_eq!(report.accrued, 0);
        assert_eq!(report.matured, 1);

        let position = db.staking_position(id).unwrap().unwrap();
        assert_eq!(position.status, StakingStatus::Matured);
        assert_eq!(position.accrued_total, 25);
        assert_eq!(db.staking_accruals(id).unwrap().len(), 1);

        // Matured positions stay out of later runs
        let later = db.accrue_daily(date("2024-01-12")).unwrap();
        assert_eq!(later, AccrualReport::default());
    }

    #[test]
    fn test_not_started_positions_are_skipped() {
        let db = test_db();
        db.insert_staking_position(1, "ETH", 1_000, 25, date("2024-02-01"), date("2024-02-10"))
            .unwrap();
        let report = db.accrue_daily(date("2024-01-15")).unwrap();
        assert_eq!(report, AccrualReport::default());
        assert_eq!(db.staking_summary().unwrap(), (1, 0));
    }
}
