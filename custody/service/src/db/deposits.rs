// Copyright (c) 2024 The Botho Foundation

//! Deposit ledger: idempotent upsert keyed by `(tx_hash, log_index)`.

use bth_custody_core::{
    confirmations_at, Deposit, DepositKey, DepositSource, DepositStatus, LedgerPosition,
    ObservedTransfer, UpsertOutcome,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::warn;

use super::{amount_at, parse_amount, parsed_at, timestamp_at, Database};
use crate::error::DbError;

/// What an upsert did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositWrite {
    pub id: i64,
    pub outcome: UpsertOutcome,
    /// Status of the row after the write
    pub status: DepositStatus,
    /// The row became confirmed by this write
    pub newly_confirmed: bool,
}

/// A pending deposit deep enough to confirm, with the block hash it was
/// recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyDeposit {
    pub key: DepositKey,
    pub block_number: u64,
    pub block_hash: Option<String>,
}

/// Ledger totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepositCounts {
    pub pending: u64,
    pub confirmed: u64,
    pub orphaned: u64,
    /// Confirmed but not yet credited
    pub awaiting_credit: u64,
}

const DEPOSIT_COLUMNS: &str = r#"
    id, tx_hash, log_index, to_address, from_address, token_symbol, token_address,
    amount, block_number, block_hash, status, confirmations, credited, source,
    created_at, last_update_at
"#;

fn row_to_deposit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deposit> {
    let block_number: i64 = row.get(8)?;
    let confirmations: i64 = row.get(11)?;

    Ok(Deposit {
        id: row.get(0)?,
        key: DepositKey::from_columns(row.get(1)?, row.get(2)?),
        to_address: row.get(3)?,
        from_address: row.get(4)?,
        token_symbol: row.get(5)?,
        token_address: row.get(6)?,
        amount: amount_at(row, 7)?,
        block_number: block_number as u64,
        block_hash: row.get(9)?,
        status: parsed_at(row, 10)?,
        confirmations: confirmations as u64,
        credited: row.get(12)?,
        source: parsed_at(row, 13)?,
        created_at: timestamp_at(row, 14)?,
        last_update_at: timestamp_at(row, 15)?,
    })
}

impl Database {
    /// Insert a newly observed transfer, or reconcile it with the stored row.
    ///
    /// One `IMMEDIATE` transaction, so concurrent observers of the same
    /// transfer serialize on the unique key.
    pub fn upsert_deposit(
        &self,
        transfer: &ObservedTransfer,
        confirmations: u64,
        required_confirmations: u64,
        source: DepositSource,
    ) -> Result<DepositWrite, DbError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp();
        let status = DepositStatus::for_confirmations(confirmations, required_confirmations);

        let inserted = tx.execute(
            r#"
            INSERT INTO deposits (
                tx_hash, log_index, to_address, from_address, token_symbol, token_address,
                amount, block_number, block_hash, status, confirmations, credited, source,
                created_at, last_update_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13, ?13)
            ON CONFLICT(tx_hash, log_index) DO NOTHING
            "#,
            params![
                transfer.key.tx_hash,
                transfer.key.log_index_column(),
                transfer.to_address,
                transfer.from_address,
                transfer.token_symbol,
                transfer.token_address,
                transfer.amount.to_string(),
                transfer.block_number as i64,
                transfer.block_hash,
                status.as_str(),
                confirmations as i64,
                source.as_str(),
                now,
            ],
        )?;

        if inserted == 1 {
            let id = tx.last_insert_rowid();
            tx.commit()?;
            return Ok(DepositWrite {
                id,
                outcome: UpsertOutcome::New,
                status,
                newly_confirmed: status == DepositStatus::Confirmed,
            });
        }

        let (id, amount, block_number, block_hash, stored_status, stored_confirmations): (
            i64,
            String,
            i64,
            Option<String>,
            String,
            i64,
        ) = tx.query_row(
            r#"
            SELECT id, amount, block_number, block_hash, status, confirmations
            FROM deposits WHERE tx_hash = ?1 AND log_index = ?2
            "#,
            params![transfer.key.tx_hash, transfer.key.log_index_column()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;

        if parse_amount("amount", &amount)? != transfer.amount {
            warn!(
                deposit = %transfer.key,
                stored = %amount,
                observed = %transfer.amount,
                "Re-observed deposit disagrees on amount; keeping stored amount"
            );
        }

        let stored = LedgerPosition {
            block_number: block_number as u64,
            block_hash,
            confirmations: stored_confirmations as u64,
            status: stored_status.parse().map_err(DbError::Corrupt)?,
        };
        let observed = LedgerPosition {
            block_number: transfer.block_number,
            block_hash: transfer.block_hash.clone(),
            confirmations,
            status,
        };

        let write = match stored.reconcile(&observed) {
            None => DepositWrite {
                id,
                outcome: UpsertOutcome::Duplicate,
                status: stored.status,
                newly_confirmed: false,
            },
            Some(next) => {
                if !stored.same_block(&next) {
                    warn!(
                        deposit = %transfer.key,
                        from_block = stored.block_number,
                        to_block = next.block_number,
                        "Deposit re-observed in a different block"
                    );
                }
                tx.execute(
                    r#"
                    UPDATE deposits
                    SET block_number = ?1, block_hash = ?2, confirmations = ?3,
                        status = ?4, last_update_at = ?5
                    WHERE id = ?6
                    "#,
                    params![
                        next.block_number as i64,
                        next.block_hash,
                        next.confirmations as i64,
                        next.status.as_str(),
                        now,
                        id
                    ],
                )?;
                DepositWrite {
                    id,
                    outcome: UpsertOutcome::Updated,
                    status: next.status,
                    newly_confirmed: stored.status != DepositStatus::Confirmed
                        && next.status == DepositStatus::Confirmed,
                }
            }
        };

        tx.commit()?;
        Ok(write)
    }

    /// Flip a pending deposit in `block_number` to confirmed.
    ///
    /// Returns whether this call made the change, so callers can count
    /// confirmation events exactly once.
    pub fn mark_confirmed(&self, key: &DepositKey, block_number: u64) -> Result<bool, DbError> {
        let conn = self.conn.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE deposits SET status = 'confirmed', last_update_at = ?1
            WHERE tx_hash = ?2 AND log_index = ?3 AND block_number = ?4 AND status = 'pending'
            "#,
            params![
                Utc::now().timestamp(),
                key.tx_hash,
                key.log_index_column(),
                block_number as i64
            ],
        )?;
        Ok(changed > 0)
    }

    /// Recompute the depth of every pending deposit against `latest`.
    ///
    /// Status is left alone; returns the pending deposits that now meet
    /// `required`, for the caller to confirm through [`Database::mark_confirmed`].
    pub fn refresh_confirmations(
        &self,
        latest: u64,
        required: u64,
    ) -> Result<Vec<ReadyDeposit>, DbError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp();

        let pending: Vec<(i64, ReadyDeposit, u64)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, tx_hash, log_index, block_number, confirmations, block_hash
                FROM deposits
                WHERE status = 'pending' AND block_number <= ?1
                ORDER BY block_number ASC, id ASC
                "#,
            )?;
            let rows = stmt
                .query_map(params![latest as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        ReadyDeposit {
                            key: DepositKey::from_columns(row.get(1)?, row.get(2)?),
                            block_number: row.get::<_, i64>(3)? as u64,
                            block_hash: row.get(5)?,
                        },
                        row.get::<_, i64>(4)? as u64,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut ready = Vec::new();
        for (id, deposit, stored) in pending {
            let confirmations = confirmations_at(latest, deposit.block_number);
            if confirmations > stored {
                tx.execute(
                    r#"
                    UPDATE deposits SET confirmations = ?1, last_update_at = ?2
                    WHERE id = ?3 AND confirmations < ?1
                    "#,
                    params![confirmations as i64, now, id],
                )?;
            }
            if confirmations.max(stored) >= required {
                ready.push(deposit);
            }
        }

        tx.commit()?;
        Ok(ready)
    }

    /// Orphan every live deposit at `height` whose block hash is not
    /// `canonical_hash`. Returns the number of rows orphaned.
    pub fn orphan_at_height(&self, height: u64, canonical_hash: &str) -> Result<u64, DbError> {
        let conn = self.conn.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE deposits SET status = 'orphaned', last_update_at = ?1
            WHERE block_number = ?2 AND status != 'orphaned'
              AND (block_hash IS NULL OR block_hash != ?3)
            "#,
            params![Utc::now().timestamp(), height as i64, canonical_hash],
        )?;
        Ok(changed as u64)
    }

    pub fn get_deposit(&self, key: &DepositKey) -> Result<Option<Deposit>, DbError> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT {} FROM deposits WHERE tx_hash = ?1 AND log_index = ?2",
            DEPOSIT_COLUMNS
        );
        let deposit = conn
            .query_row(
                &sql,
                params![key.tx_hash, key.log_index_column()],
                row_to_deposit,
            )
            .optional()?;
        Ok(deposit)
    }

    pub fn deposits_for_address(&self, address: &str) -> Result<Vec<Deposit>, DbError> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT {} FROM deposits WHERE to_address = ?1 ORDER BY block_number ASC, id ASC",
            DEPOSIT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let deposits = stmt
            .query_map(params![address], row_to_deposit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deposits)
    }

    pub fn deposit_counts(&self) -> Result<DepositCounts, DbError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT status, credited, COUNT(*) FROM deposits GROUP BY status, credited
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = DepositCounts::default();
        for (status, credited, n) in rows {
            match status.parse().map_err(DbError::Corrupt)? {
                DepositStatus::Pending => counts.pending += n,
                DepositStatus::Confirmed => {
                    counts.confirmed += n;
                    if !credited {
                        counts.awaiting_credit += n;
                    }
                }
                DepositStatus::Orphaned => counts.orphaned += n,
            }
        }
        Ok(counts)
    }
}
