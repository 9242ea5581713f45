// Copyright (c) 2024 The Botho Foundation

//! SQLite store: the single source of truth shared by every loop.
//!
//! Amounts are `u128` smallest units and are stored as decimal TEXT;
//! arithmetic on them happens in Rust inside `IMMEDIATE` transactions.

mod addresses;
mod balances;
mod deposits;
mod progress;
mod staking;

pub use balances::SettledDeposit;
pub use deposits::{DepositCounts, DepositWrite, ReadyDeposit};
pub use progress::ScanRecord;

use bth_custody_core::Amount;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{types::Type, Connection, Row};
use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;

use crate::error::DbError;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at `path` (`:memory:` for a scratch store).
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self, DbError> {
        if path == ":memory:" {
            return Self::open_in_memory();
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        info!(path, journal_mode = %mode, "Opened database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations.
    pub fn migrate(&self) -> Result<(), DbError> {
        let conn = self.conn.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS monitored_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                chain_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_addresses_chain ON monitored_addresses(chain_id, id);
            CREATE INDEX IF NOT EXISTS idx_addresses_lower ON monitored_addresses(lower(address));

            CREATE TABLE IF NOT EXISTS scan_progress (
                address TEXT PRIMARY KEY,
                last_scanned_block INTEGER,
                last_seen_balance TEXT,
                last_scan_at INTEGER,
                last_full_scan_at INTEGER,
                next_eligible_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS asset_balances_seen (
                address TEXT NOT NULL,
                asset TEXT NOT NULL,
                balance TEXT NOT NULL,
                checked_at INTEGER NOT NULL,
                PRIMARY KEY (address, asset)
            );

            CREATE TABLE IF NOT EXISTS chain_cursor (
                chain_id INTEGER PRIMARY KEY,
                last_block INTEGER NOT NULL,
                last_hash TEXT NOT NULL,
                backfill_next INTEGER,
                backfill_floor INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS followed_blocks (
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash TEXT NOT NULL,
                PRIMARY KEY (chain_id, block_number)
            );

            CREATE TABLE IF NOT EXISTS deposits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                to_address TEXT NOT NULL,
                from_address TEXT NOT NULL,
                token_symbol TEXT NOT NULL,
                token_address TEXT,
                amount TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash TEXT,
                status TEXT NOT NULL,
                confirmations INTEGER NOT NULL DEFAULT 0,
                credited INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_update_at INTEGER NOT NULL,
                UNIQUE (tx_hash, log_index)
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(status, credited);
            CREATE INDEX IF NOT EXISTS idx_deposits_to ON deposits(to_address);
            CREATE INDEX IF NOT EXISTS idx_deposits_block ON deposits(block_number);

            CREATE TABLE IF NOT EXISTS user_balances (
                user_id INTEGER NOT NULL,
                asset TEXT NOT NULL,
                balance TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, asset)
            );

            CREATE TABLE IF NOT EXISTS staking_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                asset TEXT NOT NULL,
                amount TEXT NOT NULL,
                daily_reward TEXT NOT NULL,
                accrued_total TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_staking_status ON staking_positions(status);

            CREATE TABLE IF NOT EXISTS staking_accruals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL REFERENCES staking_positions(id),
                accrual_date TEXT NOT NULL,
                amount TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (position_id, accrual_date)
            );
            "#,
        )?;

        Ok(())
    }
}

/// Parse an amount column.
pub(crate) fn parse_amount(column: &str, value: &str) -> Result<Amount, DbError> {
    value
        .parse()
        .map_err(|_| DbError::Corrupt(format!("{} is not an amount: {}", column, value)))
}

/// Parse a nullable epoch-seconds column.
pub(crate) fn timestamp(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

/// Read an amount column inside a row mapper.
pub(crate) fn amount_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Amount> {
    let text: String = row.get(index)?;
    text.parse()
        .map_err(|_| conversion_error(index, format!("not an amount: {}", text)))
}

/// Read a text column holding one of our enums.
pub(crate) fn parsed_at<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let text: String = row.get(index)?;
    text.parse().map_err(|e| conversion_error(index, e))
}

/// Read a non-null epoch-seconds column.
pub(crate) fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(index)?;
    timestamp(Some(secs)).ok_or_else(|| conversion_error(index, format!("bad timestamp {}", secs)))
}
