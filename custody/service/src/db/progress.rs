// Copyright (c) 2024 The Botho Foundation

//! Scan cursors: per-address progress and the follower's chain cursor.

use bth_custody_core::{Amount, ChainCursor, ScanProgress};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{parse_amount, timestamp, Database};
use crate::error::DbError;

/// Outcome of one address pass, written after its discoveries are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord<'a> {
    pub address: &'a str,
    /// Highest block covered without gaps; `None` if nothing was covered
    pub covered: Option<u64>,
    pub native_balance: Option<Amount>,
    /// This pass ignored the zero-balance shortcut
    pub full_scan: bool,
    pub scanned_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
}

impl Database {
    /// Progress for `address`; a fresh record if it was never scanned.
    pub fn scan_progress(&self, address: &str) -> Result<ScanProgress, DbError> {
        let conn = self.conn.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT last_scanned_block, last_seen_balance, last_scan_at,
                       last_full_scan_at, next_eligible_at
                FROM scan_progress WHERE address = ?1
                "#,
                params![address],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((last_block, balance, last_scan, last_full, next_eligible)) = row else {
            return Ok(ScanProgress::new(address));
        };

        Ok(ScanProgress {
            address: address.to_string(),
            last_scanned_block: last_block.map(|b| b as u64),
            last_seen_balance: balance
                .map(|b| parse_amount("last_seen_balance", &b))
                .transpose()?,
            last_scan_at: timestamp(last_scan),
            last_full_scan_at: timestamp(last_full),
            next_eligible_at: timestamp(next_eligible),
        })
    }

    /// Store the outcome of a pass. `last_scanned_block` never moves back.
    pub fn record_scan(&self, record: &ScanRecord<'_>) -> Result<(), DbError> {
        let conn = self.conn.lock()?;
        conn.execute(
            r#"
            INSERT INTO scan_progress (
                address, last_scanned_block, last_seen_balance, last_scan_at,
                last_full_scan_at, next_eligible_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(address) DO UPDATE SET
                last_scanned_block = CASE
                    WHEN excluded.last_scanned_block IS NULL THEN last_scanned_block
                    WHEN last_scanned_block IS NULL THEN excluded.last_scanned_block
                    ELSE MAX(last_scanned_block, excluded.last_scanned_block)
                END,
                last_seen_balance = COALESCE(excluded.last_seen_balance, last_seen_balance),
                last_scan_at = excluded.last_scan_at,
                last_full_scan_at = COALESCE(excluded.last_full_scan_at, last_full_scan_at),
                next_eligible_at = excluded.next_eligible_at
            "#,
            params![
                record.address,
                record.covered.map(|b| b as i64),
                record.native_balance.map(|b| b.to_string()),
                record.scanned_at.timestamp(),
                record.full_scan.then(|| record.scanned_at.timestamp()),
                record.next_eligible_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Explicit manual reset; the only way progress may move backwards.
    ///
    /// `to_block = None` forgets the address entirely so the next pass
    /// starts from the initial lookback.
    pub fn reset_progress(&self, address: &str, to_block: Option<u64>) -> Result<bool, DbError> {
        let conn = self.conn.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE scan_progress
            SET last_scanned_block = ?1, next_eligible_at = NULL, last_full_scan_at = NULL
            WHERE address = ?2
            "#,
            params![to_block.map(|b| b as i64), address],
        )?;
        Ok(changed > 0)
    }

    /// Last fetched balance of `address` in `asset`.
    pub fn seen_balance(&self, address: &str, asset: &str) -> Result<Option<Amount>, DbError> {
        let conn = self.conn.lock()?;
        let balance: Option<String> = conn
            .query_row(
                "SELECT balance FROM asset_balances_seen WHERE address = ?1 AND asset = ?2",
                params![address, asset],
                |row| row.get(0),
            )
            .optional()?;
        balance
            .map(|b| parse_amount("balance", &b))
            .transpose()
    }

    pub fn record_seen_balance(
        &self,
        address: &str,
        asset: &str,
        balance: Amount,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock()?;
        conn.execute(
            r#"
            INSERT INTO asset_balances_seen (address, asset, balance, checked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(address, asset) DO UPDATE SET balance = ?3, checked_at = ?4
            "#,
            params![address, asset, balance.to_string(), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn chain_cursor(&self, chain_id: u64) -> Result<Option<ChainCursor>, DbError> {
        let conn = self.conn.lock()?;
        let cursor = conn
            .query_row(
                r#"
                SELECT last_block, last_hash, backfill_next, backfill_floor
                FROM chain_cursor WHERE chain_id = ?1
                "#,
                params![chain_id as i64],
                |row| {
                    Ok(ChainCursor {
                        chain_id,
                        last_block: row.get::<_, i64>(0)? as u64,
                        last_hash: row.get(1)?,
                        backfill_next: row.get::<_, Option<i64>>(2)?.map(|b| b as u64),
                        backfill_floor: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    /// Create the cursor if it does not exist; returns the stored cursor.
    pub fn init_cursor(&self, cursor: &ChainCursor) -> Result<ChainCursor, DbError> {
        {
            let conn = self.conn.lock()?;
            conn.execute(
                r#"
                INSERT INTO chain_cursor (
                    chain_id, last_block, last_hash, backfill_next, backfill_floor, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(chain_id) DO NOTHING
                "#,
                params![
                    cursor.chain_id as i64,
                    cursor.last_block as i64,
                    cursor.last_hash,
                    cursor.backfill_next.map(|b| b as i64),
                    cursor.backfill_floor as i64,
                    Utc::now().timestamp(),
                ],
            )?;
        }
        self.chain_cursor(cursor.chain_id)?.ok_or_else(|| {
            DbError::Corrupt(format!("cursor for chain {} vanished", cursor.chain_id))
        })
    }

    /// Move the cursor forward to `block` and remember the processed hashes.
    ///
    /// Returns `false` (and writes nothing) if the cursor is already at or
    /// past `block`.
    pub fn advance_cursor(
        &self,
        chain_id: u64,
        processed: &[(u64, String)],
    ) -> Result<bool, DbError> {
        let Some((block, hash)) = processed.last() else {
            return Ok(false);
        };

        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let moved = tx.execute(
            r#"
            UPDATE chain_cursor SET last_block = ?1, last_hash = ?2, updated_at = ?3
            WHERE chain_id = ?4 AND last_block < ?1
            "#,
            params![*block as i64, hash, Utc::now().timestamp(), chain_id as i64],
        )?;
        if moved == 0 {
            return Ok(false);
        }
        for (number, hash) in processed {
            tx.execute(
                r#"
                INSERT INTO followed_blocks (chain_id, block_number, block_hash)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(chain_id, block_number) DO UPDATE SET block_hash = ?3
                "#,
                params![chain_id as i64, *number as i64, hash],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Move the cursor back to the fork point after a reorg and forget the
    /// hashes above it.
    pub fn rewind_cursor(&self, chain_id: u64, block: u64, hash: &str) -> Result<(), DbError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            UPDATE chain_cursor SET last_block = ?1, last_hash = ?2, updated_at = ?3
            WHERE chain_id = ?4
            "#,
            params![block as i64, hash, Utc::now().timestamp(), chain_id as i64],
        )?;
        tx.execute(
            "DELETE FROM followed_blocks WHERE chain_id = ?1 AND block_number > ?2",
            params![chain_id as i64, block as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_backfill_next(&self, chain_id: u64, next: Option<u64>) -> Result<(), DbError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "UPDATE chain_cursor SET backfill_next = ?1, updated_at = ?2 WHERE chain_id = ?3",
            params![
                next.map(|b| b as i64),
                Utc::now().timestamp(),
                chain_id as i64
            ],
        )?;
        Ok(())
    }

    /// Hash recorded when the follower processed `height`.
    pub fn followed_hash(&self, chain_id: u64, height: u64) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock()?;
        let hash = conn
            .query_row(
                "SELECT block_hash FROM followed_blocks WHERE chain_id = ?1 AND block_number = ?2",
                params![chain_id as i64, height as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Drop remembered hashes below `height`.
    pub fn prune_followed_blocks(&self, chain_id: u64, height: u64) -> Result<u64, DbError> {
        let conn = self.conn.lock()?;
        let removed = conn.execute(
            "DELETE FROM followed_blocks WHERE chain_id = ?1 AND block_number < ?2",
            params![chain_id as i64, height as i64],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{addr, test_db};
    use chrono::Duration;

    fn record(address: &str, covered: Option<u64>) -> ScanRecord<'_> {
        let now = Utc::now();
        ScanRecord {
            address,
            covered,
            native_balance: Some(10),
            full_scan: false,
            scanned_at: now,
            next_eligible_at: now + Duration::seconds(30),
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let db = test_db();
        let a = addr(0xab);

        assert_eq!(db.scan_progress(&a).unwrap().last_scanned_block, None);

        db.record_scan(&record(&a, Some(110))).unwrap();
        assert_eq!(db.scan_progress(&a).unwrap().last_scanned_block, Some(110));

        // A pass that covered less never moves the cursor back
        db.record_scan(&record(&a, Some(105))).unwrap();
        db.record_scan(&record(&a, None)).unwrap();
        let progress = db.scan_progress(&a).unwrap();
        assert_eq!(progress.last_scanned_block, Some(110));
        assert_eq!(progress.last_seen_balance, Some(10));
        assert!(progress.next_eligible_at.is_some());
        assert!(progress.last_full_scan_at.is_none());

        db.record_scan(&record(&a, Some(120))).unwrap();
        assert_eq!(db.scan_progress(&a).unwrap().last_scanned_block, Some(120));
    }

    #[test]
    fn test_manual_reset_moves_back() {
        let db = test_db();
        let a = addr(0xab);
        db.record_scan(&ScanRecord {
            full_scan: true,
            ..record(&a, Some(500))
        })
        .unwrap();
        assert!(db.scan_progress(&a).unwrap().last_full_scan_at.is_some());

        assert!(db.reset_progress(&a, Some(100)).unwrap());
        let progress = db.scan_progress(&a).unwrap();
        assert_eq!(progress.last_scanned_block, Some(100));
        assert!(progress.next_eligible_at.is_none());
        assert!(progress.last_full_scan_at.is_none());

        assert!(!db.reset_progress(&addr(0xcd), None).unwrap());
    }

    #[test]
    fn test_seen_balances() {
        let db = test_db();
        let a = addr(0xab);
        assert_eq!(db.seen_balance(&a, "USDT").unwrap(), None);
        db.record_seen_balance(&a, "USDT", 5).unwrap();
        db.record_seen_balance(&a, "USDT", 0).unwrap();
        assert_eq!(db.seen_balance(&a, "USDT").unwrap(), Some(0));
    }

    #[test]
    fn test_chain_cursor_lifecycle() {
        let db = test_db();
        assert!(db.chain_cursor(1).unwrap().is_none());

        let cursor = db
            .init_cursor(&ChainCursor {
                chain_id: 1,
                last_block: 100,
                last_hash: "0x64".to_string(),
                backfill_next: Some(99),
                backfill_floor: 50,
            })
            .unwrap();
        assert_eq!(cursor.last_block, 100);

        // Re-init keeps the stored cursor
        let again = db
            .init_cursor(&ChainCursor {
                last_block: 5,
                ..cursor.clone()
            })
            .unwrap();
        assert_eq!(again.last_block, 100);

        let processed = vec![(101, "0x65".to_string()), (102, "0x66".to_string())];
        assert!(db.advance_cursor(1, &processed).unwrap());
        assert!(!db.advance_cursor(1, &processed).unwrap());
        assert_eq!(db.followed_hash(1, 101).unwrap().as_deref(), Some("0x65"));

        db.rewind_cursor(1, 101, "0x65").unwrap();
        let rewound = db.chain_cursor(1).unwrap().unwrap();
        assert_eq!(rewound.last_block, 101);
        assert_eq!(db.followed_hash(1, 102).unwrap(), None);

        db.set_backfill_next(1, None).unwrap();
        assert_eq!(db.chain_cursor(1).unwrap().unwrap().backfill_next, None);

        assert_eq!(db.prune_followed_blocks(1, 102).unwrap(), 1);
    }
}
