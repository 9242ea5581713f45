// Copyright (c) 2024 The Botho Foundation

//! User balances and the exactly-once deposit credit.

use bth_custody_core::Amount;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

use super::{parse_amount, Database};
use crate::error::DbError;

/// A deposit credited to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledDeposit {
    pub deposit_id: i64,
    pub user_id: i64,
    pub asset: String,
    pub amount: Amount,
    /// Balance after the credit
    pub balance: Amount,
}

/// Add `amount` to a user's balance inside `tx`; returns the new balance.
fn credit_balance(
    tx: &Transaction<'_>,
    user_id: i64,
    asset: &str,
    amount: Amount,
    now: i64,
) -> Result<Amount, DbError> {
    let current: Option<String> = tx
        .query_row(
            "SELECT balance FROM user_balances WHERE user_id = ?1 AND asset = ?2",
            params![user_id, asset],
            |row| row.get(0),
        )
        .optional()?;
    let current = match current {
        Some(text) => parse_amount("balance", &text)?,
        None => 0,
    };
    let balance = current.checked_add(amount).ok_or_else(|| {
        DbError::Corrupt(format!("balance overflow for user {} {}", user_id, asset))
    })?;

    tx.execute(
        r#"
        INSERT INTO user_balances (user_id, asset, balance, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(user_id, asset) DO UPDATE SET balance = ?3, updated_at = ?4
        "#,
        params![user_id, asset, balance.to_string(), now],
    )?;
    Ok(balance)
}

impl Database {
    /// Confirmed deposits to monitored addresses that are not yet credited.
    pub fn deposits_awaiting_credit(&self, limit: u32) -> Result<Vec<i64>, DbError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT d.id FROM deposits d
            JOIN monitored_addresses m ON lower(m.address) = lower(d.to_address)
            WHERE d.status = 'confirmed' AND d.credited = 0
            ORDER BY d.id ASC
            LIMIT ?1
            "#,
        )?;
        let ids = stmt
            .query_map(params![limit], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Credit one confirmed deposit and mark it credited, atomically.
    ///
    /// Returns `None` if the deposit is not (or no longer) eligible: already
    /// credited, not confirmed, or sent to an address nobody owns.
    pub fn settle_deposit(&self, deposit_id: i64) -> Result<Option<SettledDeposit>, DbError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp();

        let eligible: Option<(String, String, i64)> = tx
            .query_row(
                r#"
                SELECT d.amount, d.token_symbol, m.user_id FROM deposits d
                JOIN monitored_addresses m ON lower(m.address) = lower(d.to_address)
                WHERE d.id = ?1 AND d.status = 'confirmed' AND d.credited = 0
                "#,
                params![deposit_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((amount, asset, user_id)) = eligible else {
            return Ok(None);
        };
        let amount = parse_amount("amount", &amount)?;

        let flagged = tx.execute(
            r#"
            UPDATE deposits SET credited = 1, last_update_at = ?1
            WHERE id = ?2 AND credited = 0 AND status = 'confirmed'
            "#,
            params![now, deposit_id],
        )?;
        if flagged == 0 {
            return Ok(None);
        }

        let balance = credit_balance(&tx, user_id, &asset, amount, now)?;
        tx.commit()?;

        Ok(Some(SettledDeposit {
            deposit_id,
            user_id,
            asset,
            amount,
            balance,
        }))
    }

    pub fn balance(&self, user_id: i64, asset: &str) -> Result<Amount, DbError> {
        let conn = self.conn.lock()?;
        let balance: Option<String> = conn
            .query_row(
                "SELECT balance FROM user_balances WHERE user_id = ?1 AND asset = ?2",
                params![user_id, asset],
                |row| row.get(0),
            )
            .optional()?;
        match balance {
            Some(text) => parse_amount("balance", &text),
            None => Ok(0),
        }
    }

    /// Sum of all balances per asset, for the status report.
    pub fn balance_totals(&self) -> Result<Vec<(String, Amount)>, DbError> {
        let conn = self.conn.lock()?;
        let mut stmt =
            conn.prepare("SELECT asset, balance FROM user_balances ORDER BY asset ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut totals: Vec<(String, Amount)> = Vec::new();
        for (asset, text) in rows {
            let amount = parse_amount("balance", &text)?;
            match totals.last_mut() {
                Some((last, total)) if *last == asset => *total = total.saturating_add(amount),
                _ => totals.push((asset, amount)),
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{
        deposits::tests::token_transfer,
        test_utils::{addr, test_db},
    };
    use bth_custody_core::DepositSource;

    #[test]
    fn test_settle_credits_exactly_once() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        let transfer = token_transfer(1, &addr(0xab), 5, 105);
        let write = db
            .upsert_deposit(&transfer, 12, 12, DepositSource::Scanner)
            .unwrap();

        assert_eq!(db.deposits_awaiting_credit(10).unwrap(), vec![write.id]);

        let settled = db.settle_deposit(write.id).unwrap().unwrap();
        assert_eq!(settled.user_id, 42);
        assert_eq!(settled.amount, 5);
        assert_eq!(settled.balance, 5);

        assert!(db.settle_deposit(write.id).unwrap().is_none());
        assert_eq!(db.balance(42, "USDT").unwrap(), 5);
        assert!(db.deposits_awaiting_credit(10).unwrap().is_empty());
        assert!(db.get_deposit(&transfer.key).unwrap().unwrap().credited);
    }

    #[test]
    fn test_pending_and_orphaned_are_not_credited() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();

        let pending = db
            .upsert_deposit(&token_transfer(1, &addr(0xab), 5, 105), 3, 12, DepositSource::Scanner)
            .unwrap();
        assert!(db.settle_deposit(pending.id).unwrap().is_none());

        let orphan_transfer = token_transfer(2, &addr(0xab), 9, 106);
        let orphan = db
            .upsert_deposit(&orphan_transfer, 12, 12, DepositSource::Follower)
            .unwrap();
        db.orphan_at_height(106, "0xcanonical").unwrap();
        assert!(db.settle_deposit(orphan.id).unwrap().is_none());

        assert_eq!(db.balance(42, "USDT").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_settlement_credits_once() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        let write = db
            .upsert_deposit(&token_transfer(1, &addr(0xab), 5, 105), 12, 12, DepositSource::Scanner)
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.settle_deposit(write.id).unwrap())
            })
            .collect();
        let credited = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(credited, 1);
        assert_eq!(db.balance(42, "USDT").unwrap(), 5);
    }

    #[test]
    fn test_balances_accumulate() {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        db.insert_monitored_address(&addr(0xac), 43, 1).unwrap();
        for (i, (to, amount)) in [(0xab, 5u128), (0xab, 7), (0xac, 1)].into_iter().enumerate() {
            let write = db
                .upsert_deposit(
                    &token_transfer(i as u8 + 1, &addr(to), amount, 105),
                    12,
                    12,
                    DepositSource::Scanner,
                )
                .unwrap();
            db.settle_deposit(write.id).unwrap().unwrap();
        }

        assert_eq!(db.balance(42, "USDT").unwrap(), 12);
        assert_eq!(db.balance_totals().unwrap(), vec![("USDT".to_string(), 13)]);
    }
}
