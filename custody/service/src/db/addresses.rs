// Copyright (c) 2024 The Botho Foundation

//! Monitored deposit addresses. Provisioned elsewhere; read-only here apart
//! from [`Database::insert_monitored_address`], used by provisioning tools.

use bth_custody_core::{normalize_address, MonitoredAddress};
use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::error::{DbError, EngineError};

// Rows written by other provisioning tools may carry checksummed case.
fn row_to_address(row: &rusqlite::Row<'_>) -> rusqlite::Result<MonitoredAddress> {
    Ok(MonitoredAddress {
        id: row.get(0)?,
        address: row.get::<_, String>(1)?.to_ascii_lowercase(),
        user_id: row.get(2)?,
        chain_id: row.get::<_, i64>(3)? as u64,
    })
}

impl Database {
    /// Register an address; returns its id. Re-registering is a no-op.
    pub fn insert_monitored_address(
        &self,
        address: &str,
        user_id: i64,
        chain_id: u64,
    ) -> Result<i64, EngineError> {
        let address = normalize_address(address)?;
        let conn = self.conn.lock().map_err(DbError::from)?;

        conn.execute(
            r#"
            INSERT OR IGNORE INTO monitored_addresses (address, user_id, chain_id)
            SELECT ?1, ?2, ?3
            WHERE NOT EXISTS (
                SELECT 1 FROM monitored_addresses WHERE lower(address) = ?1
            )
            "#,
            params![address, user_id, chain_id as i64],
        )
        .map_err(DbError::from)?;

        let id = conn
            .query_row(
                "SELECT id FROM monitored_addresses WHERE lower(address) = ?1",
                params![address],
                |row| row.get(0),
            )
            .map_err(DbError::from)?;
        Ok(id)
    }

    /// Next page of addresses with id strictly greater than `after_id`.
    pub fn monitored_page(
        &self,
        chain_id: u64,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<MonitoredAddress>, DbError> {
        let conn = self.conn.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, address, user_id, chain_id
            FROM monitored_addresses
            WHERE chain_id = ?1 AND id > ?2
            ORDER BY id ASC
            LIMIT ?3
            "#,
        )?;

        let page = stmt
            .query_map(params![chain_id as i64, after_id, limit], row_to_address)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(page)
    }

    /// Every monitored address on the chain.
    pub fn monitored_addresses(&self, chain_id: u64) -> Result<Vec<MonitoredAddress>, DbError> {
        let conn = self.conn.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, address, user_id, chain_id
            FROM monitored_addresses
            WHERE chain_id = ?1
            ORDER BY id ASC
            "#,
        )?;

        let all = stmt
            .query_map(params![chain_id as i64], row_to_address)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(all)
    }

    pub fn monitored_count(&self, chain_id: u64) -> Result<u64, DbError> {
        let conn = self.conn.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM monitored_addresses WHERE chain_id = ?1",
            params![chain_id as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Owner of a monitored address.
    pub fn user_for_address(&self, address: &str) -> Result<Option<i64>, DbError> {
        let conn = self.conn.lock()?;
        let user = conn
            .query_row(
                "SELECT user_id FROM monitored_addresses WHERE lower(address) = lower(?1)",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_utils::{addr, insert_raw_address, test_db};

    #[test]
    fn test_paging_by_id_cursor() {
        let db = test_db();
        let ids: Vec<i64> = (1..=5u8)
            .map(|b| db.insert_monitored_address(&addr(b), b as i64, 1).unwrap())
            .collect();
        db.insert_monitored_address(&addr(9), 9, 56).unwrap();

        let first = db.monitored_page(1, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, ids[0]);

        let second = db.monitored_page(1, first[1].id, 10).unwrap();
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|a| a.chain_id == 1));

        assert!(db.monitored_page(1, ids[4], 10).unwrap().is_empty());
        assert_eq!(db.monitored_count(1).unwrap(), 5);
    }

    #[test]
    fn test_addresses_are_normalized_and_unique() {
        let db = test_db();
        let upper = format!("0x{}", "AB".repeat(20));
        let a = db.insert_monitored_address(&upper, 7, 1).unwrap();
        let b = db.insert_monitored_address(&addr(0xab), 7, 1).unwrap();
        assert_eq!(a, b);

        assert_eq!(db.user_for_address(&addr(0xab)).unwrap(), Some(7));
        assert_eq!(db.user_for_address(&addr(0xcd)).unwrap(), None);
        assert!(db.insert_monitored_address("not-an-address", 1, 1).is_err());
    }

    #[test]
    fn test_mixed_case_rows_read_lowercase() {
        let db = test_db();
        insert_raw_address(&db, &format!("0x{}", "Ab".repeat(20)), 8, 1);

        let all = db.monitored_addresses(1).unwrap();
        assert_eq!(all[0].address, addr(0xab));
        assert_eq!(db.monitored_page(1, 0, 10).unwrap()[0].address, addr(0xab));
        assert_eq!(db.user_for_address(&addr(0xab)).unwrap(), Some(8));

        // Registering the lowercase form does not create a second row
        let id = db.insert_monitored_address(&addr(0xab), 8, 1).unwrap();
        assert_eq!(id, all[0].id);
        assert_eq!(db.monitored_count(1).unwrap(), 1);
    }
}
