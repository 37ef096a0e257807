//! Per-account sync bookkeeping

use crate::error::Result;
use rusqlite::{params, Connection};

use super::optional;

/// Pull cursor returned by the remote store
pub const CURSOR_KEY: &str = "pull_cursor";
/// Unix ms of the last completed cycle
pub const LAST_SYNC_AT_KEY: &str = "last_sync_at";
/// Device id the remote store acknowledged for this account
pub const REGISTERED_DEVICE_KEY: &str = "registered_device";

/// `SQLite` access to the `sync_meta` key/value table
pub struct SyncMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SyncMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, account_id: &str, key: &str) -> Result<Option<String>> {
        optional(self.conn.query_row(
            "SELECT value FROM sync_meta WHERE account_id = ?1 AND key = ?2",
            params![account_id, key],
            |row| row.get(0),
        ))
    }

    pub fn set(&self, account_id: &str, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_meta (account_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (account_id, key) DO UPDATE SET value = excluded.value",
            params![account_id, key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, account_id: &str, key: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_meta WHERE account_id = ?1 AND key = ?2",
            params![account_id, key],
        )?;
        Ok(())
    }

    pub fn last_sync_at(&self, account_id: &str) -> Result<Option<i64>> {
        Ok(self
            .get(account_id, LAST_SYNC_AT_KEY)?
            .and_then(|value| value.parse().ok()))
    }
}
