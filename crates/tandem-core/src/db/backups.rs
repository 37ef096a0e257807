//! Backup snapshot repository

use crate::error::Result;
use crate::models::{BackupId, BackupReason, BackupSummary};
use rusqlite::{params, Connection};

use super::{optional, parse_column};

/// A stored snapshot before its body is decoded.
///
/// The header columns are enough to decide whether the body may be read at all.
#[derive(Debug, Clone)]
pub struct StoredBackup {
    pub backup_id: BackupId,
    pub account_id: String,
    pub schema_version: u32,
    pub consumed_at: Option<i64>,
    pub snapshot: String,
}

/// `SQLite` access to the `backups` table
pub struct BackupRepository<'a> {
    conn: &'a Connection,
}

impl<'a> BackupRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        backup_id: &BackupId,
        account_id: &str,
        device_id: &str,
        reason: BackupReason,
        schema_version: u32,
        entity_count: usize,
        snapshot: &str,
        created_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backups
                (backup_id, account_id, device_id, reason, schema_version, entity_count, snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                backup_id.as_str(),
                account_id,
                device_id,
                reason.as_str(),
                schema_version,
                entity_count,
                snapshot,
                created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, backup_id: &BackupId) -> Result<Option<StoredBackup>> {
        optional(self.conn.query_row(
            "SELECT backup_id, account_id, schema_version, consumed_at, snapshot
             FROM backups WHERE backup_id = ?1",
            params![backup_id.as_str()],
            |row| {
                let backup_id: String = row.get(0)?;
                Ok(StoredBackup {
                    backup_id: parse_column(0, &backup_id)?,
                    account_id: row.get(1)?,
                    schema_version: row.get(2)?,
                    consumed_at: row.get(3)?,
                    snapshot: row.get(4)?,
                })
            },
        ))
    }

    /// Backups for an account, newest first
    pub fn list(&self, account_id: &str) -> Result<Vec<BackupSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT backup_id, created_at, device_id, reason, schema_version, entity_count, consumed_at
             FROM backups WHERE account_id = ?1
             ORDER BY created_at DESC, backup_id DESC",
        )?;
        let backups = stmt
            .query_map(params![account_id], |row| {
                let backup_id: String = row.get(0)?;
                let reason: String = row.get(3)?;
                Ok(BackupSummary {
                    backup_id: parse_column(0, &backup_id)?,
                    created_at: row.get(1)?,
                    device_id: row.get(2)?,
                    reason: parse_column(3, &reason)?,
                    schema_version: row.get(4)?,
                    entity_count: row.get(5)?,
                    consumed_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(backups)
    }

    pub fn mark_consumed(&self, backup_id: &BackupId, now: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE backups SET consumed_at = ?2 WHERE backup_id = ?1",
            params![backup_id.as_str(), now],
        )?;
        Ok(())
    }
}
