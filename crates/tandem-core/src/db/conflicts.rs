//! Conflict repository

use crate::error::Result;
use crate::models::{Conflict, ConflictId, EntityKey, Resolution};
use rusqlite::{params, Connection};

use super::{optional, parse_column};

const COLUMNS: &str = "conflict_id, account_id, entity_type, entity_id, op_id, local_kind, \
     local_version, remote_version, local_payload, remote_payload, base_payload, state, \
     resolution, detected_at, resolved_at";

/// `SQLite` access to the `conflicts` table
pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conflict> {
        let conflict_id: String = row.get(0)?;
        let entity_type: String = row.get(2)?;
        let op_id: Option<String> = row.get(4)?;
        let local_kind: String = row.get(5)?;
        let state: String = row.get(11)?;
        let resolution: Option<String> = row.get(12)?;

        let resolution = resolution
            .map(|text| serde_json::from_str::<Resolution>(&text))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, e.into())
            })?;

        Ok(Conflict {
            conflict_id: parse_column(0, &conflict_id)?,
            account_id: row.get(1)?,
            entity_type: parse_column(2, &entity_type)?,
            entity_id: row.get(3)?,
            op_id: op_id.map(|id| parse_column(4, &id)).transpose()?,
            local_kind: parse_column(5, &local_kind)?,
            local_version: row.get(6)?,
            remote_version: row.get(7)?,
            local_payload: row.get(8)?,
            remote_payload: row.get(9)?,
            base_payload: row.get(10)?,
            state: parse_column(11, &state)?,
            resolution,
            detected_at: row.get(13)?,
            resolved_at: row.get(14)?,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Conflict>> {
        let mut stmt = self.conn.prepare(sql)?;
        let conflicts = stmt
            .query_map(params, Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    /// Insert or overwrite a conflict row
    pub fn save(&self, conflict: &Conflict) -> Result<()> {
        let resolution = conflict
            .resolution
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT OR REPLACE INTO conflicts
                (conflict_id, account_id, entity_type, entity_id, op_id, local_kind,
                 local_version, remote_version, local_payload, remote_payload, base_payload,
                 state, resolution, detected_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                conflict.conflict_id.as_str(),
                conflict.account_id,
                conflict.entity_type.as_str(),
                conflict.entity_id,
                conflict.op_id.map(|id| id.as_str()),
                conflict.local_kind.as_str(),
                conflict.local_version,
                conflict.remote_version,
                conflict.local_payload,
                conflict.remote_payload,
                conflict.base_payload,
                conflict.state.as_str(),
                resolution,
                conflict.detected_at,
                conflict.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, account_id: &str, conflict_id: &ConflictId) -> Result<Option<Conflict>> {
        optional(self.conn.query_row(
            &format!("SELECT {COLUMNS} FROM conflicts WHERE account_id = ?1 AND conflict_id = ?2"),
            params![account_id, conflict_id.as_str()],
            Self::parse_conflict,
        ))
    }

    /// The unresolved conflict on an entity, if any
    pub fn active_for_entity(&self, account_id: &str, key: &EntityKey) -> Result<Option<Conflict>> {
        optional(self.conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM conflicts
                 WHERE account_id = ?1 AND entity_type = ?2 AND entity_id = ?3
                   AND resolved_at IS NULL"
            ),
            params![account_id, key.entity_type.as_str(), key.entity_id],
            Self::parse_conflict,
        ))
    }

    pub fn list_active(&self, account_id: &str) -> Result<Vec<Conflict>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM conflicts
                 WHERE account_id = ?1 AND resolved_at IS NULL
                 ORDER BY detected_at"
            ),
            params![account_id],
        )
    }

    /// Resolved conflicts, most recent first
    pub fn list_resolved(&self, account_id: &str) -> Result<Vec<Conflict>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM conflicts
                 WHERE account_id = ?1 AND resolved_at IS NOT NULL
                 ORDER BY resolved_at DESC"
            ),
            params![account_id],
        )
    }

    pub fn count_active(&self, account_id: &str) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE account_id = ?1 AND resolved_at IS NULL",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn delete_active(&self, account_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM conflicts WHERE account_id = ?1 AND resolved_at IS NULL",
            params![account_id],
        )?;
        Ok(rows)
    }
}
