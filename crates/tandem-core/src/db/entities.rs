//! Entity cache repository

use crate::error::Result;
use crate::models::{EntityKey, EntityRecord, EntityType};
use rusqlite::{params, Connection};
use serde_json::Value;

use super::{optional, parse_column};

const COLUMNS: &str =
    "entity_type, entity_id, payload, version, confirmed_payload, is_confirmed, updated_at";

/// `SQLite` access to the `entities` table
pub struct EntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> EntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        let entity_type: String = row.get(0)?;
        Ok(EntityRecord {
            entity_type: parse_column(0, &entity_type)?,
            entity_id: row.get(1)?,
            payload: row.get(2)?,
            version: row.get(3)?,
            confirmed_payload: row.get(4)?,
            is_confirmed: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn get(&self, account_id: &str, key: &EntityKey) -> Result<Option<EntityRecord>> {
        optional(self.conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM entities
                 WHERE account_id = ?1 AND entity_type = ?2 AND entity_id = ?3"
            ),
            params![account_id, key.entity_type.as_str(), key.entity_id],
            Self::parse_record,
        ))
    }

    /// List cached entities, optionally filtered by type. Deleted entities are
    /// included only when `include_deleted` is set.
    pub fn list(
        &self,
        account_id: &str,
        entity_type: Option<EntityType>,
        include_deleted: bool,
    ) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM entities
             WHERE account_id = ?1
               AND (?2 IS NULL OR entity_type = ?2)
               AND (?3 OR payload IS NOT NULL)
             ORDER BY entity_type, entity_id"
        ))?;

        let records = stmt
            .query_map(
                params![account_id, entity_type.map(EntityType::as_str), include_deleted],
                Self::parse_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Entities carrying a confirmed remote state.
    pub fn list_confirmed(&self, account_id: &str) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM entities
             WHERE account_id = ?1 AND version > 0 AND confirmed_payload IS NOT NULL
             ORDER BY entity_type, entity_id"
        ))?;

        let records = stmt
            .query_map(params![account_id], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn upsert(&self, account_id: &str, record: &EntityRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entities
                (account_id, entity_type, entity_id, payload, version, confirmed_payload, is_confirmed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (account_id, entity_type, entity_id) DO UPDATE SET
                payload = excluded.payload,
                version = excluded.version,
                confirmed_payload = excluded.confirmed_payload,
                is_confirmed = excluded.is_confirmed,
                updated_at = excluded.updated_at",
            params![
                account_id,
                record.entity_type.as_str(),
                record.entity_id,
                record.payload,
                record.version,
                record.confirmed_payload,
                record.is_confirmed,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Set the locally visible payload, keeping the confirmed remote state.
    ///
    /// Restoring "no payload" on an entity the remote store never saw drops
    /// the row entirely.
    pub fn set_local_payload(
        &self,
        account_id: &str,
        key: &EntityKey,
        payload: Option<Value>,
        now: i64,
    ) -> Result<()> {
        let existing = self.get(account_id, key)?;
        let (version, confirmed_payload) = existing
            .map(|record| (record.version, record.confirmed_payload))
            .unwrap_or_default();

        if payload.is_none() && version == 0 {
            return self.delete(account_id, key);
        }

        let record = EntityRecord {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            is_confirmed: version > 0 && payload == confirmed_payload,
            payload,
            version,
            confirmed_payload,
            updated_at: now,
        };
        self.upsert(account_id, &record)
    }

    /// Record a write the remote store acknowledged, leaving any newer local
    /// payload in place.
    pub fn set_confirmed(
        &self,
        account_id: &str,
        key: &EntityKey,
        version: i64,
        confirmed_payload: Option<Value>,
        now: i64,
    ) -> Result<()> {
        let payload = self.get(account_id, key)?.and_then(|record| record.payload);
        let record = EntityRecord {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            is_confirmed: payload == confirmed_payload,
            payload,
            version,
            confirmed_payload,
            updated_at: now,
        };
        self.upsert(account_id, &record)
    }

    /// Replace both local and confirmed state with the remote state.
    pub fn set_remote(
        &self,
        account_id: &str,
        key: &EntityKey,
        version: i64,
        payload: Option<Value>,
        now: i64,
    ) -> Result<()> {
        let record = EntityRecord {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            payload: payload.clone(),
            version,
            confirmed_payload: payload,
            is_confirmed: true,
            updated_at: now,
        };
        self.upsert(account_id, &record)
    }

    pub fn delete(&self, account_id: &str, key: &EntityKey) -> Result<()> {
        self.conn.execute(
            "DELETE FROM entities WHERE account_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
            params![account_id, key.entity_type.as_str(), key.entity_id],
        )?;
        Ok(())
    }

    pub fn delete_all(&self, account_id: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM entities WHERE account_id = ?1", params![account_id])?;
        Ok(rows)
    }
}
