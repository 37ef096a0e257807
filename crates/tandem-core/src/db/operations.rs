//! Operation queue repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::Result;
use crate::models::{EntityKey, OpId, OperationStatus, SyncOperation};
use rusqlite::{params, params_from_iter, Connection};

use super::{optional, parse_column};

const COLUMNS: &str = "seq, op_id, account_id, entity_type, entity_id, kind, payload, \
     idempotency_key, created_at, attempt_count, status, last_error, rollback_payload, rolled_back";

/// `SQLite` access to the `operations` table
pub struct OperationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> OperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncOperation> {
        let op_id: String = row.get(1)?;
        let entity_type: String = row.get(3)?;
        let kind: String = row.get(5)?;
        let status: String = row.get(10)?;
        Ok(SyncOperation {
            seq: row.get(0)?,
            op_id: parse_column(1, &op_id)?,
            account_id: row.get(2)?,
            entity_type: parse_column(3, &entity_type)?,
            entity_id: row.get(4)?,
            kind: parse_column(5, &kind)?,
            payload: row.get(6)?,
            idempotency_key: row.get(7)?,
            created_at: row.get(8)?,
            attempt_count: row.get(9)?,
            status: parse_column(10, &status)?,
            last_error: row.get(11)?,
            rollback: row.get(12)?,
            rolled_back: row.get(13)?,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncOperation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ops = stmt
            .query_map(params, Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    /// Insert a new operation, returning its queue sequence number
    pub fn insert(&self, op: &SyncOperation) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO operations
                (op_id, account_id, entity_type, entity_id, kind, payload, idempotency_key,
                 status, attempt_count, last_error, rollback_payload, rolled_back, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                op.op_id.as_str(),
                op.account_id,
                op.entity_type.as_str(),
                op.entity_id,
                op.kind.as_str(),
                op.payload,
                op.idempotency_key,
                op.status.as_str(),
                op.attempt_count,
                op.last_error,
                op.rollback,
                op.rolled_back,
                op.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, account_id: &str, op_id: &OpId) -> Result<Option<SyncOperation>> {
        optional(self.conn.query_row(
            &format!("SELECT {COLUMNS} FROM operations WHERE account_id = ?1 AND op_id = ?2"),
            params![account_id, op_id.as_str()],
            Self::parse_operation,
        ))
    }

    /// Operations in any of `statuses`, oldest first
    pub fn list_by_status(
        &self,
        account_id: &str,
        statuses: &[OperationStatus],
    ) -> Result<Vec<SyncOperation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (2..=statuses.len() + 1)
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut values = vec![account_id];
        values.extend(statuses.iter().map(|status| status.as_str()));
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM operations
                 WHERE account_id = ?1 AND status IN ({placeholders})
                 ORDER BY seq"
            ),
            params_from_iter(values),
        )
    }

    /// Failed operations of one entity whose edit is still shown locally,
    /// oldest first
    pub fn failed_for_entity(&self, account_id: &str, key: &EntityKey) -> Result<Vec<SyncOperation>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM operations
                 WHERE account_id = ?1 AND entity_type = ?2 AND entity_id = ?3
                   AND status = 'failed' AND rolled_back = 0
                 ORDER BY seq"
            ),
            params![account_id, key.entity_type.as_str(), key.entity_id],
        )
    }

    /// Pending and in-flight operations for one entity, oldest first
    pub fn active_for_entity(&self, account_id: &str, key: &EntityKey) -> Result<Vec<SyncOperation>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM operations
                 WHERE account_id = ?1 AND entity_type = ?2 AND entity_id = ?3
                   AND status IN ('pending', 'in_flight')
                 ORDER BY seq"
            ),
            params![account_id, key.entity_type.as_str(), key.entity_id],
        )
    }

    /// Pending operations queued after `seq` for one entity
    pub fn pending_after(
        &self,
        account_id: &str,
        key: &EntityKey,
        seq: i64,
    ) -> Result<Vec<SyncOperation>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM operations
                 WHERE account_id = ?1 AND entity_type = ?2 AND entity_id = ?3
                   AND status = 'pending' AND seq > ?4
                 ORDER BY seq"
            ),
            params![account_id, key.entity_type.as_str(), key.entity_id, seq],
        )
    }

    /// Pending operations that may be dispatched now, in queue order.
    ///
    /// An operation is held back while its entity has an in-flight write, an
    /// older pending write, or an unresolved conflict.
    pub fn dispatchable(&self, account_id: &str, limit: usize) -> Result<Vec<SyncOperation>> {
        self.query(
            "SELECT o.seq, o.op_id, o.account_id, o.entity_type, o.entity_id, o.kind, o.payload,
                    o.idempotency_key, o.created_at, o.attempt_count, o.status, o.last_error,
                    o.rollback_payload, o.rolled_back
             FROM operations o
             WHERE o.account_id = ?1
               AND o.status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM operations p
                   WHERE p.account_id = o.account_id
                     AND p.entity_type = o.entity_type
                     AND p.entity_id = o.entity_id
                     AND (p.status = 'in_flight' OR (p.status = 'pending' AND p.seq < o.seq))
               )
               AND NOT EXISTS (
                   SELECT 1 FROM conflicts c
                   WHERE c.account_id = o.account_id
                     AND c.entity_type = o.entity_type
                     AND c.entity_id = o.entity_id
                     AND c.resolved_at IS NULL
               )
             ORDER BY o.seq
             LIMIT ?2",
            params![account_id, limit as i64],
        )
    }

    pub fn set_status(
        &self,
        op_id: &OpId,
        status: OperationStatus,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE operations SET status = ?2, last_error = COALESCE(?3, last_error), updated_at = ?4
             WHERE op_id = ?1",
            params![op_id.as_str(), status.as_str(), last_error, now],
        )?;
        Ok(rows > 0)
    }

    /// Count one more dispatch attempt, returning the new total
    pub fn record_attempt(&self, op_id: &OpId, error: &str, now: i64) -> Result<u32> {
        let attempts = self.conn.query_row(
            "UPDATE operations
             SET attempt_count = attempt_count + 1, last_error = ?2, updated_at = ?3
             WHERE op_id = ?1
             RETURNING attempt_count",
            params![op_id.as_str(), error, now],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn set_rolled_back(&self, op_id: &OpId) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET rolled_back = 1 WHERE op_id = ?1",
            params![op_id.as_str()],
        )?;
        Ok(())
    }

    /// Move every in-flight operation back to pending
    pub fn reset_in_flight(&self, account_id: &str, now: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE operations SET status = 'pending', updated_at = ?2
             WHERE account_id = ?1 AND status = 'in_flight'",
            params![account_id, now],
        )?;
        Ok(rows)
    }

    pub fn count_by_status(&self, account_id: &str, status: OperationStatus) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE account_id = ?1 AND status = ?2",
            params![account_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn delete(&self, op_id: &OpId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM operations WHERE op_id = ?1", params![op_id.as_str()])?;
        Ok(rows > 0)
    }

    /// Delete every operation that has not been confirmed, returning how many
    /// were pending, in flight or failed.
    pub fn delete_unconfirmed(&self, account_id: &str) -> Result<usize> {
        let discarded = self.conn.execute(
            "DELETE FROM operations
             WHERE account_id = ?1 AND status IN ('pending', 'in_flight', 'failed')",
            params![account_id],
        )?;
        self.conn.execute(
            "DELETE FROM operations WHERE account_id = ?1 AND status = 'superseded'",
            params![account_id],
        )?;
        Ok(discarded)
    }

    /// Drop confirmed and superseded operations last touched before `before`
    pub fn prune_terminal(&self, account_id: &str, before: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM operations
             WHERE account_id = ?1 AND status IN ('confirmed', 'superseded') AND updated_at < ?2",
            params![account_id, before],
        )?;
        Ok(rows)
    }
}
