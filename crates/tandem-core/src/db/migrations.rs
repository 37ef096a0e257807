//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Entity cache: what the UI reads, plus the last confirmed remote state
        "CREATE TABLE IF NOT EXISTS entities (
            account_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            confirmed_payload TEXT,
            is_confirmed INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (account_id, entity_type, entity_id)
        )",
        // Operation queue
        "CREATE TABLE IF NOT EXISTS operations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            op_id TEXT NOT NULL UNIQUE,
            account_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT,
            idempotency_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            rollback_payload TEXT,
            rolled_back INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_operations_dispatch ON operations(account_id, status, seq)",
        "CREATE INDEX IF NOT EXISTS idx_operations_entity ON operations(account_id, entity_type, entity_id, seq)",
        // At most one in-flight write per entity
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_in_flight
            ON operations(account_id, entity_type, entity_id)
            WHERE status = 'in_flight'",
        // Device registry
        "CREATE TABLE IF NOT EXISTS devices (
            account_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            app_version TEXT NOT NULL,
            os_version TEXT NOT NULL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            registered_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            PRIMARY KEY (account_id, device_id)
        )",
        // Conflicts; rows with resolved_at set are history
        "CREATE TABLE IF NOT EXISTS conflicts (
            conflict_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            op_id TEXT,
            local_kind TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            remote_version INTEGER NOT NULL,
            local_payload TEXT,
            remote_payload TEXT,
            base_payload TEXT,
            state TEXT NOT NULL,
            resolution TEXT,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_active
            ON conflicts(account_id, entity_type, entity_id)
            WHERE resolved_at IS NULL",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_detected ON conflicts(account_id, detected_at DESC)",
        // Backup snapshots
        "CREATE TABLE IF NOT EXISTS backups (
            backup_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            schema_version INTEGER NOT NULL,
            entity_count INTEGER NOT NULL,
            snapshot TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            consumed_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_backups_account ON backups(account_id, created_at DESC)",
        // Per-account sync bookkeeping (pull cursor, last sync time)
        "CREATE TABLE IF NOT EXISTS sync_meta (
            account_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (account_id, key)
        )",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        assert_eq!(version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        assert_eq!(version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_second_in_flight_for_entity_is_rejected() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let insert = "INSERT INTO operations
            (op_id, account_id, entity_type, entity_id, kind, idempotency_key, status, created_at, updated_at)
            VALUES (?1, 'acct', 'booking', 'b1', 'update', ?1, 'in_flight', 0, 0)";
        conn.execute(insert, ["op-1"]).unwrap();
        assert!(conn.execute(insert, ["op-2"]).is_err());
    }
}
