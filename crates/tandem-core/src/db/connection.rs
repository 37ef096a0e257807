//! Database connection management

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;

use super::migrations;

/// Database wrapper for the local `SQLite` store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut database = Self {
            conn: Connection::open(path)?,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut database = Self {
            conn: Connection::open_in_memory()?,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` pragmas
    fn configure(&self) -> Result<()> {
        // In-memory databases reject WAL; that is fine.
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL;")
            .ok();
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    /// Current schema version of the local store
    pub fn schema_version(&self) -> Result<i32> {
        migrations::version(&self.conn)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference, needed to open transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
