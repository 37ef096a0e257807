//! Shared handle to the local store

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, Transaction};

use crate::db::Database;
use crate::error::Result;

/// Cloneable handle to the local `SQLite` store.
///
/// All access is synchronous and scoped to a closure, so the lock is never
/// held across an await point.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        // A panic mid-closure leaves no open transaction behind, so the
        // connection is still usable.
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a read-only closure against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock();
        f(db.connection())
    }

    /// Run a closure inside a transaction, committing when it returns `Ok`
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut db = self.lock();
        let tx = db.connection_mut().transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}
