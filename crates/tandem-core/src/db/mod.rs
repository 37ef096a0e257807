//! Database layer for Tandem

mod backups;
mod conflicts;
mod connection;
mod devices;
mod entities;
mod migrations;
mod operations;
mod sync_meta;

pub use backups::{BackupRepository, StoredBackup};
pub use conflicts::ConflictRepository;
pub use connection::Database;
pub use devices::DeviceRepository;
pub use entities::EntityRepository;
pub use operations::OperationRepository;
pub use sync_meta::{SyncMetaRepository, CURSOR_KEY, LAST_SYNC_AT_KEY, REGISTERED_DEVICE_KEY};

use std::str::FromStr;

/// Parse a text column into a typed value, reporting failures as conversion errors.
fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    value.parse().map_err(|err: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
    })
}

/// Map `QueryReturnedNoRows` to `None`.
fn optional<T>(result: rusqlite::Result<T>) -> crate::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
