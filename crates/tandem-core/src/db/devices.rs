//! Device registry repository

use crate::error::Result;
use crate::models::Device;
use rusqlite::{params, Connection};

use super::{optional, parse_column};

const COLUMNS: &str = "device_id, account_id, platform, app_version, os_version, \
     is_primary, is_active, registered_at, last_seen_at";

/// `SQLite` access to the `devices` table
pub struct DeviceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> DeviceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
        let platform: String = row.get(2)?;
        Ok(Device {
            device_id: row.get(0)?,
            account_id: row.get(1)?,
            platform: parse_column(2, &platform)?,
            app_version: row.get(3)?,
            os_version: row.get(4)?,
            is_primary: row.get(5)?,
            is_active: row.get(6)?,
            registered_at: row.get(7)?,
            last_seen_at: row.get(8)?,
        })
    }

    /// Insert a device or refresh an existing one's versions and last-seen time.
    ///
    /// Primary flag and registration time of an existing row are preserved.
    pub fn upsert(&self, device: &Device) -> Result<()> {
        self.conn.execute(
            "INSERT INTO devices
                (device_id, account_id, platform, app_version, os_version,
                 is_primary, is_active, registered_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (account_id, device_id) DO UPDATE SET
                platform = excluded.platform,
                app_version = excluded.app_version,
                os_version = excluded.os_version,
                is_active = 1,
                last_seen_at = MAX(devices.last_seen_at, excluded.last_seen_at)",
            params![
                device.device_id,
                device.account_id,
                device.platform.as_str(),
                device.app_version,
                device.os_version,
                device.is_primary,
                device.is_active,
                device.registered_at,
                device.last_seen_at,
            ],
        )?;
        Ok(())
    }

    /// Overwrite a row with the remote store's view of a device
    pub fn replace(&self, device: &Device) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO devices
                (device_id, account_id, platform, app_version, os_version,
                 is_primary, is_active, registered_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                device.device_id,
                device.account_id,
                device.platform.as_str(),
                device.app_version,
                device.os_version,
                device.is_primary,
                device.is_active,
                device.registered_at,
                device.last_seen_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, account_id: &str, device_id: &str) -> Result<Option<Device>> {
        optional(self.conn.query_row(
            &format!("SELECT {COLUMNS} FROM devices WHERE account_id = ?1 AND device_id = ?2"),
            params![account_id, device_id],
            Self::parse_device,
        ))
    }

    pub fn list(&self, account_id: &str) -> Result<Vec<Device>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM devices WHERE account_id = ?1
             ORDER BY is_primary DESC, last_seen_at DESC"
        ))?;
        let devices = stmt
            .query_map(params![account_id], Self::parse_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    pub fn touch(&self, account_id: &str, device_id: &str, now: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE devices SET last_seen_at = ?3, is_active = 1
             WHERE account_id = ?1 AND device_id = ?2",
            params![account_id, device_id, now],
        )?;
        Ok(rows > 0)
    }

    /// Make `device_id` the only primary device of the account in one statement.
    pub fn set_primary(&self, account_id: &str, device_id: &str) -> Result<bool> {
        if self.get(account_id, device_id)?.is_none() {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE devices SET is_primary = (device_id = ?2) WHERE account_id = ?1",
            params![account_id, device_id],
        )?;
        Ok(true)
    }

    pub fn set_active(&self, account_id: &str, device_id: &str, is_active: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE devices SET is_active = ?3 WHERE account_id = ?1 AND device_id = ?2",
            params![account_id, device_id, is_active],
        )?;
        Ok(rows > 0)
    }
}
