//! Backup snapshot model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::EntityType;

/// Snapshot format this build writes and accepts on restore
pub const BACKUP_SCHEMA_VERSION: u32 = 1;

uuid_id! {
    /// A unique identifier for a backup snapshot
    BackupId
}

/// Why a backup was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    Manual,
    PreMigration,
}

impl BackupReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::PreMigration => "pre_migration",
        }
    }
}

impl FromStr for BackupReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "pre_migration" | "pre-migration" => Ok(Self::PreMigration),
            other => Err(format!("unknown backup reason '{other}'")),
        }
    }
}

impl fmt::Display for BackupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confirmed state of one entity inside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntity {
    pub entity_id: String,
    pub version: i64,
    pub payload: Value,
}

/// Immutable point-in-time copy of an account's confirmed entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub backup_id: BackupId,
    pub created_at: i64,
    pub device_id: String,
    pub account_id: String,
    pub reason: BackupReason,
    pub schema_version: u32,
    pub entities: BTreeMap<EntityType, Vec<BackupEntity>>,
}

impl BackupSnapshot {
    pub fn entity_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }
}

/// Listing entry for a stored backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub backup_id: BackupId,
    pub created_at: i64,
    pub device_id: String,
    pub reason: BackupReason,
    pub schema_version: u32,
    pub entity_count: usize,
    /// Set once the backup has been restored
    pub consumed_at: Option<i64>,
}
