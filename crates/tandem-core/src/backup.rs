//! Backup and restore of confirmed entity state.
//!
//! A snapshot holds only what the remote store confirmed, never pending
//! optimistic changes. Restore is fail-closed: every check runs before the
//! first write, and the write itself is one transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::SessionContext;
use crate::db::{
    BackupRepository, ConflictRepository, EntityRepository, OperationRepository,
    SyncMetaRepository, CURSOR_KEY,
};
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::models::{
    BackupEntity, BackupId, BackupReason, BackupSnapshot, BackupSummary, EntityKey,
    BACKUP_SCHEMA_VERSION,
};
use crate::notify::NotificationType;
use crate::util::now_millis;

/// What a restore changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: BackupId,
    pub entities_restored: usize,
    /// Unsynced local operations dropped by the restore
    pub operations_discarded: usize,
}

/// Snapshot header, readable even when the body uses an unknown format
#[derive(Debug, Deserialize)]
struct SnapshotHeader {
    backup_id: BackupId,
    created_at: i64,
    device_id: String,
    account_id: String,
    #[serde(default = "default_reason")]
    reason: BackupReason,
    schema_version: u32,
    #[serde(default)]
    entities: Value,
}

const fn default_reason() -> BackupReason {
    BackupReason::Manual
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    ctx: Arc<SessionContext>,
}

impl BackupManager {
    pub const fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Take a point-in-time snapshot of every confirmed entity
    pub fn create_backup(&self, reason: BackupReason) -> Result<BackupId> {
        let account_id = &self.ctx.account_id;
        let backup_id = BackupId::new();

        let snapshot = self.ctx.store.write(|tx| {
            let mut entities: BTreeMap<_, Vec<BackupEntity>> = BTreeMap::new();
            for record in EntityRepository::new(tx).list_confirmed(account_id)? {
                let Some(payload) = record.confirmed_payload else {
                    continue;
                };
                entities.entry(record.entity_type).or_default().push(BackupEntity {
                    entity_id: record.entity_id,
                    version: record.version,
                    payload,
                });
            }

            let snapshot = BackupSnapshot {
                backup_id,
                created_at: now_millis(),
                device_id: self.ctx.device_id.clone(),
                account_id: account_id.clone(),
                reason,
                schema_version: BACKUP_SCHEMA_VERSION,
                entities,
            };
            BackupRepository::new(tx).insert(
                &snapshot.backup_id,
                account_id,
                &snapshot.device_id,
                reason,
                snapshot.schema_version,
                snapshot.entity_count(),
                &serde_json::to_string(&snapshot)?,
                snapshot.created_at,
            )?;
            Ok(snapshot)
        })?;

        info!(
            %backup_id,
            reason = %reason,
            entities = snapshot.entity_count(),
            "Backup created"
        );
        Ok(backup_id)
    }

    /// Backups stored for this account, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        self.ctx
            .store
            .read(|conn| BackupRepository::new(conn).list(&self.ctx.account_id))
    }

    /// Write a stored snapshot to a JSON file
    pub fn export_backup(&self, backup_id: &BackupId, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let stored = self
            .ctx
            .store
            .read(|conn| BackupRepository::new(conn).get(backup_id))?
            .filter(|stored| stored.account_id == self.ctx.account_id)
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, stored.snapshot)?;
        info!(%backup_id, path = %path.display(), "Backup exported");
        Ok(())
    }

    /// Store a snapshot file so it can be restored on this device.
    ///
    /// Only the header is checked here; the schema version is enforced on
    /// restore so that an incompatible file can still be listed.
    pub fn import_backup(&self, path: impl AsRef<Path>) -> Result<BackupSummary> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let header: SnapshotHeader = serde_json::from_str(&text)?;

        if header.account_id != self.ctx.account_id {
            return Err(Error::InvalidInput(format!(
                "backup {} belongs to another account",
                header.backup_id
            )));
        }

        let entity_count = header.entities.as_object().map_or(0, |types| {
            types.values().filter_map(Value::as_array).map(Vec::len).sum()
        });

        self.ctx.store.write(|tx| {
            let repo = BackupRepository::new(tx);
            if repo.get(&header.backup_id)?.is_some() {
                return Err(Error::InvalidInput(format!(
                    "backup {} was already imported",
                    header.backup_id
                )));
            }
            repo.insert(
                &header.backup_id,
                &header.account_id,
                &header.device_id,
                header.reason,
                header.schema_version,
                entity_count,
                &text,
                header.created_at,
            )
        })?;

        info!(backup_id = %header.backup_id, path = %path.display(), "Backup imported");
        Ok(BackupSummary {
            backup_id: header.backup_id,
            created_at: header.created_at,
            device_id: header.device_id,
            reason: header.reason,
            schema_version: header.schema_version,
            entity_count,
            consumed_at: None,
        })
    }

    /// Replace local state with a snapshot.
    ///
    /// Unsynced operations and open conflicts are discarded with a warning.
    /// A backup restores once. The caller should pull right after so the
    /// cache catches up with the remote store.
    pub fn restore_backup(&self, backup_id: &BackupId) -> Result<RestoreReport> {
        let account_id = &self.ctx.account_id;

        let stored = self
            .ctx
            .store
            .read(|conn| BackupRepository::new(conn).get(backup_id))?
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;

        if stored.schema_version != BACKUP_SCHEMA_VERSION {
            warn!(
                %backup_id,
                found = stored.schema_version,
                expected = BACKUP_SCHEMA_VERSION,
                "Refusing to restore incompatible backup"
            );
            return Err(Error::SchemaIncompatible {
                found: stored.schema_version,
                expected: BACKUP_SCHEMA_VERSION,
            });
        }
        if stored.consumed_at.is_some() {
            return Err(Error::BackupConsumed(backup_id.to_string()));
        }
        if stored.account_id != *account_id {
            return Err(Error::InvalidInput(format!(
                "backup {backup_id} belongs to another account"
            )));
        }
        let snapshot: BackupSnapshot = serde_json::from_str(&stored.snapshot)?;

        let report = self.ctx.store.write(|tx| {
            let now = now_millis();
            let operations_discarded = OperationRepository::new(tx).delete_unconfirmed(account_id)?;
            ConflictRepository::new(tx).delete_active(account_id)?;

            let entities = EntityRepository::new(tx);
            entities.delete_all(account_id)?;
            for (entity_type, items) in &snapshot.entities {
                for item in items {
                    let key = EntityKey::new(*entity_type, item.entity_id.clone());
                    entities.set_remote(account_id, &key, item.version, Some(item.payload.clone()), now)?;
                }
            }

            SyncMetaRepository::new(tx).delete(account_id, CURSOR_KEY)?;
            BackupRepository::new(tx).mark_consumed(backup_id, now)?;

            Ok(RestoreReport {
                backup_id: *backup_id,
                entities_restored: snapshot.entity_count(),
                operations_discarded,
            })
        })?;

        info!(
            %backup_id,
            entities = report.entities_restored,
            discarded = report.operations_discarded,
            "Backup restored"
        );
        if report.operations_discarded > 0 {
            warn!(count = report.operations_discarded, "Restore discarded unsynced changes");
            self.ctx.events.publish(SyncEvent::OperationsDiscarded {
                count: report.operations_discarded,
            });
            self.ctx.notifier.queue_notification(
                "Unsynced changes discarded",
                &format!(
                    "{} change(s) that had not synced yet were dropped by the restore.",
                    report.operations_discarded
                ),
                NotificationType::OperationsDiscarded,
                serde_json::json!({
                    "backup_id": backup_id,
                    "count": report.operations_discarded,
                }),
            );
        }
        self.ctx.refresh_status();
        Ok(report)
    }
}
