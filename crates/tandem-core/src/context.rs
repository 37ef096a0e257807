//! Session-scoped context shared by every sync component

use std::sync::Arc;

use tokio::sync::{watch, Notify};

use crate::config::SyncConfig;
use crate::db::{ConflictRepository, OperationRepository, SyncMetaRepository};
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::models::OperationStatus;
use crate::notify::Notifier;
use crate::remote::RemoteStore;
use crate::state::SyncStatus;
use crate::store::LocalStore;

/// Everything the components of one account session share.
///
/// Created once per session and handed to each component behind an `Arc`.
pub struct SessionContext {
    pub account_id: String,
    pub device_id: String,
    pub store: LocalStore,
    pub config: SyncConfig,
    pub remote: Arc<dyn RemoteStore>,
    pub events: EventBus,
    pub notifier: Arc<dyn Notifier>,
    /// Wakes the background loop for an immediate cycle
    pub wakeup: Arc<Notify>,
    status: watch::Sender<SyncStatus>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("account_id", &self.account_id)
            .field("device_id", &self.device_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(
        account_id: impl Into<String>,
        device_id: impl Into<String>,
        store: LocalStore,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
            store,
            config,
            remote,
            events,
            notifier,
            wakeup: Arc::new(Notify::new()),
            status,
        }
    }

    /// Latest published status
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Ask the background loop to run a cycle soon
    pub fn request_sync(&self) {
        self.wakeup.notify_one();
    }

    /// Modify the status, refresh its counters from the store, and publish
    /// `StatusChanged` when anything differs.
    pub fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let counts = self.counts();
        if let Err(error) = &counts {
            tracing::warn!(%error, "Failed to read sync counters");
        }

        let mut changed = None;
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            if let Ok((pending, conflicts, last_sync_at)) = &counts {
                status.pending_operations = *pending;
                status.conflicts = *conflicts;
                status.last_sync_at = *last_sync_at;
            }
            if *status == before {
                false
            } else {
                changed = Some(status.clone());
                true
            }
        });

        if let Some(status) = changed {
            self.events.publish(SyncEvent::StatusChanged(status));
        }
    }

    pub fn refresh_status(&self) {
        self.update_status(|_| {});
    }

    fn counts(&self) -> Result<(usize, usize, Option<i64>)> {
        self.store.read(|conn| {
            let ops = OperationRepository::new(conn);
            let pending = ops.count_by_status(&self.account_id, OperationStatus::Pending)?
                + ops.count_by_status(&self.account_id, OperationStatus::InFlight)?;
            let conflicts = ConflictRepository::new(conn).count_active(&self.account_id)?;
            let last_sync_at = SyncMetaRepository::new(conn).last_sync_at(&self.account_id)?;
            Ok((pending, conflicts, last_sync_at))
        })
    }
}
