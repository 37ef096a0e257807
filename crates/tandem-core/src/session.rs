//! Account sync session.
//!
//! A session owns every sync component for one account on one device and,
//! once started, the background coordinator task. Nothing is global: two
//! sessions in one process do not share state.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::{BackupManager, RestoreReport};
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::context::SessionContext;
use crate::coordinator::{CycleReport, SyncCoordinator};
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::models::{BackupId, Conflict, ConflictId, DeviceInfo, Resolution};
use crate::notify::Notifier;
use crate::optimistic::OptimisticUpdateManager;
use crate::queue::OperationQueue;
use crate::registry::DeviceRegistry;
use crate::remote::RemoteStore;
use crate::state::SyncStatus;
use crate::store::LocalStore;

#[derive(Debug)]
pub struct SyncSession {
    ctx: Arc<SessionContext>,
    queue: OperationQueue,
    optimistic: OptimisticUpdateManager,
    resolver: ConflictResolver,
    registry: DeviceRegistry,
    backups: BackupManager,
    coordinator: Arc<SyncCoordinator>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncSession {
    /// Build a session without registering or starting the background loop.
    ///
    /// Cycles can then be driven by hand with [`Self::sync_now`].
    pub fn open(
        account_id: impl Into<String>,
        device: &DeviceInfo,
        store: LocalStore,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let account_id = account_id.into();
        if account_id.trim().is_empty() {
            return Err(Error::InvalidInput("account id must not be empty".to_string()));
        }
        config.validate()?;

        let ctx = Arc::new(SessionContext::new(
            account_id,
            device.device_id.clone(),
            store,
            config,
            remote,
            notifier,
        ));
        let coordinator = SyncCoordinator::new(ctx.clone()).with_registration(device.clone());

        // Surface queued work before the first cycle reports.
        ctx.refresh_status();

        Ok(Self {
            queue: OperationQueue::new(ctx.store.clone(), ctx.account_id.clone()),
            optimistic: OptimisticUpdateManager::new(ctx.clone()),
            resolver: ConflictResolver::new(ctx.clone()),
            registry: DeviceRegistry::new(ctx.clone()),
            backups: BackupManager::new(ctx.clone()),
            coordinator: Arc::new(coordinator),
            cancel: CancellationToken::new(),
            task: None,
            ctx,
        })
    }

    /// Open a session, register the device, and start syncing in the
    /// background.
    ///
    /// A failed registration does not fail the start: the session runs with
    /// sync disabled and retries registration on later cycles.
    pub async fn start(
        account_id: impl Into<String>,
        device: DeviceInfo,
        store: LocalStore,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let mut session = Self::open(account_id, &device, store, config, remote, notifier)?;

        match session.registry.register_device(device).await {
            Ok(_) | Err(Error::RegistrationFailure(_)) => {}
            Err(error) => return Err(error),
        }

        let coordinator = session.coordinator.clone();
        let cancel = session.cancel.clone();
        session.task = Some(tokio::spawn(coordinator.run(cancel)));
        info!(
            account_id = %session.ctx.account_id,
            device_id = %session.ctx.device_id,
            "Sync session started"
        );
        Ok(session)
    }

    /// Cancel the background loop and wait for it to finish.
    ///
    /// A dispatch cut off mid-flight stays in flight and is re-sent on the
    /// next start.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "Sync task ended abnormally");
            }
        }
        info!(account_id = %self.ctx.account_id, "Sync session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn account_id(&self) -> &str {
        &self.ctx.account_id
    }

    pub fn device_id(&self) -> &str {
        &self.ctx.device_id
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub const fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub const fn updates(&self) -> &OptimisticUpdateManager {
        &self.optimistic
    }

    pub const fn conflicts(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub const fn devices(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub const fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn status(&self) -> SyncStatus {
        self.ctx.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.ctx.watch_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// Run one cycle now, in the caller's task
    pub async fn sync_now(&self) -> Result<CycleReport> {
        self.coordinator.run_cycle(&self.cancel).await
    }

    /// Wake the background loop, e.g. on a platform reconnect signal
    pub fn request_sync(&self) {
        self.ctx.request_sync();
    }

    pub fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        resolution: Resolution,
    ) -> Result<Conflict> {
        self.resolver.resolve(conflict_id, resolution)
    }

    /// Restore a backup, then pull once to catch up with the remote store.
    ///
    /// Waits for a running cycle to finish first. The pull is best effort;
    /// when offline the next cycle catches up.
    pub async fn restore_backup(&self, backup_id: &BackupId) -> Result<RestoreReport> {
        let (report, pulled) = self
            .coordinator
            .restore_then_pull(&self.cancel, || self.backups.restore_backup(backup_id))
            .await?;
        match pulled {
            Ok(cycle) => info!(pulled = cycle.pulled, "Post-restore pull finished"),
            Err(error) => warn!(%error, "Post-restore pull failed"),
        }
        Ok(report)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
