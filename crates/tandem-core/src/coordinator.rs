//! Sync coordinator.
//!
//! One cycle walks `Idle -> Detecting -> (Offline | Draining -> Pulling ->
//! Merging) -> Idle`. Cycles never overlap: the start is guarded by a mutex
//! and a second caller gets [`Error::CycleInProgress`]. A backup restore
//! waits for the lock instead and pulls under it.
//!
//! Draining claims the oldest dispatchable operation of up to `workers`
//! distinct entities at a time and pushes them concurrently. An entity's next
//! operation only becomes dispatchable once the previous one settled, so
//! writes stay causally ordered per entity.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conflict::ConflictResolver;
use crate::context::SessionContext;
use crate::db::{
    ConflictRepository, EntityRepository, OperationRepository, SyncMetaRepository, CURSOR_KEY,
    LAST_SYNC_AT_KEY,
};
use crate::error::{Error, Result};
use crate::models::{DeviceInfo, SyncOperation};
use crate::optimistic::{OptimisticUpdateManager, ReconcileOutcome};
use crate::queue::{AttemptOutcome, OperationQueue};
use crate::registry::DeviceRegistry;
use crate::remote::{PushOperation, PushRequest, PushResult, PushStatus, RemoteChange, RemoteError};
use crate::state::{CyclePhase, SyncState};
use crate::util::{now_millis, Backoff};

/// Settled operations are kept this long for inspection
const CONFIRMED_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// The remote store could not be reached
    Offline,
    /// The device is not registered
    Disabled,
}

/// Summary of one sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Operations confirmed by the remote store
    pub pushed: usize,
    /// Operations that ended failed
    pub failed: usize,
    /// Conflicts raised that need the user
    pub conflicts: usize,
    /// Remote changes merged into the entity cache
    pub pulled: usize,
}

impl CycleReport {
    const fn new(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            pushed: 0,
            failed: 0,
            conflicts: 0,
            pulled: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatched {
    Accepted,
    Conflict,
    AutoResolved,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Applied,
    Stale,
    Conflict,
    AutoResolved,
}

#[derive(Debug)]
pub struct SyncCoordinator {
    ctx: Arc<SessionContext>,
    queue: OperationQueue,
    optimistic: OptimisticUpdateManager,
    resolver: ConflictResolver,
    registry: DeviceRegistry,
    /// Re-registration details for an unregistered device
    device_info: Option<DeviceInfo>,
    cycle_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            queue: OperationQueue::new(ctx.store.clone(), ctx.account_id.clone()),
            optimistic: OptimisticUpdateManager::new(ctx.clone()),
            resolver: ConflictResolver::new(ctx.clone()),
            registry: DeviceRegistry::new(ctx.clone()),
            device_info: None,
            cycle_lock: Mutex::new(()),
            ctx,
        }
    }

    /// Retry registration with `info` at the start of cycles while the
    /// device is unregistered.
    #[must_use]
    pub fn with_registration(mut self, info: DeviceInfo) -> Self {
        self.device_info = Some(info);
        self
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Err(Error::CycleInProgress);
        };

        let result = self.cycle(cancel, true).await;
        self.finish(&result);
        result
    }

    /// Run a cycle that only pulls.
    pub async fn pull_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            return Err(Error::CycleInProgress);
        };

        let result = self.cycle(cancel, false).await;
        self.finish(&result);
        result
    }

    /// Run `restore` while no cycle is running, then pull once from the
    /// cleared cursor.
    ///
    /// Waits for a running cycle instead of failing with
    /// [`Error::CycleInProgress`]. A failed restore skips the pull; a failed
    /// pull is returned next to the restore result.
    pub async fn restore_then_pull<T>(
        &self,
        cancel: &CancellationToken,
        restore: impl FnOnce() -> Result<T>,
    ) -> Result<(T, Result<CycleReport>)> {
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.cycle_lock.lock() => guard,
        };

        let restored = restore()?;
        let pulled = self.cycle(cancel, false).await;
        self.finish(&pulled);
        Ok((restored, pulled))
    }

    async fn cycle(&self, cancel: &CancellationToken, drain: bool) -> Result<CycleReport> {
        // Anything still in flight was cut off by a cancelled cycle or a crash.
        self.queue.reset_in_flight()?;

        if !self.ensure_registered().await? {
            return Ok(CycleReport::new(CycleOutcome::Disabled));
        }

        self.ctx.update_status(|status| {
            status.state = SyncState::Syncing;
            status.phase = CyclePhase::Detecting;
        });
        let heartbeat = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.ctx.remote.heartbeat() => result,
        };
        if let Err(error) = heartbeat {
            info!(%error, "Remote store unreachable; staying offline");
            return Ok(self.offline());
        }
        self.ctx.update_status(|status| status.is_online = true);

        let mut report = CycleReport::new(CycleOutcome::Completed);
        if drain {
            self.ctx
                .update_status(|status| status.phase = CyclePhase::Draining);
            match self.drain(cancel, &mut report).await {
                Err(Error::TransientNetwork(error)) => {
                    info!(%error, "Lost connection while draining");
                    return Ok(self.offline());
                }
                other => other?,
            }
        }

        match self.pull(cancel, &mut report).await {
            Err(Error::TransientNetwork(error)) => {
                info!(%error, "Lost connection while pulling");
                return Ok(self.offline());
            }
            other => other?,
        }

        let now = now_millis();
        if let Err(error) = self.registry.touch(&self.ctx.device_id) {
            warn!(%error, "Failed to update device last-seen time");
        }
        let pruned = self.queue.prune(now - CONFIRMED_RETENTION_MS)?;
        if pruned > 0 {
            debug!(pruned, "Pruned settled operations");
        }

        info!(
            pushed = report.pushed,
            failed = report.failed,
            conflicts = report.conflicts,
            pulled = report.pulled,
            "Sync cycle complete"
        );
        Ok(report)
    }

    async fn ensure_registered(&self) -> Result<bool> {
        if self.registry.is_registered()? {
            return Ok(true);
        }
        if let Some(info) = &self.device_info {
            match self.registry.register_device(info.clone()).await {
                Ok(_) => return Ok(true),
                Err(Error::RegistrationFailure(error)) => {
                    debug!(%error, "Registration retry failed");
                }
                Err(error) => return Err(error),
            }
        }
        self.ctx.update_status(|status| {
            status.state = SyncState::Disabled;
            status.phase = CyclePhase::Idle;
        });
        Ok(false)
    }

    fn offline(&self) -> CycleReport {
        self.ctx.update_status(|status| {
            status.is_online = false;
            status.state = SyncState::Offline;
            status.phase = CyclePhase::Offline;
        });
        CycleReport::new(CycleOutcome::Offline)
    }

    fn finish(&self, result: &Result<CycleReport>) {
        match result {
            Ok(report) => self.ctx.update_status(|status| {
                status.phase = CyclePhase::Idle;
                if report.outcome == CycleOutcome::Completed {
                    status.state = SyncState::Synced;
                }
            }),
            Err(Error::Cancelled) => {
                info!("Sync cycle cancelled");
                self.ctx
                    .update_status(|status| status.phase = CyclePhase::Idle);
            }
            Err(error) => {
                warn!(%error, "Sync cycle failed");
                self.ctx.update_status(|status| {
                    status.state = SyncState::Error;
                    status.phase = CyclePhase::Idle;
                });
            }
        }
    }

    async fn drain(&self, cancel: &CancellationToken, report: &mut CycleReport) -> Result<()> {
        let workers = self.ctx.config.workers.max(1);

        loop {
            let batch = self.queue.dequeue_batch(workers)?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!(count = batch.len(), "Dispatching operations");

            let results: Vec<Result<Dispatched>> = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                results = stream::iter(batch)
                    .map(|op| self.dispatch(op))
                    .buffer_unordered(workers)
                    .collect() => results,
            };

            let mut first_error = None;
            for result in results {
                match result {
                    Ok(Dispatched::Accepted) => report.pushed += 1,
                    Ok(Dispatched::Conflict) => report.conflicts += 1,
                    Ok(Dispatched::Failed) => report.failed += 1,
                    Ok(Dispatched::AutoResolved | Dispatched::Retrying) => {}
                    Err(error) => {
                        first_error.get_or_insert(error);
                    }
                }
            }
            if let Some(error) = first_error {
                return Err(error);
            }
            self.ctx.refresh_status();
        }
    }

    async fn dispatch(&self, op: SyncOperation) -> Result<Dispatched> {
        let key = op.key();
        let base_version = self
            .ctx
            .store
            .read(|conn| EntityRepository::new(conn).get(&self.ctx.account_id, &key))?
            .map_or(0, |record| record.version);

        let request = PushRequest {
            operations: vec![PushOperation {
                op_id: op.op_id,
                idempotency_key: op.idempotency_key.clone(),
                entity_type: op.entity_type,
                entity_id: op.entity_id.clone(),
                operation: op.kind,
                payload: op.payload.clone(),
                base_version,
                device_id: self.ctx.device_id.clone(),
            }],
        };
        debug!(op_id = %op.op_id, entity = %key, base_version, "Pushing operation");

        let response = self.ctx.remote.push(request).await.and_then(|results| {
            results
                .into_iter()
                .find(|result| result.op_id == op.op_id)
                .ok_or_else(|| {
                    RemoteError::InvalidResponse(format!("no result for operation {}", op.op_id))
                })
        });

        match response {
            Ok(result) => self.settle(&op, result),
            Err(RemoteError::Rejected { message, .. }) => {
                self.optimistic
                    .reconcile(&op.op_id, ReconcileOutcome::Rejected { reason: message })?;
                Ok(Dispatched::Failed)
            }
            Err(error @ RemoteError::Unauthorized { .. }) => {
                self.queue.release(&op.op_id)?;
                Err(error.into())
            }
            Err(error) => self.retry_later(&op, &error).await,
        }
    }

    fn settle(&self, op: &SyncOperation, result: PushResult) -> Result<Dispatched> {
        match result.status {
            PushStatus::Accepted => {
                let new_version = result.new_version.ok_or_else(|| {
                    Error::Protocol(format!("accepted operation {} without a version", op.op_id))
                })?;
                self.optimistic
                    .reconcile(&op.op_id, ReconcileOutcome::Accepted { new_version })?;
                debug!(op_id = %op.op_id, new_version, "Operation confirmed");
                Ok(Dispatched::Accepted)
            }
            PushStatus::Conflict => {
                let remote_version = result.current_version.ok_or_else(|| {
                    Error::Protocol(format!("conflict on {} without a version", op.op_id))
                })?;
                match self
                    .resolver
                    .raise_from_push(op, remote_version, result.current_payload)?
                {
                    Some(conflict) if conflict.is_active() => {
                        self.optimistic.reconcile(
                            &op.op_id,
                            ReconcileOutcome::Conflict {
                                conflict_id: conflict.conflict_id,
                            },
                        )?;
                        Ok(Dispatched::Conflict)
                    }
                    Some(_) => Ok(Dispatched::AutoResolved),
                    // Cache caught up in the meantime; redispatch on the new base.
                    None => Ok(Dispatched::Retrying),
                }
            }
            PushStatus::Rejected => {
                let reason = result
                    .message
                    .unwrap_or_else(|| "rejected by remote store".to_string());
                self.optimistic
                    .reconcile(&op.op_id, ReconcileOutcome::Rejected { reason })?;
                Ok(Dispatched::Failed)
            }
        }
    }

    async fn retry_later(&self, op: &SyncOperation, error: &RemoteError) -> Result<Dispatched> {
        let message = error.to_string();
        match self
            .queue
            .record_attempt(&op.op_id, &message, self.ctx.config.max_attempts)?
        {
            AttemptOutcome::Retry { attempt } => {
                let backoff =
                    Backoff::new(self.ctx.config.retry_base(), self.ctx.config.max_backoff());
                let delay = error
                    .retry_after()
                    .map_or_else(|| backoff.delay_for(attempt), |after| {
                        after.min(self.ctx.config.max_backoff())
                    });
                warn!(op_id = %op.op_id, attempt, ?delay, %error, "Dispatch failed; will retry");
                tokio::time::sleep(delay).await;
                Ok(Dispatched::Retrying)
            }
            AttemptOutcome::Exhausted { attempts } => {
                warn!(op_id = %op.op_id, attempts, %error, "Dispatch attempts exhausted");
                self.optimistic
                    .reconcile(&op.op_id, ReconcileOutcome::Exhausted { reason: message })?;
                Ok(Dispatched::Failed)
            }
        }
    }

    async fn pull(&self, cancel: &CancellationToken, report: &mut CycleReport) -> Result<()> {
        let account_id = &self.ctx.account_id;
        let mut cursor = self
            .ctx
            .store
            .read(|conn| SyncMetaRepository::new(conn).get(account_id, CURSOR_KEY))?;

        loop {
            self.ctx
                .update_status(|status| status.phase = CyclePhase::Pulling);
            let page = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                page = self.ctx.remote.pull(cursor.as_deref()) => page?,
            };
            debug!(changes = page.changes.len(), has_more = page.has_more, "Pulled changes");

            self.ctx
                .update_status(|status| status.phase = CyclePhase::Merging);
            for change in &page.changes {
                match self.merge(change)? {
                    MergeOutcome::Applied => report.pulled += 1,
                    MergeOutcome::Conflict => report.conflicts += 1,
                    MergeOutcome::Stale | MergeOutcome::AutoResolved => {}
                }
            }

            if let Some(next) = &page.cursor {
                self.ctx.store.write(|tx| {
                    SyncMetaRepository::new(tx).set(account_id, CURSOR_KEY, next)
                })?;
                cursor = Some(next.clone());
            }
            if !page.has_more || page.changes.is_empty() {
                break;
            }
        }

        let now = now_millis().to_string();
        self.ctx
            .store
            .write(|tx| SyncMetaRepository::new(tx).set(account_id, LAST_SYNC_AT_KEY, &now))?;
        Ok(())
    }

    /// Apply a pulled change directly unless an unconfirmed local edit or an
    /// open conflict touches the entity
    fn merge(&self, change: &RemoteChange) -> Result<MergeOutcome> {
        let account_id = &self.ctx.account_id;
        let key = change.key();

        let direct = self.ctx.store.write(|tx| {
            let entities = EntityRepository::new(tx);
            let local_version = entities.get(account_id, &key)?.map_or(0, |r| r.version);
            if change.version <= local_version {
                return Ok(Some(MergeOutcome::Stale));
            }
            let ops = OperationRepository::new(tx);
            let busy = !ops.active_for_entity(account_id, &key)?.is_empty()
                || !ops.failed_for_entity(account_id, &key)?.is_empty()
                || ConflictRepository::new(tx)
                    .active_for_entity(account_id, &key)?
                    .is_some();
            if busy {
                return Ok(None);
            }
            entities.set_remote(account_id, &key, change.version, change.payload.clone(), now_millis())?;
            Ok(Some(MergeOutcome::Applied))
        })?;

        if let Some(merged) = direct {
            if merged == MergeOutcome::Applied {
                debug!(entity = %key, version = change.version, "Applied remote change");
            }
            return Ok(merged);
        }

        Ok(match self.resolver.raise_from_pull(change)? {
            Some(conflict) if conflict.is_active() => MergeOutcome::Conflict,
            Some(_) => MergeOutcome::AutoResolved,
            None => MergeOutcome::Stale,
        })
    }

    /// Run cycles until cancelled.
    ///
    /// Waits `sync_interval` after a completed cycle. While offline or failing
    /// it backs off exponentially up to `max_backoff`. A sync request through
    /// the context wakes it early.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.ctx.config.retry_base(), self.ctx.config.max_backoff());
        info!(account_id = %self.ctx.account_id, "Sync loop started");

        loop {
            let wait = match self.run_cycle(&cancel).await {
                Ok(report) if report.outcome == CycleOutcome::Completed => {
                    backoff.reset();
                    self.ctx.config.sync_interval()
                }
                Ok(_) => backoff.next_delay(),
                Err(Error::Cancelled) => break,
                Err(Error::CycleInProgress) => self.ctx.config.sync_interval(),
                Err(_) => backoff.next_delay(),
            };
            debug!(?wait, "Next sync scheduled");

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.ctx.wakeup.notified() => debug!("Sync requested"),
                () = tokio::time::sleep(wait) => {}
            }
        }

        info!(account_id = %self.ctx.account_id, "Sync loop stopped");
    }
}
