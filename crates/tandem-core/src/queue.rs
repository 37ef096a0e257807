//! Durable, ordered queue of local mutations awaiting remote confirmation

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::db::{EntityRepository, OperationRepository};
use crate::error::{Error, Result};
use crate::models::{
    EntityKey, EntityType, OpId, OperationKind, OperationStatus, SyncOperation,
};
use crate::store::LocalStore;
use crate::util::now_millis;

/// Result of counting a failed dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The operation may be dispatched again
    Retry { attempt: u32 },
    /// Attempts are used up; the operation was marked failed
    Exhausted { attempts: u32 },
}

/// The operation queue of one account
#[derive(Debug, Clone)]
pub struct OperationQueue {
    store: LocalStore,
    account_id: String,
}

impl OperationQueue {
    pub fn new(store: LocalStore, account_id: impl Into<String>) -> Self {
        Self {
            store,
            account_id: account_id.into(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Queue a mutation without touching the entity cache.
    ///
    /// The current cached payload is kept as the rollback snapshot. Returns
    /// `None` when the mutation cancels out against the remote state.
    pub fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: Option<Value>,
    ) -> Result<Option<SyncOperation>> {
        let key = EntityKey::new(entity_type, entity_id);
        self.store.write(|tx| {
            let rollback = EntityRepository::new(tx)
                .get(&self.account_id, &key)?
                .and_then(|record| record.payload);
            enqueue_in(tx, &self.account_id, &key, kind, payload, rollback, now_millis())
        })
    }

    /// Claim the oldest dispatchable operation
    pub fn dequeue_next(&self) -> Result<Option<SyncOperation>> {
        Ok(self.dequeue_batch(1)?.into_iter().next())
    }

    /// Claim up to `limit` dispatchable operations, each for a different entity,
    /// and mark them in flight.
    pub fn dequeue_batch(&self, limit: usize) -> Result<Vec<SyncOperation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.write(|tx| {
            let repo = OperationRepository::new(tx);
            let now = now_millis();
            let mut batch = repo.dispatchable(&self.account_id, limit)?;
            for op in &mut batch {
                repo.set_status(&op.op_id, OperationStatus::InFlight, None, now)?;
                op.status = OperationStatus::InFlight;
            }
            if !batch.is_empty() {
                debug!(count = batch.len(), "Claimed operations for dispatch");
            }
            Ok(batch)
        })
    }

    pub fn mark_confirmed(&self, op_id: &OpId) -> Result<()> {
        self.set_status(op_id, OperationStatus::Confirmed, None)
    }

    pub fn mark_failed(&self, op_id: &OpId, error: &str) -> Result<()> {
        self.set_status(op_id, OperationStatus::Failed, Some(error))
    }

    /// Return an in-flight operation to pending without counting an attempt
    pub fn release(&self, op_id: &OpId) -> Result<()> {
        self.set_status(op_id, OperationStatus::Pending, None)
    }

    fn set_status(&self, op_id: &OpId, status: OperationStatus, error: Option<&str>) -> Result<()> {
        self.store.write(|tx| {
            let updated =
                OperationRepository::new(tx).set_status(op_id, status, error, now_millis())?;
            if updated {
                debug!(%op_id, status = status.as_str(), "Operation status changed");
                Ok(())
            } else {
                Err(Error::NotFound(format!("operation {op_id}")))
            }
        })
    }

    /// Count a failed dispatch attempt.
    ///
    /// Below `max_attempts` the operation goes back to pending; at the limit
    /// it is marked failed.
    pub fn record_attempt(
        &self,
        op_id: &OpId,
        error: &str,
        max_attempts: u32,
    ) -> Result<AttemptOutcome> {
        self.store.write(|tx| {
            let repo = OperationRepository::new(tx);
            let now = now_millis();
            let attempts = repo.record_attempt(op_id, error, now)?;
            if attempts >= max_attempts {
                repo.set_status(op_id, OperationStatus::Failed, Some(error), now)?;
                Ok(AttemptOutcome::Exhausted { attempts })
            } else {
                repo.set_status(op_id, OperationStatus::Pending, None, now)?;
                Ok(AttemptOutcome::Retry { attempt: attempts })
            }
        })
    }

    /// Return every in-flight operation to pending, as on restart
    pub fn reset_in_flight(&self) -> Result<usize> {
        let reset = self
            .store
            .write(|tx| OperationRepository::new(tx).reset_in_flight(&self.account_id, now_millis()))?;
        if reset > 0 {
            debug!(reset, "Reset interrupted operations to pending");
        }
        Ok(reset)
    }

    /// Operations not yet confirmed by the remote store
    pub fn pending_count(&self) -> Result<usize> {
        self.store.read(|conn| {
            let repo = OperationRepository::new(conn);
            Ok(repo.count_by_status(&self.account_id, OperationStatus::Pending)?
                + repo.count_by_status(&self.account_id, OperationStatus::InFlight)?)
        })
    }

    /// Pending and in-flight operations, in queue order
    pub fn active_operations(&self) -> Result<Vec<SyncOperation>> {
        self.list(&[OperationStatus::Pending, OperationStatus::InFlight])
    }

    pub fn list(&self, statuses: &[OperationStatus]) -> Result<Vec<SyncOperation>> {
        self.store
            .read(|conn| OperationRepository::new(conn).list_by_status(&self.account_id, statuses))
    }

    pub fn get(&self, op_id: &OpId) -> Result<Option<SyncOperation>> {
        self.store
            .read(|conn| OperationRepository::new(conn).get(&self.account_id, op_id))
    }

    /// Delete confirmed and superseded operations older than `before` (Unix ms)
    pub fn prune(&self, before: i64) -> Result<usize> {
        self.store
            .write(|tx| OperationRepository::new(tx).prune_terminal(&self.account_id, before))
    }
}

/// Queue a mutation inside an open transaction, coalescing with any pending
/// operation on the same entity.
///
/// Older pending operations are superseded. The new operation inherits the
/// earliest rollback snapshot and the coalesced kind. In-flight operations
/// are left alone; the new one waits behind them.
///
/// The kind is then settled against what the remote store has seen: a
/// create of an entity it already knows becomes an update, and a delete of
/// an entity it never saw queues nothing. Returns `None` in that last case.
pub(crate) fn enqueue_in(
    conn: &Connection,
    account_id: &str,
    key: &EntityKey,
    kind: OperationKind,
    payload: Option<Value>,
    rollback: Option<Value>,
    now: i64,
) -> Result<Option<SyncOperation>> {
    let repo = OperationRepository::new(conn);

    let (superseded, in_flight): (Vec<SyncOperation>, Vec<SyncOperation>) = repo
        .active_for_entity(account_id, key)?
        .into_iter()
        .partition(|op| op.status == OperationStatus::Pending);

    let (kind, rollback) = match superseded.first() {
        Some(first) => {
            let older = superseded
                .iter()
                .skip(1)
                .fold(first.kind, |acc, op| OperationKind::coalesce(acc, op.kind));
            (OperationKind::coalesce(older, kind), first.rollback.clone())
        }
        None => (kind, rollback),
    };

    for op in &superseded {
        repo.set_status(&op.op_id, OperationStatus::Superseded, None, now)?;
        debug!(op_id = %op.op_id, entity = %key, "Superseded pending operation");
    }

    let remote_version = EntityRepository::new(conn)
        .get(account_id, key)?
        .map_or(0, |record| record.version);
    let Some(kind) = kind.settle(remote_version, !in_flight.is_empty()) else {
        debug!(entity = %key, "Delete of an entity the remote never saw; nothing queued");
        return Ok(None);
    };

    let mut op = SyncOperation {
        seq: 0,
        op_id: OpId::new(),
        account_id: account_id.to_string(),
        entity_type: key.entity_type,
        entity_id: key.entity_id.clone(),
        kind,
        payload,
        idempotency_key: uuid::Uuid::now_v7().to_string(),
        created_at: now,
        attempt_count: 0,
        status: OperationStatus::Pending,
        last_error: None,
        rollback,
        rolled_back: false,
    };
    op.seq = repo.insert(&op)?;
    debug!(op_id = %op.op_id, entity = %key, kind = kind.as_str(), "Enqueued operation");
    Ok(Some(op))
}
