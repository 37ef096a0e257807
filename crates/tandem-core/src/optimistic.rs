//! Optimistic update manager.
//!
//! The only write path for cached entities. Every mutation updates the
//! entity cache and queues its operation in the same transaction, keeping
//! the pre-update payload for rollback until the operation settles.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::conflict;
use crate::context::SessionContext;
use crate::db::{ConflictRepository, EntityRepository, OperationRepository};
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::models::{
    ConflictId, ConflictState, EntityKey, EntityRecord, EntityType, OpId, OperationKind,
    OperationStatus, OptimisticUpdate, Resolution, SyncOperation,
};
use crate::notify::NotificationType;
use crate::queue::enqueue_in;
use crate::util::now_millis;

/// How the remote store answered an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Accepted { new_version: i64 },
    /// Held back behind a conflict
    Conflict { conflict_id: ConflictId },
    /// Validation failed; local state is rolled back
    Rejected { reason: String },
    /// Transient failures used up the retry budget; local state is kept
    Exhausted { reason: String },
}

#[derive(Debug, Clone)]
pub struct OptimisticUpdateManager {
    ctx: Arc<SessionContext>,
}

impl OptimisticUpdateManager {
    pub const fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Apply a local mutation and queue it for the remote store.
    ///
    /// Creates and updates carry the full entity payload as a JSON object.
    /// Deletes ignore `payload`. Edits to an entity with a conflict awaiting
    /// the user are refused, except a delete, which settles the conflict.
    pub fn apply(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: Option<Value>,
    ) -> Result<OptimisticUpdate> {
        let entity_id = entity_id.trim();
        if entity_id.is_empty() {
            return Err(Error::InvalidInput("entity id must not be empty".to_string()));
        }
        let payload = match kind {
            OperationKind::Delete => None,
            OperationKind::Create | OperationKind::Update => match payload {
                Some(value @ Value::Object(_)) => Some(value),
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "{kind} requires a JSON object payload"
                    )))
                }
            },
        };

        let key = EntityKey::new(entity_type, entity_id);
        let account_id = &self.ctx.account_id;

        let (op, settled) = self.ctx.store.write(|tx| {
            let now = now_millis();
            let entities = EntityRepository::new(tx);
            let existing = entities.get(account_id, &key)?;

            if let Some(mut open) = ConflictRepository::new(tx).active_for_entity(account_id, &key)? {
                if kind != OperationKind::Delete {
                    return Err(Error::EntityBlocked(key.to_string()));
                }
                let op = conflict::apply_in(tx, &mut open, Resolution::Merged(Value::Null), now)?;
                return Ok((op, Some(open)));
            }

            let live = existing.as_ref().is_some_and(|record| !record.is_deleted());
            match kind {
                OperationKind::Create if live => {
                    return Err(Error::InvalidInput(format!("{key} already exists")));
                }
                OperationKind::Update | OperationKind::Delete if !live => {
                    return Err(Error::NotFound(key.to_string()));
                }
                _ => {}
            }

            let rollback = existing.and_then(|record| record.payload);
            entities.set_local_payload(account_id, &key, payload.clone(), now)?;
            let op = enqueue_in(tx, account_id, &key, kind, payload, rollback, now)?;
            Ok((op, None))
        })?;

        if let Some(conflict) = &settled {
            info!(entity = %key, conflict_id = %conflict.conflict_id, "Delete settled open conflict");
            self.ctx.events.publish(SyncEvent::ConflictResolved {
                conflict_id: conflict.conflict_id,
                entity_type: conflict.entity_type,
                entity_id: conflict.entity_id.clone(),
                resolution: Resolution::Merged(Value::Null),
                automatic: false,
            });
        }

        let update = match op {
            Some(op) => OptimisticUpdate::from_operation(&op, None),
            // Already matches the remote state; nothing left to send.
            None => OptimisticUpdate::settled(entity_type, entity_id, kind),
        };
        self.ctx
            .events
            .publish(SyncEvent::OptimisticUpdate(update.clone()));
        self.ctx.refresh_status();
        self.ctx.request_sync();
        Ok(update)
    }

    /// Updates whose operation is pending or in flight
    pub fn get_pending_updates(&self) -> Result<Vec<OptimisticUpdate>> {
        self.updates(&[OperationStatus::Pending, OperationStatus::InFlight])
    }

    /// Pending updates plus failed ones awaiting retry or dismissal
    pub fn list(&self) -> Result<Vec<OptimisticUpdate>> {
        self.updates(&[
            OperationStatus::Pending,
            OperationStatus::InFlight,
            OperationStatus::Failed,
        ])
    }

    pub fn get(&self, op_id: &OpId) -> Result<Option<OptimisticUpdate>> {
        Ok(self.list()?.into_iter().find(|update| update.id == *op_id))
    }

    fn updates(&self, statuses: &[OperationStatus]) -> Result<Vec<OptimisticUpdate>> {
        let account_id = &self.ctx.account_id;
        self.ctx.store.read(|conn| {
            let conflicts = ConflictRepository::new(conn).list_active(account_id)?;
            let ops = OperationRepository::new(conn).list_by_status(account_id, statuses)?;
            Ok(ops
                .iter()
                .map(|op| {
                    let conflict_id = conflicts
                        .iter()
                        .find(|c| c.op_id == Some(op.op_id))
                        .map(|c| c.conflict_id);
                    OptimisticUpdate::from_operation(op, conflict_id)
                })
                .collect())
        })
    }

    /// Current cached state of an entity
    pub fn entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>> {
        let key = EntityKey::new(entity_type, entity_id);
        self.ctx
            .store
            .read(|conn| EntityRepository::new(conn).get(&self.ctx.account_id, &key))
    }

    /// Live cached entities, optionally of one type
    pub fn entities(&self, entity_type: Option<EntityType>) -> Result<Vec<EntityRecord>> {
        self.ctx
            .store
            .read(|conn| EntityRepository::new(conn).list(&self.ctx.account_id, entity_type, false))
    }

    /// Settle an operation with the remote store's answer
    pub fn reconcile(&self, op_id: &OpId, outcome: ReconcileOutcome) -> Result<()> {
        let account_id = &self.ctx.account_id;

        let affected = self.ctx.store.write(|tx| {
            let now = now_millis();
            let ops = OperationRepository::new(tx);
            let entities = EntityRepository::new(tx);
            let op = ops
                .get(account_id, op_id)?
                .ok_or_else(|| Error::NotFound(format!("operation {op_id}")))?;
            let key = op.key();

            // Replaced while in flight; only a confirmed version still matters.
            if op.status == OperationStatus::Superseded {
                if let ReconcileOutcome::Accepted { new_version } = &outcome {
                    entities.set_confirmed(account_id, &key, *new_version, op.payload.clone(), now)?;
                }
                return Ok(Vec::new());
            }

            match &outcome {
                ReconcileOutcome::Accepted { new_version } => {
                    ops.set_status(op_id, OperationStatus::Confirmed, None, now)?;
                    entities.set_confirmed(account_id, &key, *new_version, op.payload.clone(), now)?;
                    Ok(vec![refetch(&ops, account_id, op_id)?])
                }
                ReconcileOutcome::Conflict { .. } => {
                    if op.status == OperationStatus::InFlight {
                        ops.set_status(op_id, OperationStatus::Pending, None, now)?;
                    }
                    Ok(vec![refetch(&ops, account_id, op_id)?])
                }
                ReconcileOutcome::Rejected { reason } => {
                    let mut failed = vec![op_id.to_owned()];
                    ops.set_status(op_id, OperationStatus::Failed, Some(reason.as_str()), now)?;
                    ops.set_rolled_back(op_id)?;

                    let dependent_error = format!("depends on rejected operation {op_id}: {reason}");
                    for later in ops.pending_after(account_id, &key, op.seq)? {
                        ops.set_status(&later.op_id, OperationStatus::Failed, Some(dependent_error.as_str()), now)?;
                        ops.set_rolled_back(&later.op_id)?;
                        failed.push(later.op_id);
                    }

                    entities.set_local_payload(account_id, &key, op.rollback.clone(), now)?;
                    failed
                        .iter()
                        .map(|id| refetch(&ops, account_id, id))
                        .collect()
                }
                ReconcileOutcome::Exhausted { reason } => {
                    ops.set_status(op_id, OperationStatus::Failed, Some(reason.as_str()), now)?;
                    Ok(vec![refetch(&ops, account_id, op_id)?])
                }
            }
        })?;

        let conflict_id = match &outcome {
            ReconcileOutcome::Conflict { conflict_id } => Some(*conflict_id),
            _ => None,
        };
        for op in &affected {
            self.ctx
                .events
                .publish(SyncEvent::OptimisticUpdate(OptimisticUpdate::from_operation(
                    op,
                    conflict_id,
                )));
        }

        match &outcome {
            ReconcileOutcome::Rejected { reason } => {
                warn!(%op_id, %reason, rolled_back = affected.len(), "Operation rejected; rolled back");
                if let Some(op) = affected.first() {
                    self.ctx.notifier.queue_notification(
                        "Change could not be saved",
                        reason,
                        NotificationType::SyncFailed,
                        serde_json::json!({
                            "op_id": op.op_id,
                            "entity_type": op.entity_type,
                            "entity_id": op.entity_id,
                        }),
                    );
                }
            }
            ReconcileOutcome::Exhausted { reason } => {
                warn!(%op_id, %reason, "Operation failed after retries; keeping local state");
            }
            ReconcileOutcome::Accepted { .. } | ReconcileOutcome::Conflict { .. } => {}
        }

        self.ctx.refresh_status();
        Ok(())
    }

    /// Re-queue a failed update as a new operation with a new idempotency key
    pub fn retry(&self, op_id: &OpId) -> Result<OptimisticUpdate> {
        let account_id = &self.ctx.account_id;

        let (op, key, kind) = self.ctx.store.write(|tx| {
            let now = now_millis();
            let ops = OperationRepository::new(tx);
            let entities = EntityRepository::new(tx);
            let failed = failed_operation(&ops, account_id, op_id)?;
            let key = EntityKey::new(failed.entity_type, failed.entity_id.clone());

            if ConflictRepository::new(tx)
                .active_for_entity(account_id, &key)?
                .is_some_and(|c| c.state == ConflictState::AwaitingUser)
            {
                return Err(Error::EntityBlocked(key.to_string()));
            }
            if !ops.active_for_entity(account_id, &key)?.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "{key} has newer pending changes; dismiss this update instead"
                )));
            }

            let rollback = if failed.rolled_back {
                let current = entities.get(account_id, &key)?.and_then(|record| record.payload);
                entities.set_local_payload(account_id, &key, failed.payload.clone(), now)?;
                current
            } else {
                failed.rollback.clone()
            };

            ops.delete(op_id)?;
            let op = enqueue_in(tx, account_id, &key, failed.kind, failed.payload, rollback, now)?;
            Ok((op, key, failed.kind))
        })?;

        let update = match op {
            Some(op) => {
                info!(old_op_id = %op_id, op_id = %op.op_id, "Retrying failed update");
                OptimisticUpdate::from_operation(&op, None)
            }
            None => {
                info!(old_op_id = %op_id, "Failed update no longer needs sending");
                OptimisticUpdate::settled(key.entity_type, &key.entity_id, kind)
            }
        };
        self.ctx
            .events
            .publish(SyncEvent::OptimisticUpdate(update.clone()));
        self.ctx.refresh_status();
        self.ctx.request_sync();
        Ok(update)
    }

    /// Drop a failed update whose edit is still applied, unless something
    /// newer was queued for the entity.
    ///
    /// The local payload falls back to the confirmed remote state. When an
    /// older failed edit of the same entity is still shown, the pre-update
    /// payload is restored instead so that edit stays visible.
    pub fn dismiss(&self, op_id: &OpId) -> Result<()> {
        let account_id = &self.ctx.account_id;

        self.ctx.store.write(|tx| {
            let ops = OperationRepository::new(tx);
            let entities = EntityRepository::new(tx);
            let failed = failed_operation(&ops, account_id, op_id)?;
            let key = EntityKey::new(failed.entity_type, failed.entity_id.clone());

            if ConflictRepository::new(tx)
                .active_for_entity(account_id, &key)?
                .is_some_and(|c| c.state == ConflictState::AwaitingUser)
            {
                return Err(Error::EntityBlocked(key.to_string()));
            }

            if !failed.rolled_back && ops.active_for_entity(account_id, &key)?.is_empty() {
                let older_failed = ops
                    .failed_for_entity(account_id, &key)?
                    .iter()
                    .any(|op| op.seq < failed.seq);
                let restored = if older_failed {
                    failed.rollback
                } else {
                    entities
                        .get(account_id, &key)?
                        .and_then(|record| record.confirmed_payload)
                };
                entities.set_local_payload(account_id, &key, restored, now_millis())?;
            }
            ops.delete(op_id)?;
            Ok(())
        })?;

        info!(%op_id, "Dismissed failed update");
        self.ctx.refresh_status();
        Ok(())
    }
}

fn refetch(ops: &OperationRepository<'_>, account_id: &str, op_id: &OpId) -> Result<SyncOperation> {
    ops.get(account_id, op_id)?
        .ok_or_else(|| Error::NotFound(format!("operation {op_id}")))
}

fn failed_operation(
    ops: &OperationRepository<'_>,
    account_id: &str,
    op_id: &OpId,
) -> Result<SyncOperation> {
    let op = refetch(ops, account_id, op_id)?;
    if op.status == OperationStatus::Failed {
        Ok(op)
    } else {
        Err(Error::InvalidInput(format!(
            "operation {op_id} is {}, not failed",
            op.status
        )))
    }
}
