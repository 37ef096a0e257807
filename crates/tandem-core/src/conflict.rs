//! Conflict detection and resolution.
//!
//! A conflict moves `Detected -> AutoResolved | AwaitingUser -> Resolved`.
//! Automatic policies, in order of precedence:
//!
//! 1. updates touching disjoint fields merge field by field;
//! 2. a delete beats a concurrent update, with an informational notice;
//! 3. anything else waits for the user.
//!
//! While a conflict awaits the user, the entity's queued operations are held
//! back and further edits are refused, except a delete.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::context::SessionContext;
use crate::db::{ConflictRepository, EntityRepository, OperationRepository};
use crate::error::{Error, Result};
use crate::events::{DiscardedSide, SyncEvent};
use crate::models::{
    Conflict, ConflictId, ConflictState, EntityKey, OperationKind, OperationStatus,
    OptimisticUpdate, Resolution, SyncOperation,
};
use crate::notify::NotificationType;
use crate::queue::enqueue_in;
use crate::remote::RemoteChange;
use crate::util::now_millis;

/// What the automatic policies make of a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Auto {
        resolution: Resolution,
        /// Side whose update a delete discarded
        discarded: Option<DiscardedSide>,
    },
    AwaitUser,
}

/// Apply the automatic policies to a conflict.
pub fn decide(conflict: &Conflict) -> Decision {
    let auto = |resolution, discarded| Decision::Auto {
        resolution,
        discarded,
    };

    match (&conflict.local_payload, &conflict.remote_payload) {
        (local, remote) if local == remote => auto(Resolution::KeepRemote, None),
        (Some(Value::Object(local)), Some(Value::Object(remote))) => {
            let base = match &conflict.base_payload {
                Some(Value::Object(base)) => base.clone(),
                _ => Map::new(),
            };
            match merge_disjoint(&base, local, remote) {
                Some(merged) if merged == *remote => auto(Resolution::KeepRemote, None),
                Some(merged) => auto(Resolution::Merged(Value::Object(merged)), None),
                None => Decision::AwaitUser,
            }
        }
        (None, Some(_)) => auto(Resolution::KeepLocal, Some(DiscardedSide::Remote)),
        (Some(_), None) => auto(Resolution::KeepRemote, Some(DiscardedSide::Local)),
        _ => Decision::AwaitUser,
    }
}

/// Three-way merge of top-level fields.
///
/// Returns `None` when a field changed on both sides to different values.
pub fn merge_disjoint(
    base: &Map<String, Value>,
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let fields: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    let mut merged = remote.clone();

    for field in fields {
        let base_value = base.get(field);
        let local_value = local.get(field);
        let remote_value = remote.get(field);

        let local_changed = local_value != base_value;
        let remote_changed = remote_value != base_value;
        if local_changed && remote_changed && local_value != remote_value {
            return None;
        }
        if local_changed {
            match local_value {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }
    }

    Some(merged)
}

/// Result of raising or re-evaluating a conflict inside a transaction
#[derive(Debug)]
pub(crate) struct RaiseOutcome {
    pub conflict: Conflict,
    pub new_op: Option<SyncOperation>,
    pub discarded: Option<DiscardedSide>,
}

/// Settle a conflict inside an open transaction.
///
/// Every active operation of the entity, and any failed one whose edit is
/// still shown, is superseded and the remote state becomes the confirmed base.
/// For keep-local and merged choices that differ from the remote state, a
/// fresh operation is queued on top of it.
pub(crate) fn apply_in(
    conn: &Connection,
    conflict: &mut Conflict,
    resolution: Resolution,
    now: i64,
) -> Result<Option<SyncOperation>> {
    let account_id = conflict.account_id.clone();
    let key = conflict.key();
    let ops = OperationRepository::new(conn);
    let entities = EntityRepository::new(conn);

    for op in ops
        .active_for_entity(&account_id, &key)?
        .into_iter()
        .chain(ops.failed_for_entity(&account_id, &key)?)
    {
        ops.set_status(&op.op_id, OperationStatus::Superseded, None, now)?;
    }

    let remote = conflict.remote_payload.clone();
    entities.set_confirmed(&account_id, &key, conflict.remote_version, remote.clone(), now)?;

    let target = match &resolution {
        Resolution::KeepRemote => remote.clone(),
        Resolution::KeepLocal => conflict.local_payload.clone(),
        Resolution::Merged(Value::Null) => None,
        Resolution::Merged(value @ Value::Object(_)) => Some(value.clone()),
        Resolution::Merged(_) => {
            return Err(Error::InvalidInput(
                "merged payload must be a JSON object or null".to_string(),
            ))
        }
    };

    entities.set_local_payload(&account_id, &key, target.clone(), now)?;

    let new_op = if target == remote {
        None
    } else {
        let kind = match (&target, &remote) {
            (None, _) => OperationKind::Delete,
            (Some(_), None) => OperationKind::Create,
            (Some(_), Some(_)) => OperationKind::Update,
        };
        enqueue_in(conn, &account_id, &key, kind, target, remote, now)?
    };

    conflict.state = ConflictState::Resolved;
    conflict.resolution = Some(resolution);
    conflict.resolved_at = Some(now);
    ConflictRepository::new(conn).save(conflict)?;

    Ok(new_op)
}

/// Run the automatic policies and either settle the conflict or park it
/// for the user.
fn evaluate_in(conn: &Connection, mut conflict: Conflict, now: i64) -> Result<RaiseOutcome> {
    match decide(&conflict) {
        Decision::Auto {
            resolution,
            discarded,
        } => {
            conflict.state = ConflictState::AutoResolved;
            let new_op = apply_in(conn, &mut conflict, resolution, now)?;
            Ok(RaiseOutcome {
                conflict,
                new_op,
                discarded,
            })
        }
        Decision::AwaitUser => {
            conflict.state = ConflictState::AwaitingUser;
            ConflictRepository::new(conn).save(&conflict)?;
            Ok(RaiseOutcome {
                conflict,
                new_op: None,
                discarded: None,
            })
        }
    }
}

/// Detects and settles conflicts for one session
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    ctx: Arc<SessionContext>,
}

impl ConflictResolver {
    pub const fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Handle a push answered with a newer remote version.
    ///
    /// The operation goes back to pending and stays linked to the conflict.
    /// Returns `None` when the versions are equal, which is not a conflict.
    pub fn raise_from_push(
        &self,
        op: &SyncOperation,
        remote_version: i64,
        remote_payload: Option<Value>,
    ) -> Result<Option<Conflict>> {
        let account_id = &self.ctx.account_id;
        let key = EntityKey::new(op.entity_type, op.entity_id.clone());

        let outcome = self.ctx.store.write(|tx| {
            let now = now_millis();
            OperationRepository::new(tx).set_status(&op.op_id, OperationStatus::Pending, None, now)?;

            let entity = EntityRepository::new(tx).get(account_id, &key)?;
            let (local_version, local_payload, base_payload) = entity
                .map(|record| (record.version, record.payload, record.confirmed_payload))
                .unwrap_or_default();

            if remote_version == local_version {
                debug!(%key, remote_version, "Equal versions; not a conflict");
                return Ok(None);
            }

            let conflict = match ConflictRepository::new(tx).active_for_entity(account_id, &key)? {
                Some(existing) => Conflict {
                    remote_version,
                    remote_payload,
                    ..existing
                },
                None => Conflict {
                    conflict_id: ConflictId::new(),
                    account_id: account_id.clone(),
                    entity_type: key.entity_type,
                    entity_id: key.entity_id.clone(),
                    op_id: Some(op.op_id),
                    local_kind: op.kind,
                    local_version,
                    remote_version,
                    local_payload,
                    remote_payload,
                    base_payload,
                    detected_at: now,
                    state: ConflictState::Detected,
                    resolution: None,
                    resolved_at: None,
                },
            };
            evaluate_in(tx, conflict, now).map(Some)
        })?;

        Ok(outcome.map(|outcome| self.publish(outcome)))
    }

    /// Handle a pulled change for an entity with unconfirmed local operations,
    /// a failed edit that was never rolled back, or an open conflict.
    pub fn raise_from_pull(&self, change: &RemoteChange) -> Result<Option<Conflict>> {
        let account_id = &self.ctx.account_id;
        let key = change.key();

        let outcome = self.ctx.store.write(|tx| {
            let now = now_millis();
            let entity = EntityRepository::new(tx).get(account_id, &key)?;
            let (local_version, local_payload, base_payload) = entity
                .map(|record| (record.version, record.payload, record.confirmed_payload))
                .unwrap_or_default();

            if change.version <= local_version {
                return Ok(None);
            }

            if let Some(existing) = ConflictRepository::new(tx).active_for_entity(account_id, &key)? {
                if change.version <= existing.remote_version {
                    return Ok(None);
                }
                let conflict = Conflict {
                    remote_version: change.version,
                    remote_payload: change.payload.clone(),
                    ..existing
                };
                return evaluate_in(tx, conflict, now).map(Some);
            }

            // A failed edit that is still shown locally counts as unconfirmed work.
            let ops = OperationRepository::new(tx);
            let mut unconfirmed = ops.active_for_entity(account_id, &key)?;
            if unconfirmed.is_empty() {
                unconfirmed = ops.failed_for_entity(account_id, &key)?;
            }
            let Some(latest) = unconfirmed.pop() else {
                return Ok(None);
            };

            let conflict = Conflict {
                conflict_id: ConflictId::new(),
                account_id: account_id.clone(),
                entity_type: key.entity_type,
                entity_id: key.entity_id.clone(),
                op_id: Some(latest.op_id),
                local_kind: latest.kind,
                local_version,
                remote_version: change.version,
                local_payload,
                remote_payload: change.payload.clone(),
                base_payload,
                detected_at: now,
                state: ConflictState::Detected,
                resolution: None,
                resolved_at: None,
            };
            evaluate_in(tx, conflict, now).map(Some)
        })?;

        Ok(outcome.map(|outcome| self.publish(outcome)))
    }

    /// Apply the user's choice to a conflict awaiting resolution
    pub fn resolve(&self, conflict_id: &ConflictId, resolution: Resolution) -> Result<Conflict> {
        let account_id = &self.ctx.account_id;

        let (conflict, new_op) = self.ctx.store.write(|tx| {
            let mut conflict = ConflictRepository::new(tx)
                .get(account_id, conflict_id)?
                .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
            if !conflict.is_active() {
                return Err(Error::InvalidInput(format!(
                    "conflict {conflict_id} is already resolved"
                )));
            }
            let new_op = apply_in(tx, &mut conflict, resolution, now_millis())?;
            Ok((conflict, new_op))
        })?;

        info!(
            conflict_id = %conflict.conflict_id,
            entity = %conflict.key(),
            strategy = conflict.resolution.as_ref().map_or("none", Resolution::strategy),
            "Conflict resolved by user"
        );
        self.publish_resolved(&conflict, false);
        if let Some(op) = &new_op {
            self.ctx
                .events
                .publish(SyncEvent::OptimisticUpdate(OptimisticUpdate::from_operation(op, None)));
            self.ctx.request_sync();
        }
        self.ctx.refresh_status();
        Ok(conflict)
    }

    pub fn get(&self, conflict_id: &ConflictId) -> Result<Option<Conflict>> {
        self.ctx
            .store
            .read(|conn| ConflictRepository::new(conn).get(&self.ctx.account_id, conflict_id))
    }

    /// Conflicts not yet resolved
    pub fn active(&self) -> Result<Vec<Conflict>> {
        self.ctx
            .store
            .read(|conn| ConflictRepository::new(conn).list_active(&self.ctx.account_id))
    }

    /// Resolved conflicts, most recent first
    pub fn history(&self) -> Result<Vec<Conflict>> {
        self.ctx
            .store
            .read(|conn| ConflictRepository::new(conn).list_resolved(&self.ctx.account_id))
    }

    fn publish(&self, outcome: RaiseOutcome) -> Conflict {
        let RaiseOutcome {
            conflict,
            new_op,
            discarded,
        } = outcome;

        if conflict.is_active() {
            info!(
                conflict_id = %conflict.conflict_id,
                entity = %conflict.key(),
                local_version = conflict.local_version,
                remote_version = conflict.remote_version,
                "Conflict needs user resolution"
            );
            self.ctx
                .events
                .publish(SyncEvent::ConflictRaised(conflict.clone()));
            self.ctx.notifier.queue_notification(
                "Sync conflict",
                &format!(
                    "Your {} was changed on another device. Choose which version to keep.",
                    conflict.entity_type
                ),
                NotificationType::ConflictRequiresAttention,
                serde_json::json!({
                    "conflict_id": conflict.conflict_id,
                    "entity_type": conflict.entity_type,
                    "entity_id": conflict.entity_id,
                }),
            );
        } else {
            info!(
                conflict_id = %conflict.conflict_id,
                entity = %conflict.key(),
                strategy = conflict.resolution.as_ref().map_or("none", Resolution::strategy),
                "Conflict resolved automatically"
            );
            if let Some(side) = discarded {
                let payload = match side {
                    DiscardedSide::Local => conflict.local_payload.clone(),
                    DiscardedSide::Remote => conflict.remote_payload.clone(),
                };
                self.ctx.events.publish(SyncEvent::UpdateDiscarded {
                    entity_type: conflict.entity_type,
                    entity_id: conflict.entity_id.clone(),
                    side,
                    payload,
                });
            }
            self.publish_resolved(&conflict, true);
            if let Some(op) = &new_op {
                self.ctx
                    .events
                    .publish(SyncEvent::OptimisticUpdate(OptimisticUpdate::from_operation(op, None)));
            }
        }
        self.ctx.refresh_status();
        conflict
    }

    fn publish_resolved(&self, conflict: &Conflict, automatic: bool) {
        if let Some(resolution) = &conflict.resolution {
            self.ctx.events.publish(SyncEvent::ConflictResolved {
                conflict_id: conflict.conflict_id,
                entity_type: conflict.entity_type,
                entity_id: conflict.entity_id.clone(),
                resolution: resolution.clone(),
                automatic,
            });
        }
    }
}
