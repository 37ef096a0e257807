//! UI-facing view of an unconfirmed operation

use serde::{Deserialize, Serialize};

use super::{ConflictId, EntityType, OpId, OperationKind, OperationStatus, SyncOperation};

/// Provisional local change shown to the UI.
///
/// Derived from its backing [`SyncOperation`], so `is_pending` always tracks
/// the operation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    pub id: OpId,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub is_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<ConflictId>,
}

impl OptimisticUpdate {
    /// An update that needed no remote write
    pub fn settled(entity_type: EntityType, entity_id: &str, kind: OperationKind) -> Self {
        Self {
            id: OpId::new(),
            entity_type,
            entity_id: entity_id.to_string(),
            kind,
            is_pending: false,
            error: None,
            conflict_id: None,
        }
    }

    pub fn from_operation(op: &SyncOperation, conflict_id: Option<ConflictId>) -> Self {
        Self {
            id: op.op_id,
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            kind: op.kind,
            is_pending: op.status.is_active(),
            error: if op.status == OperationStatus::Failed {
                op.last_error.clone()
            } else {
                None
            },
            conflict_id,
        }
    }
}
