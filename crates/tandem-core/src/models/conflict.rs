//! Conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{EntityKey, EntityType, OpId, OperationKind};

uuid_id! {
    /// A unique identifier for a detected conflict
    ConflictId
}

/// Lifecycle of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Detected,
    AutoResolved,
    AwaitingUser,
    Resolved,
}

impl ConflictState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::AutoResolved => "auto_resolved",
            Self::AwaitingUser => "awaiting_user",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for ConflictState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(Self::Detected),
            "auto_resolved" => Ok(Self::AutoResolved),
            "awaiting_user" => Ok(Self::AwaitingUser),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown conflict state '{other}'")),
        }
    }
}

impl fmt::Display for ConflictState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict was or should be settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "payload", rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// A combined payload; `null` resolves to a delete
    Merged(Value),
}

impl Resolution {
    pub const fn strategy(&self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepRemote => "keep_remote",
            Self::Merged(_) => "merged",
        }
    }
}

/// A divergence between local pending state and remote state for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: ConflictId,
    pub account_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Local operation the conflict holds back
    pub op_id: Option<OpId>,
    pub local_kind: OperationKind,
    /// Remote version the local change was based on
    pub local_version: i64,
    pub remote_version: i64,
    pub local_payload: Option<Value>,
    pub remote_payload: Option<Value>,
    /// Last confirmed payload both sides started from
    pub base_payload: Option<Value>,
    pub detected_at: i64,
    pub state: ConflictState,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<i64>,
}

impl Conflict {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    pub const fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn resolution_wire_format() {
        let merged = Resolution::Merged(json!({"time": "10:00"}));
        assert_eq!(
            serde_json::to_value(&merged).unwrap(),
            json!({"strategy": "merged", "payload": {"time": "10:00"}})
        );
        assert_eq!(
            serde_json::to_value(Resolution::KeepLocal).unwrap(),
            json!({"strategy": "keep_local"})
        );
    }
}
