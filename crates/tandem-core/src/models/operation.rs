//! Sync operation model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{EntityKey, EntityType};

uuid_id! {
    /// A unique identifier for a queued operation
    OpId
}

/// The local mutation an operation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// The kind that replaces `older` when `newer` supersedes it.
    ///
    /// A create that was never sent stays a create, so the remote store
    /// still sees the entity come into existence.
    pub const fn coalesce(older: Self, newer: Self) -> Self {
        match (older, newer) {
            (Self::Create, Self::Update) => Self::Create,
            (_, newer) => newer,
        }
    }

    /// The kind to send given the last confirmed remote version and whether
    /// an earlier write for the entity is already on its way.
    ///
    /// `None` means there is nothing to send.
    pub const fn settle(self, remote_version: i64, in_flight: bool) -> Option<Self> {
        let known = remote_version > 0 || in_flight;
        match self {
            Self::Create if remote_version > 0 => Some(Self::Update),
            Self::Delete if !known => None,
            kind => Some(kind),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

/// Lifecycle of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Confirmed,
    Failed,
    Superseded,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
        }
    }

    /// Pending or in flight.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InFlight)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Superseded)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            "superseded" => Ok(Self::Superseded),
            other => Err(format!("unknown operation status '{other}'")),
        }
    }
}

/// A durable local mutation awaiting confirmation by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Insertion order within the local queue
    pub seq: i64,
    pub op_id: OpId,
    pub account_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    /// Payload to send; `None` for deletes
    pub payload: Option<Value>,
    /// Stable key sent with every dispatch attempt of this operation
    pub idempotency_key: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    pub attempt_count: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
    /// Entity payload before the earliest unconfirmed change this operation covers
    pub rollback: Option<Value>,
    /// Whether local state was already restored from `rollback`
    pub rolled_back: bool,
}

impl SyncOperation {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}
