//! Remote store contract.
//!
//! The remote store is the authority for versions. Writes carry the version
//! they were based on plus a caller-generated idempotency key; a stale base
//! version is answered with a conflict and the current remote state.

mod http;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Device, EntityKey, EntityType, OpId, OperationKind};

pub use http::{HttpRemoteStore, IDEMPOTENCY_KEY_HEADER};
pub use memory::{MemoryBackend, MemoryRemoteStore, PushValidator};

/// Failures talking to the remote store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    #[error("remote store unavailable (HTTP {status}): {message}")]
    Unavailable {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("remote store refused credentials (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("remote store rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response from remote store: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status.
    ///
    /// 408, 429 and 5xx are retryable; 401 and 403 are credential failures;
    /// any other 4xx rejects the request itself.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status, message },
            408 | 429 | 500..=599 => Self::Unavailable {
                status,
                message,
                retry_after,
            },
            400..=499 => Self::Rejected { status, message },
            _ => Self::InvalidResponse(format!("unexpected HTTP {status}: {message}")),
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Unavailable { .. })
    }

    /// Server-suggested wait before the next attempt
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(status.as_u16(), error.to_string(), None)
        } else {
            Self::Unreachable(error.to_string())
        }
    }
}

/// One write sent to the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOperation {
    pub op_id: OpId,
    pub idempotency_key: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: OperationKind,
    pub payload: Option<Value>,
    /// Remote version the write was based on (0 for a new entity)
    pub base_version: i64,
    pub device_id: String,
}

impl PushOperation {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub operations: Vec<PushOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Accepted,
    /// Base version is stale; `current_version` holds the remote version
    Conflict,
    /// Validation failed; terminal for the operation
    Rejected,
}

/// Outcome of one pushed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub op_id: OpId,
    pub status: PushStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A remote write observed through pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: i64,
    /// `None` when the entity was deleted
    pub payload: Option<Value>,
    pub changed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl RemoteChange {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    /// Cursor to resume from; unchanged when there was nothing new
    pub cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Remote store the sync engine talks to, scoped to one authenticated account
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn push(&self, request: PushRequest) -> Result<Vec<PushResult>, RemoteError>;

    async fn pull(&self, since: Option<&str>) -> Result<PullResponse, RemoteError>;

    /// Cheap connectivity check
    async fn heartbeat(&self) -> Result<(), RemoteError>;

    /// Idempotent upsert keyed by `device_id`; returns the stored device
    async fn register_device(&self, device: &Device) -> Result<Device, RemoteError>;

    async fn list_devices(&self) -> Result<Vec<Device>, RemoteError>;

    async fn set_primary_device(&self, device_id: &str) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(RemoteError::from_status(503, String::new(), None).is_retryable());
        assert!(RemoteError::from_status(429, String::new(), None).is_retryable());
        assert!(RemoteError::from_status(408, String::new(), None).is_retryable());
        assert!(matches!(
            RemoteError::from_status(403, String::new(), None),
            RemoteError::Unauthorized { status: 403, .. }
        ));
        assert!(matches!(
            RemoteError::from_status(422, "bad".into(), None),
            RemoteError::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn retry_after_only_on_unavailable() {
        let error = RemoteError::from_status(429, String::new(), Some(Duration::from_secs(7)));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(RemoteError::Unreachable("x".into()).retry_after(), None);
    }
}
