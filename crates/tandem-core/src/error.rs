//! Error types for tandem-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using tandem-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tandem-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error from the local store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity, operation, conflict, device or backup not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Network or remote availability failure; retried with backoff
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Remote store refused the write as invalid; terminal for the operation
    #[error("Rejected by remote store: {0}")]
    ValidationRejected(String),

    /// Remote store holds a newer version than the write was based on
    #[error("Version conflict on {entity}: local base v{local_version}, remote v{remote_version}")]
    VersionConflict {
        entity: String,
        local_version: i64,
        remote_version: i64,
    },

    /// Backup schema version is not accepted by this build
    #[error("Backup schema version {found} is not supported (expected {expected})")]
    SchemaIncompatible { found: u32, expected: u32 },

    /// Device could not be registered; sync stays disabled
    #[error("Device registration failed: {0}")]
    RegistrationFailure(String),

    /// Remote store refused our credentials
    #[error("Remote store rejected credentials: {0}")]
    Unauthorized(String),

    /// Remote store answered with something we cannot interpret
    #[error("Remote protocol error: {0}")]
    Protocol(String),

    /// Further edits are blocked until the entity's conflict is resolved
    #[error("Entity {0} has an unresolved conflict")]
    EntityBlocked(String),

    /// Backup was already restored once
    #[error("Backup {0} has already been restored")]
    BackupConsumed(String),

    /// A sync cycle is already running for this session
    #[error("A sync cycle is already in progress")]
    CycleInProgress,

    /// The operation was cancelled cooperatively
    #[error("Sync cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the failure is worth retrying later without user involvement.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::CycleInProgress)
    }

    /// Whether the failure is terminal and should be surfaced to the user.
    pub const fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Self::ValidationRejected(_)
                | Self::EntityBlocked(_)
                | Self::SchemaIncompatible { .. }
                | Self::BackupConsumed(_)
                | Self::RegistrationFailure(_)
                | Self::Unauthorized(_)
        )
    }
}

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Unauthorized { .. } => Self::Unauthorized(error.to_string()),
            RemoteError::Rejected { message, .. } => Self::ValidationRejected(message),
            RemoteError::InvalidResponse(message) => Self::Protocol(message),
            RemoteError::Unreachable(_) | RemoteError::Unavailable { .. } => {
                Self::TransientNetwork(error.to_string())
            }
        }
    }
}
