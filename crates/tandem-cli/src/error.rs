use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tandem_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No payload provided")]
    EmptyPayload,
    #[error("Payload must be a JSON object")]
    PayloadNotObject,
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Invalid ID '{0}'")]
    InvalidId(String),
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("--payload is required for the merged strategy")]
    MissingMergedPayload,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "No account configured. Run `tandem config init --account-id <ID>` or set TANDEM_ACCOUNT_ID."
    )]
    AccountNotConfigured,
}
