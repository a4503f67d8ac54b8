use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] harbor_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Invalid field assignment '{0}' (expected NAME=VALUE)")]
    InvalidField(String),
    #[error("No fields provided")]
    EmptyPayload,
    #[error("Conflict not found: {0}")]
    ConflictNotFound(i64),
    #[error("A merged resolution needs --payload")]
    MissingMergePayload,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Refusing to erase local data without --yes")]
    ConfirmationRequired,
    #[error(
        "Sync is not configured. Set remote_url and api_key in the config file, or HARBOR_REMOTE_URL and HARBOR_API_KEY."
    )]
    SyncNotConfigured,
}
