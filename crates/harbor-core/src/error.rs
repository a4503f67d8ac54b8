//! Error types for harbor-core

use thiserror::Error;

use crate::sync::SyncError;

/// Result type alias using harbor-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in harbor-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record, change or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local storage was corrupted and has been reinitialized
    #[error("Storage error: {0}")]
    Storage(String),

    /// Sync failure reported by the remote side or the scheduler
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl Error {
    /// Whether this error means the on-disk database can no longer be trusted.
    pub fn is_storage_corruption(&self) -> bool {
        if let Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) = self {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ) {
                return true;
            }
        }

        let message = self.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("disk image is malformed")
    }
}
