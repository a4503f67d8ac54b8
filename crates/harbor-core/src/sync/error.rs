//! Sync error taxonomy

use thiserror::Error;

/// Failures reported by the remote backend, the engine or the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Transport failure, timeout, throttling or a 5xx; retried automatically
    #[error("Network error: {0}")]
    Network(String),

    /// The remote row moved on since the local edit, or the id already exists
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// The payload references a row the backend does not have yet; retried
    /// automatically
    #[error("Missing reference: {0}")]
    MissingReference(String),

    /// The backend rejected the payload; retrying will not help
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local storage failed during a pass
    #[error("Storage error: {0}")]
    Storage(String),

    /// Background wake is unsupported or was denied
    #[error("Scheduling error: {0}")]
    Scheduling(String),
}

impl SyncError {
    /// Whether the failure is worth retrying later.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::MissingReference(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

/// Result type for remote backend calls
pub type RemoteResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_reference_errors_are_transient() {
        assert!(SyncError::Network("timeout".to_string()).is_transient());
        assert!(SyncError::MissingReference("boat b1".to_string()).is_transient());
        assert!(!SyncError::Conflict("stale".to_string()).is_transient());
        assert!(!SyncError::Validation("bad".to_string()).is_transient());
        assert!(!SyncError::Scheduling("unsupported".to_string()).is_transient());
    }
}
