//! Persisted sync preferences and bookkeeping

use serde::{Deserialize, Serialize};

/// Device-local settings stored alongside the mirrored data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Whether the user enabled periodic background sync
    pub background_sync_enabled: bool,
    /// Completion time of the last successful pass (Unix ms)
    pub last_sync_at: Option<i64>,
    /// Error message of the last failed pass, cleared on success
    pub last_sync_error: Option<String>,
}
