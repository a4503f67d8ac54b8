//! Per-table download watermarks

use serde::{Deserialize, Serialize};

/// Last remote row already downloaded for a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub table_name: String,
    /// Remote `updated_at` in Unix microseconds
    pub last_synced_at: i64,
    /// Id of the last row at `last_synced_at`; `None` when set by version alone
    pub last_synced_id: Option<String>,
}
