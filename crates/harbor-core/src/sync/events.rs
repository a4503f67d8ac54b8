//! Sync pass results and progress events

use serde::Serialize;

use crate::models::{ChangeOperation, ConflictResolution};

/// Why a pass did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another pass was in flight; it already covers the pending work
    AlreadyRunning,
    /// The network monitor reported offline
    Offline,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyRunning => "already_running",
            Self::Offline => "offline",
        }
    }
}

/// Phase of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Upload,
    Download,
}

/// Counters of one completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub started_at: i64,
    pub finished_at: i64,
    /// Changes acknowledged by the backend
    pub uploaded: usize,
    /// Changes that failed and stay queued
    pub failed: usize,
    /// Conflicts recorded during upload
    pub conflicts: usize,
    /// Conflicts settled by the configured strategy
    pub auto_resolved: usize,
    /// Changes held back (conflict, exhausted or backing off)
    pub skipped: usize,
    /// Remote rows written to the mirror
    pub downloaded: usize,
    /// Local rows removed by remote tombstones
    pub deleted: usize,
    /// Tables whose download failed
    pub failed_tables: Vec<String>,
    /// The monitor went offline before the pass finished
    pub interrupted: bool,
}

/// Result of a `perform_full_sync` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped { reason: SkipReason },
}

impl SyncOutcome {
    /// The report of a pass that ran.
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped { .. } => None,
        }
    }
}

/// Push notifications emitted while the engine works
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started,
    /// Advisory progress, 0 to 100
    Progress { phase: SyncPhase, percent: u8 },
    Uploaded {
        table: String,
        record_id: String,
        operation: ChangeOperation,
    },
    UploadFailed {
        table: String,
        record_id: String,
        error: String,
        exhausted: bool,
    },
    ConflictDetected {
        conflict_id: i64,
        table: String,
        record_id: String,
        resolution: ConflictResolution,
    },
    /// `cursor` is the remote version (Unix µs) the table is synced up to
    Downloaded { table: String, rows: usize, cursor: i64 },
    Finished(SyncReport),
    Failed { error: String },
    Skipped { reason: SkipReason },
}
