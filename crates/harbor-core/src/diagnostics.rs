//! Support diagnostics shared by all clients.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::models::{ChangeOperation, SyncCursor};
use crate::scheduler::SchedulerState;
use crate::services::LocalStore;
use crate::status::{StatusAggregator, SyncStatusSnapshot};
use crate::sync::RetryPolicy;
use crate::util::{format_micros_rfc3339, format_millis_rfc3339, unix_millis_now};
use crate::Result;

const MAX_LISTED_ITEMS: usize = 20;

/// Diagnostics output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticsFormat {
    Json,
    Text,
}

impl DiagnosticsFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
    pub version: &'static str,
}

impl Platform {
    pub const fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// A queued change that has failed at least once. Payloads are left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChange {
    pub table: String,
    pub record_id: String,
    pub operation: ChangeOperation,
    pub retry_count: u32,
    pub exhausted: bool,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenConflict {
    pub id: i64,
    pub table: String,
    pub record_id: String,
    pub detected_at: i64,
}

/// Snapshot handed to support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub platform: Platform,
    pub generated_at: i64,
    pub status: SyncStatusSnapshot,
    pub background_sync: SchedulerState,
    pub database_path: Option<String>,
    pub estimated_size_bytes: i64,
    pub tracked_tables: Vec<String>,
    pub cursors: Vec<SyncCursor>,
    pub failed_changes: Vec<FailedChange>,
    pub open_conflicts: Vec<OpenConflict>,
}

/// Collects [`Diagnostics`] from the store and the status aggregator
#[derive(Clone)]
pub struct DiagnosticsExporter {
    store: LocalStore,
    status: StatusAggregator,
    retry: RetryPolicy,
}

impl DiagnosticsExporter {
    pub const fn new(store: LocalStore, status: StatusAggregator, retry: RetryPolicy) -> Self {
        Self {
            store,
            status,
            retry,
        }
    }

    pub async fn collect(&self, background_sync: SchedulerState) -> Result<Diagnostics> {
        let status = self.status.snapshot().await?;
        let estimated_size_bytes = self.store.estimated_size_bytes().await?;
        let cursors = self.store.cursors().await?;

        let failed_changes = self
            .store
            .pending_changes()
            .await?
            .into_iter()
            .filter_map(|change| {
                let last_error = change.last_error?;
                Some(FailedChange {
                    exhausted: self.retry.is_exhausted(change.retry_count),
                    table: change.table_name,
                    record_id: change.record_id,
                    operation: change.operation,
                    retry_count: change.retry_count,
                    last_error,
                })
            })
            .take(MAX_LISTED_ITEMS)
            .collect();

        let open_conflicts = self
            .store
            .conflicts(true, MAX_LISTED_ITEMS)
            .await?
            .into_iter()
            .map(|conflict| OpenConflict {
                id: conflict.id,
                table: conflict.table_name,
                record_id: conflict.record_id,
                detected_at: conflict.detected_at,
            })
            .collect();

        Ok(Diagnostics {
            platform: Platform::current(),
            generated_at: unix_millis_now(),
            status,
            background_sync,
            database_path: self.store.path().map(|path| path.display().to_string()),
            estimated_size_bytes,
            tracked_tables: self.store.tables().to_vec(),
            cursors,
            failed_changes,
            open_conflicts,
        })
    }
}

/// Render diagnostics as pretty-printed JSON.
pub fn render_json(diagnostics: &Diagnostics) -> serde_json::Result<String> {
    serde_json::to_string_pretty(diagnostics)
}

/// Render diagnostics as a plain-text report.
#[must_use]
pub fn render_text(diagnostics: &Diagnostics) -> String {
    let status = &diagnostics.status;
    let mut output = String::new();

    let _ = writeln!(output, "Harbor diagnostics");
    let _ = writeln!(
        output,
        "generated: {}",
        format_millis_rfc3339(diagnostics.generated_at)
    );
    let _ = writeln!(
        output,
        "platform: {} {} (v{})",
        diagnostics.platform.os, diagnostics.platform.arch, diagnostics.platform.version
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "state: {}", status.state.as_str());
    let _ = writeln!(output, "health: {}", status.health.as_str());
    let _ = writeln!(output, "online: {}", status.is_online);
    let _ = writeln!(
        output,
        "last sync: {}",
        status
            .last_sync
            .map_or_else(|| "never".to_string(), format_millis_rfc3339)
    );
    if let Some(error) = &status.error {
        let _ = writeln!(output, "last error: {error}");
    }
    let _ = writeln!(output, "pending changes: {}", status.pending_changes);
    let _ = writeln!(output, "needs attention: {}", status.needs_attention);
    let _ = writeln!(output, "unresolved conflicts: {}", status.unresolved_conflicts);
    let _ = writeln!(
        output,
        "background sync: {}",
        diagnostics.background_sync.as_str()
    );
    let _ = writeln!(
        output,
        "database: {} ({} bytes)",
        diagnostics.database_path.as_deref().unwrap_or("in-memory"),
        diagnostics.estimated_size_bytes
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "cursors:");
    for table in &diagnostics.tracked_tables {
        let cursor = diagnostics
            .cursors
            .iter()
            .find(|cursor| &cursor.table_name == table)
            .map_or_else(
                || "never".to_string(),
                |cursor| match &cursor.last_synced_id {
                    Some(id) => format!("{} ({id})", format_micros_rfc3339(cursor.last_synced_at)),
                    None => format_micros_rfc3339(cursor.last_synced_at),
                },
            );
        let _ = writeln!(output, "  {table}: {cursor}");
    }

    if !diagnostics.failed_changes.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "failed changes:");
        for change in &diagnostics.failed_changes {
            let _ = writeln!(
                output,
                "  {} {}/{} x{}{}: {}",
                change.operation,
                change.table,
                change.record_id,
                change.retry_count,
                if change.exhausted { " (gave up)" } else { "" },
                change.last_error
            );
        }
    }

    if !diagnostics.open_conflicts.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "open conflicts:");
        for conflict in &diagnostics.open_conflicts {
            let _ = writeln!(
                output,
                "  #{} {}/{} since {}",
                conflict.id,
                conflict.table,
                conflict.record_id,
                format_millis_rfc3339(conflict.detected_at)
            );
        }
    }

    output
}

/// Render diagnostics in the selected format.
pub fn render_diagnostics(
    diagnostics: &Diagnostics,
    format: DiagnosticsFormat,
) -> serde_json::Result<String> {
    match format {
        DiagnosticsFormat::Json => render_json(diagnostics),
        DiagnosticsFormat::Text => Ok(render_text(diagnostics)),
    }
}

/// Build a deterministic default file name for diagnostics exports.
#[must_use]
pub fn suggested_diagnostics_file_name(format: DiagnosticsFormat, timestamp_ms: i64) -> String {
    format!("harbor-diagnostics-{timestamp_ms}.{}", format.extension())
}
