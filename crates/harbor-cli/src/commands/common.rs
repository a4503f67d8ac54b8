use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use harbor_core::diagnostics::DiagnosticsExporter;
use harbor_core::models::{Conflict, EntityRecord, Payload, PendingChange};
use harbor_core::network::NetworkMonitor;
use harbor_core::scheduler::{SchedulerState, TokioIntervalSource};
use harbor_core::status::{StatusAggregator, SyncActivity};
use harbor_core::sync::{SyncEvent, SyncOutcome, SyncReport};
use harbor_core::{Health, LocalStore, SyncRuntime, SyncSettings};
use serde_json::Value;

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "config.json";
const DB_FILE_NAME: &str = "harbor.db";

/// Settings and paths resolved for one invocation
pub struct Context {
    pub settings: SyncSettings,
    pub db_path: PathBuf,
}

impl Context {
    pub fn load(config_path: Option<PathBuf>, db_path: Option<PathBuf>) -> Result<Self, CliError> {
        let config_path = resolve_config_path(config_path)?;
        let settings = load_settings(&config_path)?;
        let db_path = resolve_db_path(db_path, &settings)?;
        Ok(Self { settings, db_path })
    }

    /// Open the local store without any backend.
    pub fn open_store(&self) -> Result<LocalStore, CliError> {
        ensure_parent_dir(&self.db_path)?;
        let store = LocalStore::open_path(&self.db_path, &self.settings.tables)?;
        warn_on_critical_health(store.health());
        Ok(store)
    }

    /// Open the full sync stack; fails when no backend is configured.
    pub fn open_runtime(&self) -> Result<SyncRuntime, CliError> {
        if !self.settings.has_remote() {
            return Err(CliError::SyncNotConfigured);
        }
        ensure_parent_dir(&self.db_path)?;
        let runtime = SyncRuntime::connect(
            self.settings.clone(),
            &self.db_path,
            Arc::new(TokioIntervalSource),
        )?;
        warn_on_critical_health(runtime.store().health());
        Ok(runtime)
    }

    /// Status reader for a store used without a backend (always offline).
    pub fn local_status(&self, store: &LocalStore) -> StatusAggregator {
        StatusAggregator::new(
            store.clone(),
            NetworkMonitor::new(false),
            SyncActivity::new(),
            self.settings.retry_policy(),
        )
    }

    pub fn local_diagnostics(&self, store: &LocalStore) -> DiagnosticsExporter {
        DiagnosticsExporter::new(
            store.clone(),
            self.local_status(store),
            self.settings.retry_policy(),
        )
    }
}

fn warn_on_critical_health(health: Health) {
    if health == Health::Critical {
        eprintln!(
            "Warning: the local database was corrupt and has been reset; unsynced changes were lost."
        );
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn load_settings(path: &Path) -> Result<SyncSettings, CliError> {
    let mut settings = SyncSettings::load_from_path(path)?;
    settings.apply_env(|name| env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_config.or_else(|| env::var_os("HARBOR_CONFIG").map(PathBuf::from)) {
        return Ok(path);
    }
    default_config_path()
}

pub fn default_config_path() -> Result<PathBuf, CliError> {
    dirs::config_dir()
        .map(|dir| dir.join("harbor").join(CONFIG_FILE_NAME))
        .ok_or_else(|| CliError::Config("failed to resolve the config directory".to_string()))
}

pub fn resolve_db_path(
    cli_db_path: Option<PathBuf>,
    settings: &SyncSettings,
) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path
        .or_else(|| env::var_os("HARBOR_DB_PATH").map(PathBuf::from))
        .or_else(|| settings.database_path.as_ref().map(PathBuf::from))
    {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("harbor").join(DB_FILE_NAME))
        .ok_or_else(|| CliError::Config("failed to resolve the data directory".to_string()))
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Parse `NAME=VALUE`; VALUE is read as JSON when it parses, else as a string.
pub fn parse_field_assignment(raw: &str) -> Result<(String, Value), CliError> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(CliError::InvalidField(raw.to_string()));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::InvalidField(raw.to_string()));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Build a payload from an optional JSON object plus field assignments.
pub fn build_payload(json: Option<&str>, fields: &[String]) -> Result<Payload, CliError> {
    let mut payload = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(object) => object,
            _ => {
                return Err(CliError::Config(
                    "--json must be a JSON object".to_string(),
                ))
            }
        },
        None => Payload::new(),
    };
    for raw in fields {
        let (name, value) = parse_field_assignment(raw)?;
        payload.insert(name, value);
    }
    if payload.is_empty() {
        return Err(CliError::EmptyPayload);
    }
    Ok(payload)
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Single-line JSON preview of a payload, truncated to `max_chars`.
pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let rendered = Value::Object(payload.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = rendered.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_record_lines(records: &[EntityRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let short_id = record.id.chars().take(13).collect::<String>();
            format!(
                "{short_id:<13}  {:<7}  {:<10}  {}",
                record.sync_status.as_str(),
                format_relative_time(record.last_modified, now_ms),
                payload_preview(&record.fields, 60)
            )
        })
        .collect()
}

pub fn format_pending_lines(changes: &[PendingChange]) -> Vec<String> {
    changes
        .iter()
        .map(|change| {
            let mut line = format!(
                "#{:<5} {:<6}  {}/{}  queued {}",
                change.id,
                change.operation.as_str(),
                change.table_name,
                change.record_id,
                format_timestamp(change.created_at)
            );
            if let Some(error) = &change.last_error {
                line.push_str(&format!("  retries={} error={error}", change.retry_count));
            }
            line
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "#{:<5} {}  {:<10}  {}/{}  remote={}",
                conflict.id,
                format_timestamp(conflict.detected_at),
                conflict.resolution.as_str(),
                conflict.table_name,
                conflict.record_id,
                if conflict.remote_payload.is_some() {
                    "present"
                } else {
                    "gone"
                }
            )
        })
        .collect()
}

pub fn format_report(report: &SyncReport) -> String {
    let mut line = format!(
        "Sync completed: {} uploaded, {} failed, {} conflicts ({} auto-resolved), {} downloaded, {} deleted",
        report.uploaded,
        report.failed,
        report.conflicts,
        report.auto_resolved,
        report.downloaded,
        report.deleted
    );
    if report.skipped > 0 {
        line.push_str(&format!(", {} held back", report.skipped));
    }
    if !report.failed_tables.is_empty() {
        line.push_str(&format!("; download failed for {}", report.failed_tables.join(", ")));
    }
    if report.interrupted {
        line.push_str("; connection lost, remaining changes stay queued");
    }
    line
}

pub fn format_outcome(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Completed(report) => format_report(report),
        SyncOutcome::Skipped { reason } => format!("Sync skipped: {}", reason.as_str()),
    }
}

/// One line per noteworthy event; progress ticks are dropped.
pub fn format_event(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::Started => Some("sync started".to_string()),
        SyncEvent::Progress { .. } | SyncEvent::Skipped { .. } => None,
        SyncEvent::Uploaded {
            table,
            record_id,
            operation,
        } => Some(format!("uploaded {operation} {table}/{record_id}")),
        SyncEvent::UploadFailed {
            table,
            record_id,
            error,
            exhausted,
        } => Some(format!(
            "upload of {table}/{record_id} failed{}: {error}",
            if *exhausted { " (needs attention)" } else { "" }
        )),
        SyncEvent::ConflictDetected {
            conflict_id,
            table,
            record_id,
            resolution,
        } => Some(format!(
            "conflict #{conflict_id} on {table}/{record_id}: {}",
            resolution.as_str()
        )),
        SyncEvent::Downloaded { table, rows, .. } => Some(format!("downloaded {rows} rows of {table}")),
        SyncEvent::Finished(report) => Some(format_report(report)),
        SyncEvent::Failed { error } => Some(format!("sync failed: {error}")),
    }
}

/// Background state implied by the persisted flag when no wake is registered.
pub const fn configured_background_state(enabled: bool) -> SchedulerState {
    if enabled {
        SchedulerState::ForegroundOnly
    } else {
        SchedulerState::Disabled
    }
}
