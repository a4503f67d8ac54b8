use harbor_core::status::SyncStatusSnapshot;
use serde::Serialize;

use crate::commands::common::{format_pending_lines, format_timestamp, Context};
use crate::error::CliError;

#[derive(Serialize)]
struct StatusOutput<'a> {
    #[serde(flatten)]
    status: &'a SyncStatusSnapshot,
    remote_configured: bool,
    database_path: String,
}

pub async fn run_status(as_json: bool, context: &Context) -> Result<(), CliError> {
    let status = current_status(context).await?;
    if as_json {
        let output = StatusOutput {
            status: &status,
            remote_configured: context.settings.has_remote(),
            database_path: context.db_path.display().to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for line in format_status_lines(&status, context.settings.has_remote()) {
        println!("{line}");
    }
    Ok(())
}

/// Probe the backend when one is configured; otherwise report offline.
pub async fn current_status(context: &Context) -> Result<SyncStatusSnapshot, CliError> {
    if context.settings.has_remote() {
        let runtime = context.open_runtime()?;
        runtime.probe_once().await;
        Ok(runtime.sync_status().await?)
    } else {
        let store = context.open_store()?;
        Ok(context.local_status(&store).snapshot().await?)
    }
}

pub fn format_status_lines(status: &SyncStatusSnapshot, remote_configured: bool) -> Vec<String> {
    let mut lines = vec![format!("State:        {}", status.state.as_str())];
    lines.push(format!(
        "Network:      {}",
        match (remote_configured, status.is_online) {
            (false, _) => "not configured",
            (true, true) => "online",
            (true, false) => "offline",
        }
    ));
    lines.push(format!(
        "Last sync:    {}",
        status
            .last_sync
            .map_or_else(|| "never".to_string(), format_timestamp)
    ));
    lines.push(format!("Pending:      {}", status.pending_changes));
    if status.needs_attention > 0 {
        lines.push(format!(
            "Attention:    {} change(s) stopped retrying (run `harbor retry`)",
            status.needs_attention
        ));
    }
    if status.unresolved_conflicts > 0 {
        lines.push(format!(
            "Conflicts:    {} unresolved (run `harbor conflicts list`)",
            status.unresolved_conflicts
        ));
    }
    if let Some(error) = &status.error {
        lines.push(format!("Last error:   {error}"));
    }
    lines.push(format!("Storage:      {}", status.health.as_str()));
    lines
}

pub async fn run_pending(as_json: bool, context: &Context) -> Result<(), CliError> {
    let store = context.open_store()?;
    let changes = store.pending_changes().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
    } else if changes.is_empty() {
        println!("No pending changes.");
    } else {
        for line in format_pending_lines(&changes) {
            println!("{line}");
        }
    }
    Ok(())
}
