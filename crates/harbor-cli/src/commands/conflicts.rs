use harbor_core::models::Conflict;
use harbor_core::sync::{ConflictResolver, Resolution};
use serde_json::Value;

use crate::cli::{ConflictCommands, ResolutionChoice};
use crate::commands::common::{format_conflict_lines, Context};
use crate::error::CliError;

pub async fn run_conflicts(command: ConflictCommands, context: &Context) -> Result<(), CliError> {
    match command {
        ConflictCommands::List { all, limit, json } => {
            let store = context.open_store()?;
            let conflicts = store.conflicts(!all, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conflicts)?);
            } else if conflicts.is_empty() {
                println!("No conflicts.");
            } else {
                for line in format_conflict_lines(&conflicts) {
                    println!("{line}");
                }
            }
        }
        ConflictCommands::Resolve {
            id,
            choice,
            payload,
        } => {
            let conflict = resolve_conflict(id, choice, payload.as_deref(), context).await?;
            println!(
                "Resolved conflict #{} on {}/{} ({})",
                conflict.id,
                conflict.table_name,
                conflict.record_id,
                conflict.resolution.as_str()
            );
        }
    }
    Ok(())
}

pub async fn resolve_conflict(
    id: i64,
    choice: ResolutionChoice,
    payload: Option<&str>,
    context: &Context,
) -> Result<Conflict, CliError> {
    let resolution = resolution_from_choice(choice, payload)?;
    let store = context.open_store()?;
    if store.conflict(id).await?.is_none() {
        return Err(CliError::ConflictNotFound(id));
    }
    let resolver = ConflictResolver::new(store, context.settings.conflict_strategy()?);
    Ok(resolver.resolve(id, resolution).await?)
}

pub fn resolution_from_choice(
    choice: ResolutionChoice,
    payload: Option<&str>,
) -> Result<Resolution, CliError> {
    match choice {
        ResolutionChoice::Local => Ok(Resolution::UseLocal),
        ResolutionChoice::Remote => Ok(Resolution::UseRemote),
        ResolutionChoice::Merged => {
            let raw = payload.ok_or(CliError::MissingMergePayload)?;
            match serde_json::from_str::<Value>(raw)? {
                Value::Object(merged) => Ok(Resolution::Merged(merged)),
                _ => Err(CliError::Config("--payload must be a JSON object".to_string())),
            }
        }
    }
}
