use harbor_core::sync::SyncOutcome;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{format_event, format_outcome, Context};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, context: &Context) -> Result<(), CliError> {
    let runtime = context.open_runtime()?;
    if !runtime.probe_once().await {
        tracing::info!("Backend not reachable, changes stay queued");
    }

    let outcome = runtime.perform_full_sync().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", format_outcome(&outcome));
    }
    Ok(())
}

pub async fn run_retry(context: &Context) -> Result<(), CliError> {
    let reset = retry_failed_changes(context).await?;
    if reset == 0 {
        println!("No changes are waiting for a retry.");
    } else {
        println!("{reset} change(s) will be retried on the next sync.");
    }
    Ok(())
}

pub async fn retry_failed_changes(context: &Context) -> Result<usize, CliError> {
    let store = context.open_store()?;
    Ok(store
        .reset_exhausted(context.settings.retry_policy().max_attempts)
        .await?)
}

/// Keep the process alive, syncing on reconnect and on the background
/// interval, and print events until Ctrl-C.
pub async fn run_watch(context: &Context) -> Result<(), CliError> {
    let runtime = context.open_runtime()?;
    let mut events = runtime.subscribe();

    runtime.probe_once().await;
    let _reconnect = runtime.install_reconnect_trigger()?;
    let probe = runtime.spawn_probe();
    let background = runtime.restore_background_sync().await?;
    println!(
        "Watching {} (background sync: {}). Press Ctrl-C to stop.",
        context.db_path.display(),
        background.as_str()
    );

    if let SyncOutcome::Skipped { reason } = runtime.perform_full_sync().await? {
        println!("Initial sync skipped: {}", reason.as_str());
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = format_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {skipped} sync events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    probe.abort();
    println!("Stopped.");
    Ok(())
}
