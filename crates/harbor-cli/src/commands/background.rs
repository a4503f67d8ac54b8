use harbor_core::scheduler::SchedulerState;

use crate::cli::BackgroundCommands;
use crate::commands::common::{configured_background_state, Context};
use crate::error::CliError;

pub async fn run_background(command: BackgroundCommands, context: &Context) -> Result<(), CliError> {
    let state = match command {
        BackgroundCommands::On => set_background_sync(true, context).await?,
        BackgroundCommands::Off => set_background_sync(false, context).await?,
        BackgroundCommands::Status => {
            let store = context.open_store()?;
            configured_background_state(store.settings().await?.background_sync_enabled)
        }
    };

    println!("Background sync: {}", describe_state(state));
    if state != SchedulerState::Disabled {
        println!(
            "Passes run every {}s while `harbor watch` is running.",
            context.settings.background_interval().as_secs()
        );
    }
    Ok(())
}

/// Persist the flag and, with a backend configured, register the wake.
pub async fn set_background_sync(
    enabled: bool,
    context: &Context,
) -> Result<SchedulerState, CliError> {
    if context.settings.has_remote() {
        let runtime = context.open_runtime()?;
        return Ok(runtime.toggle_background_sync(enabled).await?);
    }

    let store = context.open_store()?;
    let settings = store
        .update_settings(|settings| settings.background_sync_enabled = enabled)
        .await?;
    Ok(configured_background_state(settings.background_sync_enabled))
}

const fn describe_state(state: SchedulerState) -> &'static str {
    match state {
        SchedulerState::Disabled => "off",
        SchedulerState::Active => "on",
        SchedulerState::ForegroundOnly => "on (foreground only)",
    }
}
