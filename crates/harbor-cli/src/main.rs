//! Harbor CLI - Command-line front end for the offline-first sync engine
//!
//! Edit mirrored fleet records offline, then sync them when the backend is
//! reachable.

use clap::Parser;
use tracing_subscriber::filter::Directive;

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use crate::cli::{Cli, Commands};
use crate::commands::background::run_background;
use crate::commands::common::Context;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::run_conflicts;
use crate::commands::diagnostics::run_diagnostics;
use crate::commands::record::run_record;
use crate::commands::reset::run_reset;
use crate::commands::status::{run_pending, run_status};
use crate::commands::sync::{run_retry, run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive = "harbor=info"
        .parse::<Directive>()
        .map_err(|error| CliError::Config(format!("invalid log directive: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let context = Context::load(cli.config, cli.db_path)?;

    match cli.command {
        Commands::Record { command } => run_record(command, &context).await?,
        Commands::Sync { json } => run_sync(json, &context).await?,
        Commands::Status { json } => run_status(json, &context).await?,
        Commands::Pending { json } => run_pending(json, &context).await?,
        Commands::Conflicts { command } => run_conflicts(command, &context).await?,
        Commands::Retry => run_retry(&context).await?,
        Commands::Diagnostics { format, output } => {
            run_diagnostics(format, output.as_deref(), &context).await?;
        }
        Commands::Background { command } => run_background(command, &context).await?,
        Commands::Watch => run_watch(&context).await?,
        Commands::Reset { yes } => run_reset(yes, &context).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
