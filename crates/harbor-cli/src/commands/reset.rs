use crate::commands::common::Context;
use crate::error::CliError;

pub async fn run_reset(confirmed: bool, context: &Context) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ConfirmationRequired);
    }

    let store = context.open_store()?;
    let pending = store.pending_count().await?;
    store.purge_all().await?;
    if pending > 0 {
        tracing::warn!("Discarded {pending} unsynced change(s)");
    }
    println!("Local data erased: {}", context.db_path.display());
    Ok(())
}
