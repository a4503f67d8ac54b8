use std::path::Path;

use harbor_core::diagnostics::{self as core_diagnostics, Diagnostics};

use crate::cli::DiagnosticsFormat;
use crate::commands::common::{configured_background_state, Context};
use crate::error::CliError;

pub async fn run_diagnostics(
    format: DiagnosticsFormat,
    output_path: Option<&Path>,
    context: &Context,
) -> Result<(), CliError> {
    let diagnostics = collect_diagnostics(context).await?;
    let rendered = core_diagnostics::render_diagnostics(&diagnostics, format.into())?;

    if let Some(path) = output_path {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, rendered)?;
        println!("{}", path.display());
    } else {
        print!("{rendered}");
        if !rendered.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

pub async fn collect_diagnostics(context: &Context) -> Result<Diagnostics, CliError> {
    if context.settings.has_remote() {
        let runtime = context.open_runtime()?;
        runtime.probe_once().await;
        runtime.restore_background_sync().await?;
        return Ok(runtime.export_diagnostics().await?);
    }

    let store = context.open_store()?;
    let background = configured_background_state(store.settings().await?.background_sync_enabled);
    Ok(context.local_diagnostics(&store).collect(background).await?)
}

impl From<DiagnosticsFormat> for core_diagnostics::DiagnosticsFormat {
    fn from(format: DiagnosticsFormat) -> Self {
        match format {
            DiagnosticsFormat::Json => Self::Json,
            DiagnosticsFormat::Text => Self::Text,
        }
    }
}
