use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Offline-first sync for the fleet admin data")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the JSON settings file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read and change mirrored records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Run one sync pass
    Sync {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued local changes
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Make changes that stopped retrying eligible again
    Retry,
    /// Export diagnostics for support
    Diagnostics {
        /// Output format
        #[arg(long, value_enum, default_value_t = DiagnosticsFormat::Text)]
        format: DiagnosticsFormat,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Configure periodic background sync
    Background {
        #[command(subcommand)]
        command: BackgroundCommands,
    },
    /// Keep syncing until interrupted (probe, reconnect and background passes)
    Watch,
    /// Erase all local data and sync state
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Create a record
    Add {
        /// Table name
        table: String,
        /// Field assignments (NAME=VALUE, VALUE parsed as JSON when possible)
        #[arg(short, long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
        /// Full JSON object; --field values are applied on top
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Change fields of a record
    Update {
        /// Table name
        table: String,
        /// Record ID
        id: String,
        /// Field assignments (NAME=VALUE)
        #[arg(short, long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
        /// JSON object patch
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Delete a record
    Delete {
        /// Table name
        table: String,
        /// Record ID
        id: String,
    },
    /// Show one record
    Get {
        /// Table name
        table: String,
        /// Record ID
        id: String,
    },
    /// List records, most recently modified first
    List {
        /// Table name
        table: String,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only records in this sync state
        #[arg(long, value_enum)]
        status: Option<RecordStatus>,
        /// Equality filters (NAME=VALUE)
        #[arg(short = 'w', long = "where", value_name = "NAME=VALUE")]
        filters: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts, newest first
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        id: i64,
        /// Which side to keep
        #[arg(long = "use", value_enum)]
        choice: ResolutionChoice,
        /// Merged JSON object (with --use merged)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum BackgroundCommands {
    /// Enable background sync
    On,
    /// Disable background sync
    Off,
    /// Show whether background sync is enabled
    Status,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RecordStatus {
    Synced,
    Pending,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionChoice {
    Local,
    Remote,
    Merged,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum DiagnosticsFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
