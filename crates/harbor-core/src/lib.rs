//! harbor-core - Core library for Harbor
//!
//! Offline-first synchronization for the fleet admin clients: a local SQLite
//! mirror of the tracked tables, a queue of local mutations, and the engine
//! that reconciles both with the remote backend.

pub mod capture;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod network;
pub mod runtime;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod status;
pub mod sync;
pub mod util;

pub use capture::ChangeCapture;
pub use config::SyncSettings;
pub use error::{Error, Result};
pub use models::{EntityRecord, Payload, PendingChange, SyncStatus};
pub use network::NetworkMonitor;
pub use runtime::SyncRuntime;
pub use services::LocalStore;
pub use state::{Health, SyncState};
pub use sync::{SyncEngine, SyncError};
