//! Database layer for Harbor

mod conflicts;
mod connection;
mod cursors;
mod migrations;
mod pending;
mod repository;
mod settings_repository;

pub use conflicts::ConflictRepository;
pub use connection::Database;
pub use cursors::CursorRepository;
pub use pending::PendingChangeRepository;
pub use repository::{RecordQuery, RecordRepository, SqliteRecordRepository};
pub use settings_repository::{SettingsRepository, SqliteSettingsRepository};
