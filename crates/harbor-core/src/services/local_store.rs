//! Shared local store wrapper used by the sync engine and clients.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rusqlite::{Connection, Transaction};
use tokio::sync::Mutex;

use crate::db::{
    ConflictRepository, CursorRepository, Database, PendingChangeRepository, RecordQuery,
    RecordRepository, SettingsRepository, SqliteRecordRepository, SqliteSettingsRepository,
};
use crate::models::{
    validate_table_name, Conflict, EntityRecord, PendingChange, Settings, SyncCursor, SyncStatus,
};
use crate::state::Health;
use crate::sync::RemotePosition;
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Thread-safe handle on the local mirror database.
///
/// Every access goes through one async mutex; multi-step writes run inside a
/// single `SQLite` transaction. A corrupt database file is quarantined and
/// replaced by a fresh one, after which [`LocalStore::health`] reports
/// [`Health::Critical`] until acknowledged.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    tables: Arc<[String]>,
    health: Arc<AtomicU8>,
}

impl LocalStore {
    /// Open a store at the given filesystem path, creating the tracked tables.
    pub fn open_path(db_path: impl Into<PathBuf>, tables: &[String]) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut health = Health::Healthy;
        let db = match Self::open_database(Some(&db_path), tables) {
            Ok(db) => db,
            Err(error) if error.is_storage_corruption() => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Reinitializing.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                health = Health::Critical;
                Self::open_database(Some(&db_path), tables)?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            tables: tables.into(),
            health: Arc::new(AtomicU8::new(health.to_u8())),
        })
    }

    /// Open an in-memory store (tests and demos).
    pub fn open_in_memory(tables: &[String]) -> Result<Self> {
        let db = Self::open_database(None, tables)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            tables: tables.into(),
            health: Arc::new(AtomicU8::new(Health::Healthy.to_u8())),
        })
    }

    fn open_database(db_path: Option<&Path>, tables: &[String]) -> Result<Database> {
        for table in tables {
            validate_table_name(table)?;
        }

        let db = match db_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        for table in tables {
            db.ensure_entity_table(table)?;
        }
        Ok(db)
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = unix_millis_now();
            let base_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("harbor.db");
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale local DB file {}", path.display());
            }
        }

        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        let mut db = self.db.lock().await;
        // Release the file handle before moving the file out of the way.
        let placeholder = Database::open_in_memory()?;
        drop(std::mem::replace(&mut *db, placeholder));

        if let Some(db_path) = self.db_path.as_deref() {
            Self::quarantine_corrupted_db_files(db_path)?;
        }
        *db = Self::open_database(self.db_path.as_deref(), &self.tables)?;
        self.health.store(Health::Critical.to_u8(), Ordering::SeqCst);

        tracing::info!("Local database reinitialized; unsynced changes were discarded");
        Ok(())
    }

    async fn guard<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(error) if error.is_storage_corruption() => {
                tracing::warn!("Local database corruption detected: {error}");
                self.reinitialize().await?;
                Err(Error::Storage(format!(
                    "local database was corrupt and has been reinitialized: {error}"
                )))
            }
            other => other,
        }
    }

    /// Run a read against the connection.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let result = {
            let db = self.db.lock().await;
            f(db.connection())
        };
        self.guard(result).await
    }

    /// Run `f` inside one transaction, committing only when it succeeds.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send,
        T: Send,
    {
        let result = {
            let mut db = self.db.lock().await;
            Self::in_transaction(db.connection_mut(), f)
        };
        self.guard(result).await
    }

    fn in_transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Tracked entity tables, in configuration order.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Whether a table is tracked by this store.
    pub fn is_tracked(&self, table: &str) -> bool {
        self.tables.iter().any(|tracked| tracked == table)
    }

    pub(crate) fn require_tracked(&self, table: &str) -> Result<()> {
        if self.is_tracked(table) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("table '{table}' is not tracked")))
        }
    }

    /// Filesystem location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Fetch a record by id.
    pub async fn find_by_id(&self, table: &str, id: &str) -> Result<Option<EntityRecord>> {
        self.require_tracked(table)?;
        self.read(|conn| SqliteRecordRepository::new(conn).find_by_id(table, id))
            .await
    }

    /// List records matching a filter, most recently modified first.
    pub async fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<EntityRecord>> {
        self.require_tracked(table)?;
        self.read(|conn| SqliteRecordRepository::new(conn).query(table, query))
            .await
    }

    /// Queued changes in upload order.
    pub async fn pending_changes(&self) -> Result<Vec<PendingChange>> {
        self.read(|conn| PendingChangeRepository::new(conn).list_fifo())
            .await
    }

    /// Number of queued changes.
    pub async fn pending_count(&self) -> Result<usize> {
        self.read(|conn| PendingChangeRepository::new(conn).count())
            .await
    }

    /// Number of queued changes that stopped auto-retrying.
    pub async fn exhausted_count(&self, threshold: u32) -> Result<usize> {
        self.read(|conn| PendingChangeRepository::new(conn).count_exhausted(threshold))
            .await
    }

    /// Drop a queued change, returning whether it existed.
    pub async fn clear_pending_change(&self, id: i64) -> Result<bool> {
        self.write(|tx| PendingChangeRepository::new(tx).delete(id))
            .await
    }

    /// Remember that a change is being sent to the backend.
    pub async fn mark_sent(&self, id: i64) -> Result<()> {
        self.write(|tx| PendingChangeRepository::new(tx).mark_sent(id, unix_millis_now()))
            .await
    }

    /// Store a transient upload failure; the record stays pending.
    pub async fn record_failure(&self, id: i64, retry_count: u32, message: &str) -> Result<()> {
        self.write(|tx| {
            PendingChangeRepository::new(tx).record_failure(
                id,
                retry_count,
                message,
                unix_millis_now(),
            )
        })
        .await
    }

    /// Stop auto-retrying a change and flag its record as needing attention.
    pub async fn mark_error(&self, id: i64, message: &str, retry_count: u32) -> Result<()> {
        self.write(|tx| {
            let pending = PendingChangeRepository::new(tx);
            let change = pending
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("pending change {id}")))?;
            pending.record_failure(id, retry_count, message, unix_millis_now())?;
            SqliteRecordRepository::new(tx).set_status(
                &change.table_name,
                &change.record_id,
                SyncStatus::Error,
            )
        })
        .await
    }

    /// Make exhausted changes eligible for upload again.
    ///
    /// Returns how many changes were reset.
    pub async fn reset_exhausted(&self, threshold: u32) -> Result<usize> {
        self.write(|tx| {
            let reset = PendingChangeRepository::new(tx).reset_exhausted(threshold)?;
            let records = SqliteRecordRepository::new(tx);
            for change in &reset {
                records.set_status(&change.table_name, &change.record_id, SyncStatus::Pending)?;
            }
            Ok(reset.len())
        })
        .await
    }

    /// Download position for a table.
    pub async fn cursor(&self, table: &str) -> Result<Option<RemotePosition>> {
        self.read(|conn| CursorRepository::new(conn).get(table))
            .await
    }

    /// Advance a table's download position; returns the stored value.
    pub async fn set_cursor(
        &self,
        table: &str,
        observed: &RemotePosition,
    ) -> Result<RemotePosition> {
        self.write(|tx| CursorRepository::new(tx).advance(table, observed))
            .await
    }

    /// All download watermarks.
    pub async fn cursors(&self) -> Result<Vec<SyncCursor>> {
        self.read(|conn| CursorRepository::new(conn).list()).await
    }

    /// Fetch a conflict by id.
    pub async fn conflict(&self, id: i64) -> Result<Option<Conflict>> {
        self.read(|conn| ConflictRepository::new(conn).get(id)).await
    }

    /// Conflicts newest first.
    pub async fn conflicts(&self, unresolved_only: bool, limit: usize) -> Result<Vec<Conflict>> {
        self.read(|conn| ConflictRepository::new(conn).list(unresolved_only, limit))
            .await
    }

    /// Number of conflicts awaiting a decision.
    pub async fn unresolved_conflict_count(&self) -> Result<usize> {
        self.read(|conn| ConflictRepository::new(conn).count_unresolved())
            .await
    }

    /// Queue ids held back by an unresolved conflict.
    pub async fn blocked_change_ids(&self) -> Result<Vec<i64>> {
        self.read(|conn| ConflictRepository::new(conn).blocked_change_ids())
            .await
    }

    /// Load persisted settings.
    pub async fn settings(&self) -> Result<Settings> {
        self.read(|conn| SqliteSettingsRepository::new(conn).load())
            .await
    }

    /// Persist settings.
    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.write(|tx| SqliteSettingsRepository::new(tx).save(settings))
            .await
    }

    /// Load, modify and persist settings in one transaction.
    pub async fn update_settings<F>(&self, f: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings) + Send,
    {
        self.write(|tx| {
            let repo = SqliteSettingsRepository::new(tx);
            let mut settings = repo.load()?;
            f(&mut settings);
            repo.save(&settings)?;
            Ok(settings)
        })
        .await
    }

    /// Reclaim space and refresh planner statistics.
    pub async fn optimize(&self) -> Result<()> {
        let result = {
            let db = self.db.lock().await;
            db.optimize()
        };
        self.guard(result).await
    }

    /// Delete every mirrored row and all sync metadata.
    pub async fn purge_all(&self) -> Result<()> {
        let tables = Arc::clone(&self.tables);
        self.write(move |tx| {
            for table in tables.iter() {
                tx.execute(&format!("DELETE FROM \"{table}\""), [])?;
            }
            tx.execute_batch(
                "DELETE FROM pending_changes;
                 DELETE FROM sync_cursors;
                 DELETE FROM conflicts;
                 DELETE FROM settings;",
            )?;
            Ok(())
        })
        .await?;

        tracing::info!("Purged all local data");
        Ok(())
    }

    /// Approximate database size in bytes.
    pub async fn estimated_size_bytes(&self) -> Result<i64> {
        let db = self.db.lock().await;
        db.estimated_size_bytes()
    }

    /// Current storage health.
    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::SeqCst))
    }

    /// Clear a critical health flag after the user has been informed.
    pub fn acknowledge_health(&self) {
        self.health
            .store(Health::Healthy.to_u8(), Ordering::SeqCst);
    }
}
