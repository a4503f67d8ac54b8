//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|value| value != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: settings, change queue and download cursors
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            base_version INTEGER,
            last_attempt_at INTEGER,
            UNIQUE (table_name, record_id)
        );
        CREATE INDEX IF NOT EXISTS idx_pending_changes_fifo ON pending_changes(created_at, id);
        CREATE TABLE IF NOT EXISTS sync_cursors (
            table_name TEXT PRIMARY KEY,
            last_synced_at INTEGER NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict records
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pending_change_id INTEGER NOT NULL,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            local_payload TEXT NOT NULL,
            remote_payload TEXT,
            remote_version INTEGER,
            detected_at INTEGER NOT NULL,
            resolution TEXT NOT NULL DEFAULT 'unresolved',
            resolved_at INTEGER,
            strategy TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_pending_change ON conflicts(pending_change_id);
        CREATE INDEX IF NOT EXISTS idx_conflicts_resolution ON conflicts(resolution);
        CREATE INDEX IF NOT EXISTS idx_conflicts_detected_at ON conflicts(detected_at DESC);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: keyset download cursors, microsecond versions and
/// upload tracking
///
/// Cursors are dropped so the next pass re-downloads every table with
/// microsecond versions.
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "ALTER TABLE sync_cursors ADD COLUMN last_synced_id TEXT;
        DELETE FROM sync_cursors;
        ALTER TABLE pending_changes ADD COLUMN sent_at INTEGER;
        UPDATE pending_changes SET base_version = base_version * 1000
            WHERE base_version IS NOT NULL;
        UPDATE conflicts SET remote_version = remote_version * 1000
            WHERE remote_version IS NOT NULL;
        INSERT INTO schema_version (version) VALUES (3);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
