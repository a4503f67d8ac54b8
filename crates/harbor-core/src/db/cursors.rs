//! Download cursor repository

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::SyncCursor;
use crate::sync::RemotePosition;

/// `SQLite` access to `sync_cursors`
pub struct CursorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> CursorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Position of the last downloaded row, `None` before the first download.
    ///
    /// A cursor stored without an id resumes at the first id of its version.
    pub fn get(&self, table: &str) -> Result<Option<RemotePosition>> {
        let position = self
            .conn
            .query_row(
                "SELECT last_synced_at, last_synced_id FROM sync_cursors WHERE table_name = ?",
                params![table],
                |row| {
                    Ok(RemotePosition {
                        updated_at: row.get(0)?,
                        id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(position)
    }

    /// Move a table's cursor forward in (`updated_at`, `id`) order; never
    /// moves it backwards.
    ///
    /// Returns the stored position after the call.
    pub fn advance(&self, table: &str, observed: &RemotePosition) -> Result<RemotePosition> {
        self.conn.execute(
            "INSERT INTO sync_cursors (table_name, last_synced_at, last_synced_id) VALUES (?, ?, ?)
             ON CONFLICT(table_name) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                last_synced_id = excluded.last_synced_id
             WHERE excluded.last_synced_at > sync_cursors.last_synced_at
                OR (excluded.last_synced_at = sync_cursors.last_synced_at
                    AND excluded.last_synced_id > COALESCE(sync_cursors.last_synced_id, ''))",
            params![table, observed.updated_at, observed.id],
        )?;
        Ok(self.get(table)?.unwrap_or_else(|| observed.clone()))
    }

    /// All stored cursors.
    pub fn list(&self) -> Result<Vec<SyncCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name, last_synced_at, last_synced_id FROM sync_cursors
             ORDER BY table_name ASC",
        )?;
        let cursors = stmt
            .query_map([], |row| {
                Ok(SyncCursor {
                    table_name: row.get(0)?,
                    last_synced_at: row.get(1)?,
                    last_synced_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cursors)
    }
}
