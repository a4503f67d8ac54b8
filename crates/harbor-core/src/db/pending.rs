//! Pending change queue repository

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{ChangeOperation, NewPendingChange, Payload, PendingChange};

const SELECT_COLUMNS: &str = "SELECT id, table_name, record_id, operation, payload, created_at,
        retry_count, last_error, base_version, last_attempt_at, sent_at
     FROM pending_changes";

/// `SQLite` access to the `pending_changes` queue
pub struct PendingChangeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> PendingChangeRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingChange> {
        let operation: String = row.get(3)?;
        let operation = operation.parse::<ChangeOperation>().map_err(|error: Error| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                error.to_string().into(),
            )
        })?;
        let payload: String = row.get(4)?;
        let payload = serde_json::from_str::<Payload>(&payload).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, error.into())
        })?;

        Ok(PendingChange {
            id: row.get(0)?,
            table_name: row.get(1)?,
            record_id: row.get(2)?,
            operation,
            payload,
            created_at: row.get(5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
            base_version: row.get(8)?,
            last_attempt_at: row.get(9)?,
            sent_at: row.get(10)?,
        })
    }

    /// Enqueue a new change and return the stored row.
    pub fn insert(&self, change: &NewPendingChange<'_>) -> Result<PendingChange> {
        self.conn.execute(
            "INSERT INTO pending_changes
                (table_name, record_id, operation, payload, created_at, retry_count, base_version)
             VALUES (?, ?, ?, ?, ?, 0, ?)",
            params![
                change.table_name,
                change.record_id,
                change.operation.as_str(),
                serde_json::to_string(change.payload)?,
                change.created_at,
                change.base_version,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| Error::Database(format!("pending change {id} vanished after insert")))
    }

    /// Fetch a queue row by id.
    pub fn get(&self, id: i64) -> Result<Option<PendingChange>> {
        let change = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?"),
                params![id],
                Self::parse_change,
            )
            .optional()?;
        Ok(change)
    }

    /// Fetch the queued change for a record, if any.
    pub fn find_for_record(&self, table: &str, record_id: &str) -> Result<Option<PendingChange>> {
        let change = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE table_name = ? AND record_id = ?"),
                params![table, record_id],
                Self::parse_change,
            )
            .optional()?;
        Ok(change)
    }

    /// Queue timestamp that sorts after every queued change.
    ///
    /// Equals `now` unless a queued change already sits at or beyond it.
    pub fn tail_position(&self, now: i64) -> Result<i64> {
        let newest: Option<i64> =
            self.conn
                .query_row("SELECT MAX(created_at) FROM pending_changes", [], |row| {
                    row.get(0)
                })?;
        Ok(newest.map_or(now, |newest| now.max(newest.saturating_add(1))))
    }

    /// All queued changes in upload (FIFO) order.
    pub fn list_fifo(&self) -> Result<Vec<PendingChange>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC"))?;
        let changes = stmt
            .query_map([], Self::parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    /// Replace operation and payload of a coalesced change.
    ///
    /// `created_at` moves the change in the queue when supplied; the retry
    /// state is reset since the payload is new.
    pub fn coalesce(
        &self,
        id: i64,
        operation: ChangeOperation,
        payload: &Payload,
        created_at: Option<i64>,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE pending_changes
             SET operation = ?, payload = ?, created_at = COALESCE(?, created_at),
                 retry_count = 0, last_error = NULL, last_attempt_at = NULL
             WHERE id = ?",
            params![
                operation.as_str(),
                serde_json::to_string(payload)?,
                created_at,
                id
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("pending change {id}")));
        }
        Ok(())
    }

    /// Rebase a change that was edited while an earlier version was in flight.
    pub fn rebase(
        &self,
        id: i64,
        operation: ChangeOperation,
        base_version: Option<i64>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_changes
             SET operation = ?, base_version = ?, retry_count = 0, last_error = NULL
             WHERE id = ?",
            params![operation.as_str(), base_version, id],
        )?;
        Ok(())
    }

    /// Remember that a change is about to be sent; keeps the first send time.
    pub fn mark_sent(&self, id: i64, sent_at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_changes SET sent_at = COALESCE(sent_at, ?) WHERE id = ?",
            params![sent_at, id],
        )?;
        Ok(())
    }

    /// Remove a queue row, returning whether it existed.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM pending_changes WHERE id = ?", params![id])?;
        Ok(rows > 0)
    }

    /// Record a failed upload attempt.
    pub fn record_failure(
        &self,
        id: i64,
        retry_count: u32,
        message: &str,
        attempted_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_changes
             SET retry_count = ?, last_error = ?, last_attempt_at = ?
             WHERE id = ?",
            params![retry_count, message, attempted_at, id],
        )?;
        Ok(())
    }

    /// Reset retry state on changes at or above the retry threshold.
    ///
    /// Returns the reset rows so callers can flip their records back to pending.
    pub fn reset_exhausted(&self, threshold: u32) -> Result<Vec<PendingChange>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE retry_count >= ? ORDER BY created_at ASC, id ASC"
        ))?;
        let exhausted = stmt
            .query_map(params![threshold], Self::parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        self.conn.execute(
            "UPDATE pending_changes
             SET retry_count = 0, last_error = NULL, last_attempt_at = NULL
             WHERE retry_count >= ?",
            params![threshold],
        )?;
        Ok(exhausted)
    }

    /// Total number of queued changes.
    pub fn count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_changes", [], |row| {
                row.get::<_, usize>(0)
            })?;
        Ok(count)
    }

    /// Number of changes that stopped auto-retrying.
    pub fn count_exhausted(&self, threshold: u32) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_changes WHERE retry_count >= ?",
            params![threshold],
            |row| row.get::<_, usize>(0),
        )?;
        Ok(count)
    }
}
