//! Conflict record repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{ChangeOperation, Conflict, ConflictResolution, Payload, PendingChange};

const SELECT_COLUMNS: &str = "SELECT id, pending_change_id, table_name, record_id, operation,
        local_payload, remote_payload, remote_version, detected_at, resolution, resolved_at,
        strategy
     FROM conflicts";

/// `SQLite` access to `conflicts`
pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conflict> {
        fn convert<T, E: std::fmt::Display>(
            index: usize,
            value: std::result::Result<T, E>,
        ) -> rusqlite::Result<T> {
            value.map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Text,
                    error.to_string().into(),
                )
            })
        }

        let operation: String = row.get(4)?;
        let local_payload: String = row.get(5)?;
        let remote_payload: Option<String> = row.get(6)?;
        let resolution: String = row.get(9)?;

        Ok(Conflict {
            id: row.get(0)?,
            pending_change_id: row.get(1)?,
            table_name: row.get(2)?,
            record_id: row.get(3)?,
            operation: convert(4, operation.parse::<ChangeOperation>())?,
            local_payload: convert(5, serde_json::from_str::<Payload>(&local_payload))?,
            remote_payload: remote_payload
                .map(|raw| convert(6, serde_json::from_str::<Payload>(&raw)))
                .transpose()?,
            remote_version: row.get(7)?,
            detected_at: row.get(8)?,
            resolution: convert(9, resolution.parse::<ConflictResolution>())?,
            resolved_at: row.get(10)?,
            strategy: row.get(11)?,
        })
    }

    /// Persist a newly detected conflict for a queued change.
    pub fn insert(
        &self,
        change: &PendingChange,
        remote_payload: Option<&Payload>,
        remote_version: Option<i64>,
        detected_at: i64,
    ) -> Result<Conflict> {
        let remote_payload = remote_payload.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO conflicts
                (pending_change_id, table_name, record_id, operation, local_payload,
                 remote_payload, remote_version, detected_at, resolution)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'unresolved')",
            params![
                change.id,
                change.table_name,
                change.record_id,
                change.operation.as_str(),
                serde_json::to_string(&change.payload)?,
                remote_payload,
                remote_version,
                detected_at,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| Error::Database(format!("conflict {id} vanished after insert")))
    }

    /// Fetch a conflict by id.
    pub fn get(&self, id: i64) -> Result<Option<Conflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?"),
                params![id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Unresolved conflict attached to a queued change, if any.
    pub fn find_unresolved_for_change(&self, pending_change_id: i64) -> Result<Option<Conflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!(
                    "{SELECT_COLUMNS} WHERE pending_change_id = ? AND resolution = 'unresolved'
                     ORDER BY id DESC LIMIT 1"
                ),
                params![pending_change_id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Replace the remote snapshot of the unresolved conflict blocking a
    /// queued change, when `remote_version` is newer than the stored one.
    ///
    /// Returns whether a conflict was updated.
    pub fn refresh_remote(
        &self,
        pending_change_id: i64,
        remote_payload: &Payload,
        remote_version: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE conflicts SET remote_payload = ?, remote_version = ?
             WHERE pending_change_id = ? AND resolution = 'unresolved'
                AND (remote_version IS NULL OR remote_version < ?)",
            params![
                serde_json::to_string(remote_payload)?,
                remote_version,
                pending_change_id,
                remote_version
            ],
        )?;
        Ok(rows > 0)
    }

    /// Ids of queued changes blocked by an unresolved conflict.
    pub fn blocked_change_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT pending_change_id FROM conflicts WHERE resolution = 'unresolved'",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// List conflicts newest first.
    pub fn list(&self, unresolved_only: bool, limit: usize) -> Result<Vec<Conflict>> {
        let filter = if unresolved_only {
            "WHERE resolution = 'unresolved'"
        } else {
            ""
        };
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} {filter} ORDER BY detected_at DESC, id DESC LIMIT ?"
        ))?;
        let conflicts = stmt
            .query_map(params![limit as i64], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    /// Close a conflict with its outcome.
    pub fn mark_resolved(
        &self,
        id: i64,
        resolution: ConflictResolution,
        resolved_at: i64,
        strategy: &str,
    ) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE conflicts SET resolution = ?, resolved_at = ?, strategy = ?
             WHERE id = ? AND resolution = 'unresolved'",
            params![resolution.as_str(), resolved_at, strategy, id],
        )?;
        if rows == 0 {
            return Err(Error::InvalidInput(format!(
                "conflict {id} is missing or already resolved"
            )));
        }
        Ok(())
    }

    /// Number of conflicts awaiting a decision.
    pub fn count_unresolved(&self) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE resolution = 'unresolved'",
            [],
            |row| row.get::<_, usize>(0),
        )?;
        Ok(count)
    }
}
