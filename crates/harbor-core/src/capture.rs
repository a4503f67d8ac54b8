//! Change capture: local mutations and their queued uploads
//!
//! Every local write goes through [`ChangeCapture`], which applies it to the
//! mirror and records the matching pending change in the same transaction.
//! Rows arriving from the remote side go through [`ChangeCapture::apply_remote`]
//! and never enqueue anything.

use rusqlite::Connection;
use serde_json::Value;

use crate::db::{
    ConflictRepository, CursorRepository, PendingChangeRepository, RecordRepository,
    SqliteRecordRepository,
};
use crate::models::{
    merge_payload, value_as_id, ChangeOperation, EntityRecord, NewPendingChange, Payload,
    PendingChange, SyncStatus,
};
use crate::services::LocalStore;
use crate::sync::{RemotePosition, RemoteRow};
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// What happened to the queue when a mutation was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEffect {
    /// A new pending change was appended
    Enqueued,
    /// An existing pending change absorbed the mutation
    Coalesced,
    /// An insert that never reached the backend was deleted; nothing is
    /// left to upload
    Cancelled,
}

/// Summary of one downloaded page applied to the mirror
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteApply {
    /// Rows written to the mirror
    pub upserted: usize,
    /// Local rows removed by tombstones
    pub deleted: usize,
    /// Rows left alone because a local change is queued
    pub skipped: usize,
    /// Cursor after the page, if any row was observed
    pub cursor: Option<RemotePosition>,
}

/// Outcome of acknowledging an uploaded change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The change was removed and its record is synced
    Cleared,
    /// The record was edited while the upload was in flight; the newer edit
    /// stays queued against the acknowledged version
    Rebased,
    /// The change no longer existed
    Missing,
}

/// Entry point for local mutations
#[derive(Clone)]
pub struct ChangeCapture {
    store: LocalStore,
}

impl ChangeCapture {
    pub const fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Create a record; assigns a UUID v7 unless `fields` carries an `id`.
    pub async fn insert(&self, table: &str, fields: Payload) -> Result<EntityRecord> {
        self.store.require_tracked(table)?;
        let now = unix_millis_now();
        let record = EntityRecord::new_local(table, fields, now);

        self.store
            .write(|tx| {
                let records = SqliteRecordRepository::new(tx);
                if records.find_by_id(table, &record.id)?.is_some() {
                    return Err(Error::InvalidInput(format!(
                        "record {table}/{} already exists",
                        record.id
                    )));
                }

                let queued = PendingChangeRepository::new(tx).find_for_record(table, &record.id)?;
                let mut stored = record.clone();
                // Re-creating a record deleted before sync keeps its remote base.
                stored.remote_updated_at = queued.as_ref().and_then(|change| change.base_version);
                records.insert(&stored)?;

                enqueue(tx, &stored, ChangeOperation::Insert, now)?;
                Ok(stored)
            })
            .await
    }

    /// Merge `patch` into an existing record's fields.
    pub async fn update(&self, table: &str, id: &str, mut patch: Payload) -> Result<EntityRecord> {
        self.store.require_tracked(table)?;
        let now = unix_millis_now();

        if let Some(new_id) = patch.get("id") {
            if value_as_id(new_id).as_deref() != Some(id) {
                return Err(Error::InvalidInput("record id cannot be changed".to_string()));
            }
        }
        patch.remove("id");

        self.store
            .write(|tx| {
                let records = SqliteRecordRepository::new(tx);
                let mut record = records
                    .find_by_id(table, id)?
                    .ok_or_else(|| Error::NotFound(format!("{table}/{id}")))?;

                record.fields = merge_payload(&record.fields, &patch);
                record.sync_status = SyncStatus::Pending;
                record.last_modified = now;
                records.update(&record)?;

                enqueue(tx, &record, ChangeOperation::Update, now)?;
                Ok(record)
            })
            .await
    }

    /// Delete a record. Returns `false` when it did not exist.
    pub async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        self.store.require_tracked(table)?;
        let now = unix_millis_now();

        self.store
            .write(|tx| {
                let records = SqliteRecordRepository::new(tx);
                let Some(record) = records.find_by_id(table, id)? else {
                    return Ok(false);
                };
                records.delete(table, id)?;

                enqueue(tx, &record, ChangeOperation::Delete, now)?;
                Ok(true)
            })
            .await
    }

    /// Apply one downloaded page and advance the table's cursor.
    ///
    /// Rows with a queued local change are skipped; the upload phase (or the
    /// conflict resolver) reconciles them. A skipped row replaces the remote
    /// side of an unresolved conflict on that change, so a later resolution
    /// sees the newest remote state.
    pub async fn apply_remote(&self, table: &str, rows: &[RemoteRow]) -> Result<RemoteApply> {
        self.store.require_tracked(table)?;
        let now = unix_millis_now();

        self.store
            .write(|tx| {
                let records = SqliteRecordRepository::new(tx);
                let pending = PendingChangeRepository::new(tx);
                let conflicts = ConflictRepository::new(tx);
                let mut outcome = RemoteApply::default();

                for row in rows {
                    if let Some(queued) = pending.find_for_record(table, &row.id)? {
                        tracing::debug!("Skipping {table}/{}: local change queued", row.id);
                        if conflicts.refresh_remote(queued.id, &row.fields, row.updated_at)? {
                            tracing::debug!(
                                "Conflict on {table}/{} now compares against version {}",
                                row.id,
                                row.updated_at
                            );
                        }
                        outcome.skipped += 1;
                    } else if row.is_tombstone() {
                        if records.delete(table, &row.id)? {
                            outcome.deleted += 1;
                        }
                    } else {
                        records.upsert(&synced_record(table, row, now))?;
                        outcome.upserted += 1;
                    }
                }

                if let Some(last) = rows.iter().map(RemoteRow::position).max() {
                    outcome.cursor = Some(CursorRepository::new(tx).advance(table, &last)?);
                }
                Ok(outcome)
            })
            .await
    }

    /// Settle a change the backend accepted.
    ///
    /// `ack` is the committed row for inserts and updates, `None` for deletes.
    pub async fn acknowledge(
        &self,
        change: &PendingChange,
        ack: Option<&RemoteRow>,
    ) -> Result<Acknowledgement> {
        let now = unix_millis_now();

        self.store
            .write(|tx| {
                let pending = PendingChangeRepository::new(tx);
                let records = SqliteRecordRepository::new(tx);
                let Some(current) = pending.get(change.id)? else {
                    return Ok(Acknowledgement::Missing);
                };

                let unchanged =
                    current.operation == change.operation && current.payload == change.payload;
                if unchanged {
                    pending.delete(current.id)?;
                    if let Some(row) = ack {
                        records.upsert(&synced_record(&change.table_name, row, now))?;
                    }
                    return Ok(Acknowledgement::Cleared);
                }

                // Edited in flight: keep the newer edit, based on what the remote now holds.
                let (operation, base_version) = match (change.operation, ack) {
                    (ChangeOperation::Delete, _) => match current.operation {
                        ChangeOperation::Delete => (ChangeOperation::Delete, None),
                        _ => (ChangeOperation::Insert, None),
                    },
                    (_, Some(row)) => match current.operation {
                        ChangeOperation::Insert => (ChangeOperation::Update, Some(row.updated_at)),
                        other => (other, Some(row.updated_at)),
                    },
                    (_, None) => (current.operation, current.base_version),
                };
                pending.rebase(current.id, operation, base_version)?;

                if let Some(mut record) = records.find_by_id(&change.table_name, &change.record_id)? {
                    record.remote_updated_at = base_version;
                    records.update(&record)?;
                }
                Ok(Acknowledgement::Rebased)
            })
            .await
    }
}

/// Mirror row for an acknowledged or downloaded remote row.
pub(crate) fn synced_record(table: &str, row: &RemoteRow, now: i64) -> EntityRecord {
    let mut fields = row.fields.clone();
    fields.insert("id".to_string(), Value::String(row.id.clone()));
    EntityRecord {
        id: row.id.clone(),
        table: table.to_string(),
        fields,
        remote_updated_at: Some(row.updated_at),
        sync_status: SyncStatus::Synced,
        last_modified: now,
    }
}

/// Record `operation` on `record` in the queue, coalescing with a queued change.
fn enqueue(
    conn: &Connection,
    record: &EntityRecord,
    operation: ChangeOperation,
    now: i64,
) -> Result<QueueEffect> {
    let pending = PendingChangeRepository::new(conn);
    let Some(queued) = pending.find_for_record(&record.table, &record.id)? else {
        let created_at = pending.tail_position(now)?;
        pending.insert(&NewPendingChange {
            table_name: &record.table,
            record_id: &record.id,
            operation,
            payload: &record.fields,
            created_at,
            base_version: record.remote_updated_at,
        })?;
        return Ok(QueueEffect::Enqueued);
    };

    let (merged, moves_to_tail) = match (queued.operation, operation) {
        (ChangeOperation::Insert, ChangeOperation::Update) => (ChangeOperation::Insert, false),
        // The insert may have landed remotely; delete whatever is there.
        (ChangeOperation::Insert, ChangeOperation::Delete) if queued.sent_at.is_some() => {
            pending.coalesce(queued.id, ChangeOperation::Delete, &record.fields, None)?;
            pending.rebase(queued.id, ChangeOperation::Delete, None)?;
            tracing::debug!(
                "Delete of {}/{} replaces an insert already sent",
                record.table,
                record.id
            );
            return Ok(QueueEffect::Coalesced);
        }
        (ChangeOperation::Insert, ChangeOperation::Delete) => {
            pending.delete(queued.id)?;
            tracing::debug!(
                "Insert of {}/{} cancelled by delete before sync",
                record.table,
                record.id
            );
            return Ok(QueueEffect::Cancelled);
        }
        (ChangeOperation::Update, ChangeOperation::Update) => (ChangeOperation::Update, true),
        (ChangeOperation::Update, ChangeOperation::Delete) => (ChangeOperation::Delete, true),
        (ChangeOperation::Delete, ChangeOperation::Insert) => (ChangeOperation::Update, true),
        (queued_op, op) => {
            return Err(Error::InvalidInput(format!(
                "cannot {op} {}/{} with a queued {queued_op}",
                record.table, record.id
            )));
        }
    };

    let created_at = if moves_to_tail {
        Some(pending.tail_position(now)?)
    } else {
        None
    };
    pending.coalesce(queued.id, merged, &record.fields, created_at)?;
    Ok(QueueEffect::Coalesced)
}
