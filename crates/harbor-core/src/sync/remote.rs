//! Remote backend abstraction

use async_trait::async_trait;
use serde_json::Value;

use super::error::{RemoteResult, SyncError};
use crate::models::{value_as_id, Payload};

/// One row as returned by the remote backend
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    /// Row id
    pub id: String,
    /// Full field set, including `id` and `updated_at`
    pub fields: Payload,
    /// Remote `updated_at` in Unix microseconds
    pub updated_at: i64,
}

impl RemoteRow {
    /// Build a row from a backend JSON object.
    ///
    /// The object must carry an `id` and a parseable `updated_at`.
    pub fn from_payload(fields: Payload) -> RemoteResult<Self> {
        let id = fields
            .get("id")
            .and_then(value_as_id)
            .ok_or_else(|| SyncError::Validation("remote row has no id".to_string()))?;
        let updated_at = fields
            .get("updated_at")
            .and_then(parse_timestamp)
            .ok_or_else(|| {
                SyncError::Validation(format!("remote row {id} has no valid updated_at"))
            })?;

        Ok(Self {
            id,
            fields,
            updated_at,
        })
    }

    /// Whether the row is a soft-delete marker.
    pub fn is_tombstone(&self) -> bool {
        let deleted_flag = self
            .fields
            .get("is_deleted")
            .is_some_and(|value| value.as_bool() == Some(true));
        let deleted_at = self
            .fields
            .get("deleted_at")
            .is_some_and(|value| !value.is_null());
        deleted_flag || deleted_at
    }

    /// Download position at this row.
    pub fn position(&self) -> RemotePosition {
        RemotePosition {
            updated_at: self.updated_at,
            id: self.id.clone(),
        }
    }
}

/// Last row seen by a download, in (`updated_at`, `id`) order.
///
/// Field order makes the derived `Ord` the download order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePosition {
    pub updated_at: i64,
    pub id: String,
}

impl RemotePosition {
    /// Whether `row` sorts strictly after this position.
    pub fn precedes(&self, row: &RemoteRow) -> bool {
        (row.updated_at, row.id.as_str()) > (self.updated_at, self.id.as_str())
    }
}

/// Parse a remote timestamp into Unix microseconds.
///
/// Accepts RFC 3339 strings, Postgres `timestamptz` text and integers, which
/// are taken as microseconds. Digits beyond microseconds are truncated.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => {
            let text = text.trim();
            chrono::DateTime::parse_from_rfc3339(text)
                .or_else(|_| chrono::DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z"))
                .ok()
                .map(|moment| moment.timestamp_micros())
        }
        _ => None,
    }
}

/// Per-table remote operations the sync engine relies on.
///
/// Writes return the row as committed by the backend so the local mirror can
/// record the acknowledged `updated_at`.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Up to `limit` rows ordered by (`updated_at`, `id`), starting strictly
    /// after `after`; from the beginning when `after` is `None`.
    async fn fetch_since(
        &self,
        table: &str,
        after: Option<&RemotePosition>,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>>;

    /// Current state of one row.
    async fn fetch_one(&self, table: &str, id: &str) -> RemoteResult<Option<RemoteRow>>;

    /// Create a row; a duplicate id is a [`SyncError::Conflict`].
    async fn insert(&self, table: &str, payload: &Payload) -> RemoteResult<RemoteRow>;

    /// Update a row, failing with [`SyncError::Conflict`] when it no longer
    /// exists or its `updated_at` differs from `expected_version`.
    async fn update(
        &self,
        table: &str,
        id: &str,
        payload: &Payload,
        expected_version: Option<i64>,
    ) -> RemoteResult<RemoteRow>;

    /// Delete a row; deleting a missing row succeeds.
    async fn delete(&self, table: &str, id: &str, expected_version: Option<i64>)
        -> RemoteResult<()>;

    /// Cheap reachability check.
    async fn ping(&self) -> RemoteResult<()>;
}
