//! In-memory remote backend for tests and local demos

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::error::{RemoteResult, SyncError};
use super::remote::{RemoteBackend, RemotePosition, RemoteRow};
use crate::models::{value_as_id, Payload};
use crate::util::{format_micros_rfc3339, unix_micros_now};

/// Kind of call received by [`InMemoryBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallKind {
    FetchSince,
    FetchOne,
    Insert,
    Update,
    Delete,
    Ping,
}

/// One logged backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub kind: RemoteCallKind,
    pub table: Option<String>,
    pub record_id: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<String, RemoteRow>>,
    clock: i64,
    calls: Vec<RemoteCall>,
    unreachable: bool,
    disconnect_after_writes: Option<usize>,
    injected: VecDeque<SyncError>,
}

impl State {
    fn tick(&mut self) -> i64 {
        self.clock = unix_micros_now().max(self.clock + 1);
        self.clock
    }

    fn stamp(&mut self, id: String, mut fields: Payload) -> RemoteRow {
        let updated_at = self.tick();
        fields.insert("id".to_string(), Value::String(id.clone()));
        fields.insert(
            "updated_at".to_string(),
            Value::String(format_micros_rfc3339(updated_at)),
        );
        RemoteRow {
            id,
            fields,
            updated_at,
        }
    }

    fn admit(&mut self, kind: RemoteCallKind, table: Option<&str>, id: Option<&str>) -> RemoteResult<()> {
        self.calls.push(RemoteCall {
            kind,
            table: table.map(str::to_string),
            record_id: id.map(str::to_string),
        });
        if self.unreachable {
            return Err(SyncError::Network("backend unreachable".to_string()));
        }
        if kind != RemoteCallKind::Ping {
            if let Some(error) = self.injected.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn count_write(&mut self) {
        if let Some(remaining) = self.disconnect_after_writes.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.unreachable = true;
                self.disconnect_after_writes = None;
            }
        }
    }
}

/// Backend holding rows in process memory.
///
/// Stamps every write with a strictly increasing `updated_at`, logs every
/// call, and can simulate outages and injected failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a row directly, as another client would. Returns the stored row.
    pub fn put_row(&self, table: &str, fields: Payload) -> RemoteRow {
        let mut state = self.state();
        let id = fields
            .get("id")
            .and_then(value_as_id)
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let row = state.stamp(id, fields);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(row.id.clone(), row.clone());
        row
    }

    /// Current state of a row.
    pub fn row(&self, table: &str, id: &str) -> Option<RemoteRow> {
        self.state()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// All rows of a table ordered by id.
    pub fn rows(&self, table: &str) -> Vec<RemoteRow> {
        self.state()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Calls of one kind.
    pub fn calls_of(&self, kind: RemoteCallKind) -> Vec<RemoteCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Toggle simulated reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Become unreachable once `writes` more writes have succeeded.
    pub fn disconnect_after_writes(&self, writes: usize) {
        let mut state = self.state();
        if writes == 0 {
            state.unreachable = true;
        } else {
            state.disconnect_after_writes = Some(writes);
        }
    }

    /// Fail the next non-ping call with `error`.
    pub fn inject_failure(&self, error: SyncError) {
        self.state().injected.push_back(error);
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn fetch_since(
        &self,
        table: &str,
        after: Option<&RemotePosition>,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        let mut state = self.state();
        state.admit(RemoteCallKind::FetchSince, Some(table), None)?;

        let mut rows = state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| after.is_none_or(|after| after.precedes(row)))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows.into_iter().take(limit).collect())
    }

    async fn fetch_one(&self, table: &str, id: &str) -> RemoteResult<Option<RemoteRow>> {
        let mut state = self.state();
        state.admit(RemoteCallKind::FetchOne, Some(table), Some(id))?;
        Ok(state.tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn insert(&self, table: &str, payload: &Payload) -> RemoteResult<RemoteRow> {
        let id = payload
            .get("id")
            .and_then(value_as_id)
            .ok_or_else(|| SyncError::Validation("insert payload has no id".to_string()))?;
        let mut state = self.state();
        state.admit(RemoteCallKind::Insert, Some(table), Some(&id))?;

        if state
            .tables
            .get(table)
            .is_some_and(|rows| rows.contains_key(&id))
        {
            return Err(SyncError::Conflict(format!("{table}/{id} already exists")));
        }

        let row = state.stamp(id, payload.clone());
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(row.id.clone(), row.clone());
        state.count_write();
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        payload: &Payload,
        expected_version: Option<i64>,
    ) -> RemoteResult<RemoteRow> {
        let mut state = self.state();
        state.admit(RemoteCallKind::Update, Some(table), Some(id))?;

        let Some(current) = state.tables.get(table).and_then(|rows| rows.get(id)).cloned() else {
            return Err(SyncError::Conflict(format!("{table}/{id} no longer exists")));
        };
        if let Some(expected) = expected_version {
            if current.updated_at != expected {
                return Err(SyncError::Conflict(format!(
                    "{table}/{id} changed remotely (expected {expected}, found {})",
                    current.updated_at
                )));
            }
        }

        let mut fields = current.fields;
        for (key, value) in payload {
            fields.insert(key.clone(), value.clone());
        }
        let row = state.stamp(id.to_string(), fields);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(row.id.clone(), row.clone());
        state.count_write();
        Ok(row)
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> RemoteResult<()> {
        let mut state = self.state();
        state.admit(RemoteCallKind::Delete, Some(table), Some(id))?;

        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(());
        };
        if let (Some(expected), Some(current)) = (expected_version, rows.get(id)) {
            if current.updated_at != expected {
                return Err(SyncError::Conflict(format!(
                    "{table}/{id} changed remotely (expected {expected}, found {})",
                    current.updated_at
                )));
            }
        }
        rows.remove(id);
        state.count_write();
        Ok(())
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.state().admit(RemoteCallKind::Ping, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_get_increasing_versions() {
        let backend = InMemoryBackend::new();
        let first = backend
            .insert("boats", &payload(json!({"id": "b1", "name": "Aurora"})))
            .await
            .unwrap();
        let second = backend
            .update("boats", "b1", &payload(json!({"name": "Borealis"})), Some(first.updated_at))
            .await
            .unwrap();

        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.fields["name"], json!("Borealis"));
        assert_eq!(backend.calls_of(RemoteCallKind::Insert).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_update_is_a_conflict() {
        let backend = InMemoryBackend::new();
        let row = backend.put_row("boats", payload(json!({"id": "b1"})));
        backend.put_row("boats", payload(json!({"id": "b1", "name": "changed"})));

        let result = backend
            .update("boats", "b1", &payload(json!({"name": "mine"})), Some(row.updated_at))
            .await;
        assert!(matches!(result, Err(SyncError::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_insert_is_a_conflict() {
        let backend = InMemoryBackend::new();
        backend.put_row("boats", payload(json!({"id": "b1"})));

        let result = backend.insert("boats", &payload(json!({"id": "b1"}))).await;
        assert!(matches!(result, Err(SyncError::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_since_pages_in_version_order() {
        let backend = InMemoryBackend::new();
        let first = backend.put_row("boats", payload(json!({"id": "b2"})));
        backend.put_row("boats", payload(json!({"id": "b1"})));
        backend.put_row("boats", payload(json!({"id": "b3"})));

        let page = backend.fetch_since("boats", None, 2).await.unwrap();
        assert_eq!(
            page.iter().map(|row| row.id.as_str()).collect::<Vec<_>>(),
            vec!["b2", "b1"]
        );

        let newer = backend
            .fetch_since("boats", Some(&first.position()), 10)
            .await
            .unwrap();
        assert_eq!(
            newer.iter().map(|row| row.id.as_str()).collect::<Vec<_>>(),
            vec!["b1", "b3"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_since_breaks_version_ties_by_id() {
        let backend = InMemoryBackend::new();
        for id in ["b1", "b2", "b3"] {
            let row = RemoteRow::from_payload(payload(json!({"id": id, "updated_at": 7}))).unwrap();
            backend
                .state()
                .tables
                .entry("boats".to_string())
                .or_default()
                .insert(row.id.clone(), row);
        }

        let after = RemotePosition {
            updated_at: 7,
            id: "b1".to_string(),
        };
        let rows = backend.fetch_since("boats", Some(&after), 10).await.unwrap();
        assert_eq!(
            rows.iter().map(|row| row.id.as_str()).collect::<Vec<_>>(),
            vec!["b2", "b3"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnects_after_configured_writes() {
        let backend = InMemoryBackend::new();
        backend.disconnect_after_writes(1);

        backend
            .insert("boats", &payload(json!({"id": "b1"})))
            .await
            .unwrap();
        let result = backend.insert("boats", &payload(json!({"id": "b2"}))).await;

        assert!(matches!(result, Err(SyncError::Network(_))));
        assert!(backend.ping().await.is_err());

        backend.set_reachable(true);
        assert!(backend.ping().await.is_ok());
    }
}
