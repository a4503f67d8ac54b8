//! Conflict detection, strategies and resolution

use std::sync::Arc;

use serde_json::Value;

use super::remote::{RemoteBackend, RemoteRow};
use crate::capture::synced_record;
use crate::db::{
    ConflictRepository, PendingChangeRepository, RecordRepository, SqliteRecordRepository,
};
use crate::models::{
    merge_payload, ChangeOperation, Conflict, ConflictResolution, EntityRecord, NewPendingChange,
    Payload, PendingChange, SyncStatus,
};
use crate::services::LocalStore;
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Outcome chosen for a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-submit the local payload against the current remote version
    UseLocal,
    /// Discard the local change and adopt the remote row
    UseRemote,
    /// Submit a caller-supplied payload
    Merged(Payload),
}

impl Resolution {
    const fn as_resolution(&self) -> ConflictResolution {
        match self {
            Self::UseLocal => ConflictResolution::UseLocal,
            Self::UseRemote => ConflictResolution::UseRemote,
            Self::Merged(_) => ConflictResolution::Merged,
        }
    }
}

/// Policy applied automatically when a conflict is detected.
///
/// Returning `None` leaves the conflict for an explicit decision.
pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, local: &Payload, remote: Option<&Payload>) -> Option<Resolution>;
}

/// Last committed write wins: the remote row is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictStrategy for RemoteWins {
    fn name(&self) -> &'static str {
        "remote_wins"
    }

    fn resolve(&self, _local: &Payload, _remote: Option<&Payload>) -> Option<Resolution> {
        Some(Resolution::UseRemote)
    }
}

/// The local edit is re-submitted over the remote row.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ConflictStrategy for LocalWins {
    fn name(&self) -> &'static str {
        "local_wins"
    }

    fn resolve(&self, _local: &Payload, _remote: Option<&Payload>) -> Option<Resolution> {
        Some(Resolution::UseLocal)
    }
}

/// Remote fields overlaid by local fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowMerge;

impl ConflictStrategy for ShallowMerge {
    fn name(&self) -> &'static str {
        "shallow_merge"
    }

    fn resolve(&self, local: &Payload, remote: Option<&Payload>) -> Option<Resolution> {
        Some(remote.map_or(Resolution::UseLocal, |remote| {
            Resolution::Merged(merge_payload(remote, local))
        }))
    }
}

/// Every conflict waits for a user decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl ConflictStrategy for Manual {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve(&self, _local: &Payload, _remote: Option<&Payload>) -> Option<Resolution> {
        None
    }
}

/// Names accepted by [`strategy_from_name`].
pub const STRATEGY_NAMES: &[&str] = &["remote_wins", "local_wins", "shallow_merge", "manual"];

/// Look up a built-in strategy by name.
pub fn strategy_from_name(name: &str) -> Result<Arc<dyn ConflictStrategy>> {
    match name.trim() {
        "remote_wins" => Ok(Arc::new(RemoteWins)),
        "local_wins" => Ok(Arc::new(LocalWins)),
        "shallow_merge" => Ok(Arc::new(ShallowMerge)),
        "manual" => Ok(Arc::new(Manual)),
        other => Err(Error::Config(format!(
            "unknown conflict policy '{other}' (expected one of: {})",
            STRATEGY_NAMES.join(", ")
        ))),
    }
}

/// Result of handling one upload conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    /// The conflict as stored after the strategy ran
    pub conflict: Conflict,
}

impl ConflictOutcome {
    pub const fn auto_resolved(&self) -> bool {
        self.conflict.is_resolved()
    }
}

/// Records conflicts and applies resolutions
#[derive(Clone)]
pub struct ConflictResolver {
    store: LocalStore,
    strategy: Arc<dyn ConflictStrategy>,
}

impl ConflictResolver {
    pub fn new(store: LocalStore, strategy: Arc<dyn ConflictStrategy>) -> Self {
        Self { store, strategy }
    }

    /// Name of the configured strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Record a conflict for a rejected upload and apply the configured strategy.
    ///
    /// Fetching the remote row can fail with a network error; the change then
    /// stays queued untouched.
    pub async fn handle_upload_conflict(
        &self,
        backend: &dyn RemoteBackend,
        change: &PendingChange,
    ) -> Result<ConflictOutcome> {
        let remote = backend
            .fetch_one(&change.table_name, &change.record_id)
            .await?;
        let detected_at = unix_millis_now();

        let conflict = self
            .store
            .write(|tx| {
                ConflictRepository::new(tx).insert(
                    change,
                    remote.as_ref().map(|row| &row.fields),
                    remote.as_ref().map(|row| row.updated_at),
                    detected_at,
                )
            })
            .await?;
        tracing::warn!(
            "Conflict {} recorded for {}/{} ({})",
            conflict.id,
            change.table_name,
            change.record_id,
            change.operation
        );

        let decision = self
            .strategy
            .resolve(&change.payload, remote.as_ref().map(|row| &row.fields));
        let Some(resolution) = decision else {
            return Ok(ConflictOutcome { conflict });
        };

        let conflict = self
            .apply(conflict.id, &resolution, self.strategy.name())
            .await?;
        Ok(ConflictOutcome { conflict })
    }

    /// Settle a conflict with an explicit choice.
    pub async fn resolve(&self, conflict_id: i64, resolution: Resolution) -> Result<Conflict> {
        self.apply(conflict_id, &resolution, "manual").await
    }

    async fn apply(
        &self,
        conflict_id: i64,
        resolution: &Resolution,
        strategy: &str,
    ) -> Result<Conflict> {
        let now = unix_millis_now();

        let conflict = self
            .store
            .write(|tx| {
                let conflicts = ConflictRepository::new(tx);
                let pending = PendingChangeRepository::new(tx);
                let records = SqliteRecordRepository::new(tx);

                let conflict = conflicts
                    .get(conflict_id)?
                    .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
                if conflict.is_resolved() {
                    return Err(Error::InvalidInput(format!(
                        "conflict {conflict_id} is already resolved"
                    )));
                }

                // Edits made after detection are part of the local side.
                let queued = pending.get(conflict.pending_change_id)?.ok_or_else(|| {
                    Error::NotFound(format!(
                        "queued change {} for conflict {conflict_id}",
                        conflict.pending_change_id
                    ))
                })?;
                let local_payload = queued.payload;
                let local_operation = queued.operation;
                pending.delete(queued.id)?;

                match resolution {
                    Resolution::UseRemote => {
                        adopt_remote(&records, &conflict, now)?;
                    }
                    Resolution::UseLocal if local_operation == ChangeOperation::Delete => {
                        if conflict.remote_payload.is_some() {
                            requeue(&pending, &conflict, ChangeOperation::Delete, &local_payload, now)?;
                        }
                    }
                    Resolution::UseLocal => {
                        keep_local(&records, &pending, &conflict, local_payload, now)?;
                    }
                    Resolution::Merged(merged) => {
                        keep_local(&records, &pending, &conflict, merged.clone(), now)?;
                    }
                }

                conflicts.mark_resolved(conflict_id, resolution.as_resolution(), now, strategy)?;
                conflicts
                    .get(conflict_id)?
                    .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))
            })
            .await?;

        tracing::info!(
            "Conflict {} on {}/{} resolved as {} ({})",
            conflict.id,
            conflict.table_name,
            conflict.record_id,
            conflict.resolution,
            strategy
        );
        Ok(conflict)
    }
}

/// Overwrite (or remove) the local row with the remote state.
fn adopt_remote(records: &SqliteRecordRepository<'_>, conflict: &Conflict, now: i64) -> Result<()> {
    let row = match (&conflict.remote_payload, conflict.remote_version) {
        (Some(fields), Some(updated_at)) => Some(RemoteRow {
            id: conflict.record_id.clone(),
            fields: fields.clone(),
            updated_at,
        }),
        _ => None,
    };
    match row {
        Some(row) if !row.is_tombstone() => {
            records.upsert(&synced_record(&conflict.table_name, &row, now))
        }
        _ => {
            records.delete(&conflict.table_name, &conflict.record_id)?;
            Ok(())
        }
    }
}

/// Keep `payload` locally and queue it against the current remote version.
fn keep_local(
    records: &SqliteRecordRepository<'_>,
    pending: &PendingChangeRepository<'_>,
    conflict: &Conflict,
    mut payload: Payload,
    now: i64,
) -> Result<()> {
    payload.insert("id".to_string(), Value::String(conflict.record_id.clone()));
    let operation = if conflict.remote_payload.is_some() {
        ChangeOperation::Update
    } else {
        ChangeOperation::Insert
    };

    records.upsert(&EntityRecord {
        id: conflict.record_id.clone(),
        table: conflict.table_name.clone(),
        fields: payload.clone(),
        remote_updated_at: conflict.remote_version,
        sync_status: SyncStatus::Pending,
        last_modified: now,
    })?;
    requeue(pending, conflict, operation, &payload, now)
}

fn requeue(
    pending: &PendingChangeRepository<'_>,
    conflict: &Conflict,
    operation: ChangeOperation,
    payload: &Payload,
    now: i64,
) -> Result<()> {
    let created_at = pending.tail_position(now)?;
    pending.insert(&NewPendingChange {
        table_name: &conflict.table_name,
        record_id: &conflict.record_id,
        operation,
        payload,
        created_at,
        base_version: conflict.remote_version,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChangeCapture;
    use crate::sync::InMemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    struct Fixture {
        store: LocalStore,
        backend: InMemoryBackend,
    }

    /// A synced boat `b1` edited locally while the remote copy moved on.
    async fn diverged() -> (Fixture, PendingChange) {
        let store = LocalStore::open_in_memory(&["boats".to_string()]).unwrap();
        let capture = ChangeCapture::new(store.clone());
        let backend = InMemoryBackend::new();

        let original = backend.put_row(
            "boats",
            payload(json!({"id": "b1", "name": "Aurora", "berth": 1})),
        );
        capture.apply_remote("boats", &[original]).await.unwrap();
        capture
            .update("boats", "b1", payload(json!({"name": "Local"})))
            .await
            .unwrap();
        backend.put_row(
            "boats",
            payload(json!({"id": "b1", "name": "Remote", "berth": 2})),
        );

        let change = store.pending_changes().await.unwrap()[0].clone();
        (Fixture { store, backend }, change)
    }

    #[test]
    fn strategies_decide_as_named() {
        let local = payload(json!({"id": "b1", "name": "Local"}));
        let remote = payload(json!({"id": "b1", "name": "Remote", "berth": 2}));

        assert_eq!(RemoteWins.resolve(&local, Some(&remote)), Some(Resolution::UseRemote));
        assert_eq!(LocalWins.resolve(&local, Some(&remote)), Some(Resolution::UseLocal));
        assert_eq!(Manual.resolve(&local, Some(&remote)), None);
        assert_eq!(
            ShallowMerge.resolve(&local, Some(&remote)),
            Some(Resolution::Merged(payload(
                json!({"id": "b1", "name": "Local", "berth": 2})
            )))
        );
        assert_eq!(ShallowMerge.resolve(&local, None), Some(Resolution::UseLocal));
    }

    #[test]
    fn strategy_lookup_by_name() {
        for name in STRATEGY_NAMES {
            assert_eq!(strategy_from_name(name).unwrap().name(), *name);
        }
        assert!(strategy_from_name("coin_flip").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_wins_overwrites_local_row() {
        let (fixture, change) = diverged().await;
        let resolver = ConflictResolver::new(fixture.store.clone(), Arc::new(RemoteWins));

        let outcome = resolver
            .handle_upload_conflict(&fixture.backend, &change)
            .await
            .unwrap();

        assert!(outcome.auto_resolved());
        assert_eq!(outcome.conflict.resolution, ConflictResolution::UseRemote);
        assert_eq!(outcome.conflict.local_payload["name"], json!("Local"));
        assert!(fixture.store.pending_changes().await.unwrap().is_empty());

        let record = fixture.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(record.fields["name"], json!("Remote"));
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_conflict_waits_then_use_local_requeues() {
        let (fixture, change) = diverged().await;
        let resolver = ConflictResolver::new(fixture.store.clone(), Arc::new(Manual));

        let outcome = resolver
            .handle_upload_conflict(&fixture.backend, &change)
            .await
            .unwrap();
        assert!(!outcome.auto_resolved());
        assert_eq!(fixture.store.unresolved_conflict_count().await.unwrap(), 1);

        let resolved = resolver
            .resolve(outcome.conflict.id, Resolution::UseLocal)
            .await
            .unwrap();
        assert_eq!(resolved.strategy.as_deref(), Some("manual"));

        let queue = fixture.store.pending_changes().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_ne!(queue[0].id, change.id);
        assert_eq!(queue[0].operation, ChangeOperation::Update);
        assert_eq!(queue[0].payload["name"], json!("Local"));
        assert_eq!(
            queue[0].base_version,
            fixture.backend.row("boats", "b1").map(|row| row.updated_at)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merged_choice_keeps_supplied_payload() {
        let (fixture, change) = diverged().await;
        let resolver = ConflictResolver::new(fixture.store.clone(), Arc::new(Manual));
        let outcome = resolver
            .handle_upload_conflict(&fixture.backend, &change)
            .await
            .unwrap();

        resolver
            .resolve(
                outcome.conflict.id,
                Resolution::Merged(payload(json!({"name": "Both", "berth": 2}))),
            )
            .await
            .unwrap();

        let record = fixture.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(record.fields, payload(json!({"id": "b1", "name": "Both", "berth": 2})));
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(fixture.store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_twice_is_rejected() {
        let (fixture, change) = diverged().await;
        let resolver = ConflictResolver::new(fixture.store.clone(), Arc::new(Manual));
        let outcome = resolver
            .handle_upload_conflict(&fixture.backend, &change)
            .await
            .unwrap();

        resolver
            .resolve(outcome.conflict.id, Resolution::UseRemote)
            .await
            .unwrap();
        assert!(resolver
            .resolve(outcome.conflict.id, Resolution::UseLocal)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_without_queued_change_is_not_found() {
        let (fixture, change) = diverged().await;
        let resolver = ConflictResolver::new(fixture.store.clone(), Arc::new(Manual));
        let outcome = resolver
            .handle_upload_conflict(&fixture.backend, &change)
            .await
            .unwrap();
        fixture
            .store
            .write(|tx| PendingChangeRepository::new(tx).delete(change.id))
            .await
            .unwrap();

        let result = resolver.resolve(outcome.conflict.id, Resolution::UseRemote).await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        let stored = fixture.store.conflict(outcome.conflict.id).await.unwrap().unwrap();
        assert!(!stored.is_resolved());
        let record = fixture.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(record.fields["name"], json!("Local"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn use_remote_removes_row_soft_deleted_remotely() {
        let (fixture, change) = diverged().await;
        fixture.backend.put_row(
            "boats",
            payload(json!({"id": "b1", "name": "Remote", "is_deleted": true})),
        );
        let resolver = ConflictResolver::new(fixture.store.clone(), Arc::new(RemoteWins));

        let outcome = resolver
            .handle_upload_conflict(&fixture.backend, &change)
            .await
            .unwrap();

        assert!(outcome.auto_resolved());
        assert!(fixture.store.find_by_id("boats", "b1").await.unwrap().is_none());
        assert!(fixture.store.pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn use_remote_deletes_row_gone_remotely() {
        let store = LocalStore::open_in_memory(&["boats".to_string()]).unwrap();
        let capture = ChangeCapture::new(store.clone());
        let backend = InMemoryBackend::new();
        let original = backend.put_row("boats", payload(json!({"id": "b1", "name": "Aurora"})));
        capture.apply_remote("boats", &[original.clone()]).await.unwrap();
        capture
            .update("boats", "b1", payload(json!({"name": "Local"})))
            .await
            .unwrap();
        backend
            .delete("boats", "b1", Some(original.updated_at))
            .await
            .unwrap();

        let change = store.pending_changes().await.unwrap()[0].clone();
        let resolver = ConflictResolver::new(store.clone(), Arc::new(RemoteWins));
        let outcome = resolver.handle_upload_conflict(&backend, &change).await.unwrap();

        assert_eq!(outcome.conflict.remote_payload, None);
        assert!(store.find_by_id("boats", "b1").await.unwrap().is_none());
        assert!(store.pending_changes().await.unwrap().is_empty());
    }
}
