//! Sync pass orchestration: upload the queue, then download remote deltas

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;

use super::conflict::ConflictResolver;
use super::error::SyncError;
use super::events::{SkipReason, SyncEvent, SyncOutcome, SyncPhase, SyncReport};
use super::remote::{RemoteBackend, RemotePosition, RemoteRow};
use super::retry::RetryPolicy;
use crate::capture::ChangeCapture;
use crate::models::{strip_local_fields, ChangeOperation, PendingChange};
use crate::network::NetworkMonitor;
use crate::services::LocalStore;
use crate::status::SyncActivity;
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Default number of rows per download page
pub const DEFAULT_PAGE_SIZE: usize = 500;

const EVENT_CAPACITY: usize = 256;

/// Runs sync passes against one backend.
///
/// Cheap to clone; clones share the single-flight slot and the event channel.
#[derive(Clone)]
pub struct SyncEngine {
    store: LocalStore,
    capture: ChangeCapture,
    backend: Arc<dyn RemoteBackend>,
    monitor: NetworkMonitor,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    page_size: usize,
    activity: SyncActivity,
    events: broadcast::Sender<SyncEvent>,
}

#[derive(Debug, Default)]
struct TableDownload {
    downloaded: usize,
    deleted: usize,
    failed: bool,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        monitor: NetworkMonitor,
        resolver: ConflictResolver,
        retry: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            capture: ChangeCapture::new(store.clone()),
            store,
            backend,
            monitor,
            resolver,
            retry,
            page_size: DEFAULT_PAGE_SIZE,
            activity: SyncActivity::new(),
            events,
        }
    }

    /// Override the download page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Receive progress and outcome events of future passes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Shared single-flight flag, for status readers.
    pub fn activity(&self) -> SyncActivity {
        self.activity.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.activity.is_running()
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run one pass. Overlapping calls return `Skipped(AlreadyRunning)`.
    ///
    /// Only local storage failures abort a pass with an error; per-change
    /// failures are recorded on the change and reported in the outcome.
    pub async fn perform_full_sync(&self) -> Result<SyncOutcome> {
        let Some(_guard) = self.activity.try_begin() else {
            tracing::debug!("Sync pass already running; request coalesced");
            return Ok(self.skip(SkipReason::AlreadyRunning));
        };
        if !self.monitor.is_online() {
            tracing::debug!("Offline; sync pass skipped");
            return Ok(self.skip(SkipReason::Offline));
        }

        tracing::info!("Sync pass started");
        self.emit(SyncEvent::Started);

        match self.run_pass().await {
            Ok(report) => {
                let finished_at = report.finished_at;
                let interrupted = report.interrupted;
                self.store
                    .update_settings(|settings| {
                        if interrupted {
                            settings.last_sync_error =
                                Some("connection lost during sync".to_string());
                        } else {
                            settings.last_sync_at = Some(finished_at);
                            settings.last_sync_error = None;
                        }
                    })
                    .await?;

                tracing::info!(
                    "Sync pass finished: {} uploaded, {} failed, {} conflicts, {} downloaded{}",
                    report.uploaded,
                    report.failed,
                    report.conflicts,
                    report.downloaded,
                    if interrupted { " (interrupted)" } else { "" }
                );
                self.emit(SyncEvent::Finished(report.clone()));
                Ok(SyncOutcome::Completed(report))
            }
            Err(error) => {
                tracing::warn!("Sync pass failed: {error}");
                let message = error.to_string();
                if let Err(save_error) = self
                    .store
                    .update_settings(|settings| settings.last_sync_error = Some(message.clone()))
                    .await
                {
                    tracing::warn!("Could not record sync failure: {save_error}");
                }
                self.emit(SyncEvent::Failed { error: message });
                Err(error)
            }
        }
    }

    fn skip(&self, reason: SkipReason) -> SyncOutcome {
        self.emit(SyncEvent::Skipped { reason });
        SyncOutcome::Skipped { reason }
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport {
            started_at: unix_millis_now(),
            ..SyncReport::default()
        };

        self.upload(&mut report).await?;
        if !report.interrupted {
            self.download(&mut report).await?;
        }

        report.finished_at = unix_millis_now();
        Ok(report)
    }

    async fn upload(&self, report: &mut SyncReport) -> Result<()> {
        let queue = self.store.pending_changes().await?;
        let blocked: HashSet<i64> = self.store.blocked_change_ids().await?.into_iter().collect();
        let now = unix_millis_now();
        // Records whose insert has not been acknowledged yet.
        let mut unsettled: HashSet<String> = queue
            .iter()
            .filter(|change| change.operation == ChangeOperation::Insert)
            .map(|change| change.record_id.clone())
            .collect();

        let (eligible, held_back): (Vec<PendingChange>, Vec<PendingChange>) = queue
            .into_iter()
            .partition(|change| !blocked.contains(&change.id) && self.retry.is_ready(change, now));
        report.skipped += held_back.len();

        let total = eligible.len();
        for (index, change) in eligible.iter().enumerate() {
            if !self.monitor.is_online() {
                tracing::info!("Went offline; {} queued changes left for later", total - index);
                report.interrupted = true;
                return Ok(());
            }

            if let Some(parent) = unsettled_reference(change, &unsettled) {
                tracing::debug!(
                    "Holding back {}/{}: references {parent}, not uploaded yet",
                    change.table_name,
                    change.record_id
                );
                report.skipped += 1;
                self.emit(SyncEvent::Progress {
                    phase: SyncPhase::Upload,
                    percent: progress(index + 1, total, 0),
                });
                continue;
            }

            self.store.mark_sent(change.id).await?;
            match self.push(change).await {
                Ok(ack) => {
                    self.capture.acknowledge(change, ack.as_ref()).await?;
                    if change.operation == ChangeOperation::Insert {
                        unsettled.remove(&change.record_id);
                    }
                    report.uploaded += 1;
                    tracing::debug!(
                        "Uploaded {} {}/{}",
                        change.operation,
                        change.table_name,
                        change.record_id
                    );
                    self.emit(SyncEvent::Uploaded {
                        table: change.table_name.clone(),
                        record_id: change.record_id.clone(),
                        operation: change.operation,
                    });
                }
                Err(SyncError::Conflict(message)) => {
                    tracing::warn!(
                        "Upload of {}/{} conflicted: {message}",
                        change.table_name,
                        change.record_id
                    );
                    match self
                        .resolver
                        .handle_upload_conflict(self.backend.as_ref(), change)
                        .await
                    {
                        Ok(outcome) => {
                            report.conflicts += 1;
                            if outcome.auto_resolved() {
                                report.auto_resolved += 1;
                                // The row exists remotely either way.
                                unsettled.remove(&change.record_id);
                            }
                            self.emit(SyncEvent::ConflictDetected {
                                conflict_id: outcome.conflict.id,
                                table: change.table_name.clone(),
                                record_id: change.record_id.clone(),
                                resolution: outcome.conflict.resolution,
                            });
                        }
                        Err(Error::Sync(error)) if error.is_transient() => {
                            if !self.transient_failure(change, &error, report).await? {
                                return Ok(());
                            }
                        }
                        Err(error) => return Err(error),
                    }
                }
                Err(SyncError::Validation(message)) => {
                    tracing::warn!(
                        "Backend rejected {}/{}: {message}",
                        change.table_name,
                        change.record_id
                    );
                    self.store
                        .mark_error(change.id, &message, self.retry.max_attempts)
                        .await?;
                    report.failed += 1;
                    self.emit(SyncEvent::UploadFailed {
                        table: change.table_name.clone(),
                        record_id: change.record_id.clone(),
                        error: message,
                        exhausted: true,
                    });
                }
                Err(error) => {
                    if !self.transient_failure(change, &error, report).await? {
                        return Ok(());
                    }
                }
            }

            self.emit(SyncEvent::Progress {
                phase: SyncPhase::Upload,
                percent: progress(index + 1, total, 0),
            });
        }
        Ok(())
    }

    /// Handle a retryable upload failure.
    ///
    /// Returns `false` when the backend is unreachable: the monitor goes
    /// offline, the change is left untouched and the pass stops.
    async fn transient_failure(
        &self,
        change: &PendingChange,
        error: &SyncError,
        report: &mut SyncReport,
    ) -> Result<bool> {
        if self.backend.ping().await.is_err() {
            tracing::info!(
                "Backend unreachable after failed upload of {}/{}",
                change.table_name,
                change.record_id
            );
            self.monitor.set_online(false);
            report.interrupted = true;
            return Ok(false);
        }

        let attempts = change.retry_count.saturating_add(1);
        let message = error.to_string();
        let exhausted = self.retry.is_exhausted(attempts);
        if exhausted {
            tracing::warn!(
                "Giving up on {}/{} after {attempts} attempts: {message}",
                change.table_name,
                change.record_id
            );
            self.store.mark_error(change.id, &message, attempts).await?;
        } else {
            tracing::warn!(
                "Upload of {}/{} failed (attempt {attempts}): {message}",
                change.table_name,
                change.record_id
            );
            self.store.record_failure(change.id, attempts, &message).await?;
        }

        report.failed += 1;
        self.emit(SyncEvent::UploadFailed {
            table: change.table_name.clone(),
            record_id: change.record_id.clone(),
            error: message,
            exhausted,
        });
        Ok(true)
    }

    async fn push(&self, change: &PendingChange) -> std::result::Result<Option<RemoteRow>, SyncError> {
        let payload = strip_local_fields(&change.payload);
        let table = change.table_name.as_str();
        match change.operation {
            ChangeOperation::Insert => self.backend.insert(table, &payload).await.map(Some),
            ChangeOperation::Update => self
                .backend
                .update(table, &change.record_id, &payload, change.base_version)
                .await
                .map(Some),
            ChangeOperation::Delete => self
                .backend
                .delete(table, &change.record_id, change.base_version)
                .await
                .map(|()| None),
        }
    }

    async fn download(&self, report: &mut SyncReport) -> Result<()> {
        let tables = self.store.tables().to_vec();
        let results = join_all(tables.iter().map(|table| self.download_table(table))).await;

        for (table, result) in tables.iter().zip(results) {
            let outcome = result?;
            report.downloaded += outcome.downloaded;
            report.deleted += outcome.deleted;
            if outcome.failed {
                report.failed_tables.push(table.clone());
            }
        }
        if !self.monitor.is_online() {
            report.interrupted = true;
        }

        self.emit(SyncEvent::Progress {
            phase: SyncPhase::Download,
            percent: 100,
        });
        Ok(())
    }

    /// Pull one table page by page in (`updated_at`, `id`) order.
    ///
    /// Each page starts after the last row of the previous one, so rows
    /// re-stamped mid-run move to a later page instead of shifting others
    /// out of reach. The stored cursor advances after every page.
    async fn download_table(&self, table: &str) -> Result<TableDownload> {
        let mut after: Option<RemotePosition> = self.store.cursor(table).await?;
        let mut outcome = TableDownload::default();

        loop {
            if !self.monitor.is_online() {
                outcome.failed = true;
                break;
            }

            let rows = match self
                .backend
                .fetch_since(table, after.as_ref(), self.page_size)
                .await
            {
                Ok(rows) => rows,
                Err(error) => {
                    tracing::warn!("Download of {table} failed: {error}");
                    outcome.failed = true;
                    break;
                }
            };

            let fetched = rows.len();
            let applied = self.capture.apply_remote(table, &rows).await?;
            outcome.downloaded += applied.upserted;
            outcome.deleted += applied.deleted;
            if let Some(cursor) = applied.cursor {
                self.emit(SyncEvent::Downloaded {
                    table: table.to_string(),
                    rows: fetched,
                    cursor: cursor.updated_at,
                });
            }

            if fetched < self.page_size {
                break;
            }
            after = rows.iter().map(RemoteRow::position).max();
        }

        tracing::debug!(
            "Downloaded {} rows for {table} ({} deleted)",
            outcome.downloaded,
            outcome.deleted
        );
        Ok(outcome)
    }

    /// Make changes that stopped auto-retrying eligible again.
    pub async fn retry_failed(&self) -> Result<usize> {
        let reset = self.store.reset_exhausted(self.retry.max_attempts).await?;
        if reset > 0 {
            tracing::info!("Reset {reset} failed changes for retry");
        }
        Ok(reset)
    }
}

/// Id of a not yet uploaded insert that `change` refers to through one of its
/// fields. Deletes never wait.
fn unsettled_reference<'a>(
    change: &PendingChange,
    unsettled: &'a HashSet<String>,
) -> Option<&'a str> {
    if change.operation == ChangeOperation::Delete {
        return None;
    }
    change
        .payload
        .iter()
        .filter(|(key, _)| key.as_str() != "id")
        .filter_map(|(_, value)| value.as_str())
        .filter(|value| *value != change.record_id)
        .find_map(|value| unsettled.get(value).map(String::as_str))
}

/// Advisory percentage: upload covers 0-50, download 50-100.
fn progress(done: usize, total: usize, base: u8) -> u8 {
    if total == 0 {
        return base + 50;
    }
    let share = (done.min(total) * 50) / total;
    base + u8::try_from(share).unwrap_or(50)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::models::{Payload, SyncStatus};
    use crate::sync::{
        ConflictStrategy, InMemoryBackend, Manual, RemoteCallKind, RemoteResult, RemoteWins,
        Resolution,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    struct Harness {
        store: LocalStore,
        capture: ChangeCapture,
        backend: InMemoryBackend,
        monitor: NetworkMonitor,
        engine: SyncEngine,
    }

    fn test_store() -> LocalStore {
        LocalStore::open_in_memory(&["boats".to_string(), "tenants".to_string()]).unwrap()
    }

    fn engine_over(
        store: &LocalStore,
        backend: Arc<dyn RemoteBackend>,
        monitor: &NetworkMonitor,
        strategy: Arc<dyn ConflictStrategy>,
    ) -> SyncEngine {
        let resolver = ConflictResolver::new(store.clone(), strategy);
        SyncEngine::new(
            store.clone(),
            backend,
            monitor.clone(),
            resolver,
            RetryPolicy::immediate(3),
        )
    }

    fn harness_with(strategy: Arc<dyn ConflictStrategy>) -> Harness {
        let store = test_store();
        let backend = InMemoryBackend::new();
        let monitor = NetworkMonitor::new(true);
        let engine = engine_over(&store, Arc::new(backend.clone()), &monitor, strategy);
        Harness {
            capture: ChangeCapture::new(store.clone()),
            store,
            backend,
            monitor,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(RemoteWins))
    }

    #[test]
    fn progress_is_split_between_phases() {
        assert_eq!(progress(0, 4, 0), 0);
        assert_eq!(progress(2, 4, 0), 25);
        assert_eq!(progress(4, 4, 0), 50);
        assert_eq!(progress(0, 0, 0), 50);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_pass_is_skipped() {
        let h = harness();
        h.monitor.set_online(false);

        let outcome = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Skipped {
                reason: SkipReason::Offline
            }
        );
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_pass_is_coalesced() {
        let h = harness();
        let _guard = h.engine.activity().try_begin().unwrap();

        let outcome = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_strips_local_fields_and_marks_synced() {
        let h = harness();
        h.capture
            .insert(
                "boats",
                payload(json!({"id": "b1", "name": "Aurora", "_draft": true, "sync_status": "x"})),
            )
            .await
            .unwrap();

        let outcome = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(outcome.report().unwrap().uploaded, 1);

        let remote = h.backend.row("boats", "b1").unwrap();
        assert!(!remote.fields.contains_key("_draft"));
        assert!(!remote.fields.contains_key("sync_status"));

        let local = h.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(local.remote_updated_at, Some(remote.updated_at));
        assert!(h.store.settings().await.unwrap().last_sync_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validation_error_is_terminal() {
        let h = harness();
        h.capture
            .insert("boats", payload(json!({"id": "b1", "name": "Aurora"})))
            .await
            .unwrap();
        h.backend
            .inject_failure(SyncError::Validation("name too long".to_string()));

        let report = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(report.report().unwrap().failed, 1);

        let queue = h.store.pending_changes().await.unwrap();
        assert_eq!(queue[0].retry_count, 3);
        let local = h.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Error);

        h.backend.clear_calls();
        h.engine.perform_full_sync().await.unwrap();
        assert!(h.backend.calls_of(RemoteCallKind::Insert).is_empty());

        assert_eq!(h.engine.retry_failed().await.unwrap(), 1);
        h.engine.perform_full_sync().await.unwrap();
        assert!(h.store.pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failures_exhaust_after_threshold() {
        let h = harness();
        h.capture
            .insert("boats", payload(json!({"id": "b1"})))
            .await
            .unwrap();

        for _ in 0..3 {
            h.backend
                .inject_failure(SyncError::Network("HTTP 503".to_string()));
            h.engine.perform_full_sync().await.unwrap();
        }

        let queue = h.store.pending_changes().await.unwrap();
        assert_eq!(queue[0].retry_count, 3);
        assert_eq!(queue[0].last_error.as_deref(), Some("Network error: HTTP 503"));
        let local = h.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Error);
        assert_eq!(h.store.exhausted_count(3).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_pages_and_advances_cursor() {
        let h = harness();
        let mut last = None;
        for index in 0..5 {
            last = Some(
                h.backend
                    .put_row("tenants", payload(json!({"id": format!("t{index}")})))
                    .position(),
            );
        }
        let engine = h.engine.clone().with_page_size(2);

        let report = engine.perform_full_sync().await.unwrap();
        assert_eq!(report.report().unwrap().downloaded, 5);
        assert_eq!(h.store.cursor("tenants").await.unwrap(), last);
        // Three pages of tenants plus one empty page of boats.
        assert_eq!(h.backend.calls_of(RemoteCallKind::FetchSince).len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_pass_without_changes_is_idle() {
        let h = harness();
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "Aurora"})));
        h.engine.perform_full_sync().await.unwrap();

        let outcome = h.engine.perform_full_sync().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.conflicts, 0);
        assert_eq!(h.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolved_conflict_holds_change_back() {
        let h = harness_with(Arc::new(Manual));
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "Aurora"})));
        h.engine.perform_full_sync().await.unwrap();
        h.capture
            .update("boats", "b1", payload(json!({"name": "Local"})))
            .await
            .unwrap();
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "Remote"})));

        let report = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(report.report().unwrap().conflicts, 1);
        assert_eq!(report.report().unwrap().auto_resolved, 0);

        h.backend.clear_calls();
        let report = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(report.report().unwrap().skipped, 1);
        assert!(h.backend.calls_of(RemoteCallKind::Update).is_empty());
        assert_eq!(h.store.unresolved_conflict_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_are_broadcast() {
        let h = harness();
        let mut events = h.engine.subscribe();
        h.capture
            .insert("boats", payload(json!({"id": "b1"})))
            .await
            .unwrap();

        h.engine.perform_full_sync().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.first(), Some(&SyncEvent::Started));
        assert!(seen
            .iter()
            .any(|event| matches!(event, SyncEvent::Uploaded { record_id, .. } if record_id == "b1")));
        assert!(matches!(seen.last(), Some(SyncEvent::Finished(_))));
    }

    /// Re-stamps one row as another client would, right after the first page
    /// of its table has been served.
    struct EditBetweenPages {
        inner: InMemoryBackend,
        table: &'static str,
        id: &'static str,
        edited: AtomicBool,
    }

    #[async_trait]
    impl RemoteBackend for EditBetweenPages {
        async fn fetch_since(
            &self,
            table: &str,
            after: Option<&RemotePosition>,
            limit: usize,
        ) -> RemoteResult<Vec<RemoteRow>> {
            let rows = self.inner.fetch_since(table, after, limit).await?;
            if table == self.table && !self.edited.swap(true, Ordering::SeqCst) {
                if let Some(row) = self.inner.row(table, self.id) {
                    let mut fields = row.fields;
                    fields.insert("name".to_string(), json!("edited"));
                    self.inner.put_row(table, fields);
                }
            }
            Ok(rows)
        }

        async fn fetch_one(&self, table: &str, id: &str) -> RemoteResult<Option<RemoteRow>> {
            self.inner.fetch_one(table, id).await
        }

        async fn insert(&self, table: &str, payload: &Payload) -> RemoteResult<RemoteRow> {
            self.inner.insert(table, payload).await
        }

        async fn update(
            &self,
            table: &str,
            id: &str,
            payload: &Payload,
            expected_version: Option<i64>,
        ) -> RemoteResult<RemoteRow> {
            self.inner.update(table, id, payload, expected_version).await
        }

        async fn delete(
            &self,
            table: &str,
            id: &str,
            expected_version: Option<i64>,
        ) -> RemoteResult<()> {
            self.inner.delete(table, id, expected_version).await
        }

        async fn ping(&self) -> RemoteResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn row_edited_between_pages_does_not_hide_others() {
        let store = test_store();
        let inner = InMemoryBackend::new();
        for index in 0..4 {
            inner.put_row(
                "boats",
                payload(json!({"id": format!("b{index}"), "name": "original"})),
            );
        }
        let backend = Arc::new(EditBetweenPages {
            inner: inner.clone(),
            table: "boats",
            id: "b0",
            edited: AtomicBool::new(false),
        });
        let monitor = NetworkMonitor::new(true);
        let engine = engine_over(&store, backend, &monitor, Arc::new(RemoteWins)).with_page_size(2);

        engine.perform_full_sync().await.unwrap();

        for index in 0..4 {
            let id = format!("b{index}");
            let local = store.find_by_id("boats", &id).await.unwrap();
            assert!(local.is_some(), "{id} was never downloaded");
        }
        let b0 = store.find_by_id("boats", "b0").await.unwrap().unwrap();
        assert_eq!(b0.fields["name"], json!("edited"));
        assert_eq!(
            store.cursor("boats").await.unwrap(),
            inner.row("boats", "b0").as_ref().map(RemoteRow::position)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn use_remote_adopts_version_downloaded_while_conflict_waited() {
        let h = harness_with(Arc::new(Manual));
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "v1"})));
        h.engine.perform_full_sync().await.unwrap();
        h.capture
            .update("boats", "b1", payload(json!({"name": "local"})))
            .await
            .unwrap();
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "v2"})));
        h.engine.perform_full_sync().await.unwrap();
        let conflict = h.store.conflicts(true, 10).await.unwrap().remove(0);
        assert_eq!(conflict.remote_payload.unwrap()["name"], json!("v2"));

        let newest = h
            .backend
            .put_row("boats", payload(json!({"id": "b1", "name": "v3"})));
        h.engine.perform_full_sync().await.unwrap();
        let waiting = h.store.conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(waiting.remote_version, Some(newest.updated_at));

        h.engine
            .resolver()
            .resolve(conflict.id, Resolution::UseRemote)
            .await
            .unwrap();
        let local = h.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(local.fields["name"], json!("v3"));
        assert_eq!(local.remote_updated_at, Some(newest.updated_at));

        h.engine.perform_full_sync().await.unwrap();
        let local = h.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(local.fields, h.backend.row("boats", "b1").unwrap().fields);
        assert_eq!(h.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn use_local_after_newer_download_uploads_without_new_conflict() {
        let h = harness_with(Arc::new(Manual));
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "v1"})));
        h.engine.perform_full_sync().await.unwrap();
        h.capture
            .update("boats", "b1", payload(json!({"name": "local"})))
            .await
            .unwrap();
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "v2"})));
        h.engine.perform_full_sync().await.unwrap();
        h.backend
            .put_row("boats", payload(json!({"id": "b1", "name": "v3"})));
        h.engine.perform_full_sync().await.unwrap();

        let conflict = h.store.conflicts(true, 10).await.unwrap().remove(0);
        h.engine
            .resolver()
            .resolve(conflict.id, Resolution::UseLocal)
            .await
            .unwrap();
        let report = h.engine.perform_full_sync().await.unwrap();

        assert_eq!(report.report().unwrap().conflicts, 0);
        assert_eq!(report.report().unwrap().uploaded, 1);
        assert_eq!(h.backend.row("boats", "b1").unwrap().fields["name"], json!("local"));
    }

    /// Deletes the record locally while its insert is on the wire.
    struct DeleteDuringInsert {
        inner: InMemoryBackend,
        capture: ChangeCapture,
    }

    #[async_trait]
    impl RemoteBackend for DeleteDuringInsert {
        async fn fetch_since(
            &self,
            table: &str,
            after: Option<&RemotePosition>,
            limit: usize,
        ) -> RemoteResult<Vec<RemoteRow>> {
            self.inner.fetch_since(table, after, limit).await
        }

        async fn fetch_one(&self, table: &str, id: &str) -> RemoteResult<Option<RemoteRow>> {
            self.inner.fetch_one(table, id).await
        }

        async fn insert(&self, table: &str, payload: &Payload) -> RemoteResult<RemoteRow> {
            let id = payload.get("id").and_then(Value::as_str).unwrap_or_default();
            self.capture
                .delete(table, id)
                .await
                .map_err(|error| SyncError::Storage(error.to_string()))?;
            self.inner.insert(table, payload).await
        }

        async fn update(
            &self,
            table: &str,
            id: &str,
            payload: &Payload,
            expected_version: Option<i64>,
        ) -> RemoteResult<RemoteRow> {
            self.inner.update(table, id, payload, expected_version).await
        }

        async fn delete(
            &self,
            table: &str,
            id: &str,
            expected_version: Option<i64>,
        ) -> RemoteResult<()> {
            self.inner.delete(table, id, expected_version).await
        }

        async fn ping(&self) -> RemoteResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_during_insert_upload_removes_remote_row() {
        let store = test_store();
        let capture = ChangeCapture::new(store.clone());
        let inner = InMemoryBackend::new();
        let backend = Arc::new(DeleteDuringInsert {
            inner: inner.clone(),
            capture: capture.clone(),
        });
        let monitor = NetworkMonitor::new(true);
        let engine = engine_over(&store, backend, &monitor, Arc::new(RemoteWins));
        capture
            .insert("boats", payload(json!({"id": "b1", "name": "Aurora"})))
            .await
            .unwrap();

        engine.perform_full_sync().await.unwrap();
        engine.perform_full_sync().await.unwrap();

        assert!(store.find_by_id("boats", "b1").await.unwrap().is_none());
        assert!(inner.row("boats", "b1").is_none());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_waits_for_parent_insert_that_failed() {
        let h = harness();
        h.capture
            .insert("tenants", payload(json!({"id": "t1", "name": "Marina"})))
            .await
            .unwrap();
        h.capture
            .insert("boats", payload(json!({"id": "b1", "tenant_id": "t1"})))
            .await
            .unwrap();
        h.backend
            .inject_failure(SyncError::Network("HTTP 503".to_string()));

        let report = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(report.report().unwrap().failed, 1);
        assert_eq!(report.report().unwrap().skipped, 1);
        let inserted = h
            .backend
            .calls_of(RemoteCallKind::Insert)
            .into_iter()
            .filter_map(|call| call.record_id)
            .collect::<Vec<_>>();
        assert_eq!(inserted, vec!["t1"]);
        let child = h.store.find_by_id("boats", "b1").await.unwrap().unwrap();
        assert_eq!(child.sync_status, SyncStatus::Pending);

        h.engine.perform_full_sync().await.unwrap();
        assert!(h.backend.row("tenants", "t1").is_some());
        assert!(h.backend.row("boats", "b1").is_some());
        assert_eq!(h.store.pending_count().await.unwrap(), 0);
    }

    #[test]
    fn references_to_unsettled_inserts_are_found() {
        let change = |operation, fields: Value| PendingChange {
            id: 1,
            table_name: "boats".to_string(),
            record_id: "b1".to_string(),
            operation,
            payload: payload(fields),
            created_at: 0,
            retry_count: 0,
            last_error: None,
            base_version: None,
            last_attempt_at: None,
            sent_at: None,
        };
        let unsettled: HashSet<String> = ["t1".to_string(), "b1".to_string()].into();

        let child = change(ChangeOperation::Insert, json!({"id": "b1", "tenant_id": "t1"}));
        assert_eq!(unsettled_reference(&child, &unsettled), Some("t1"));
        let own = change(ChangeOperation::Update, json!({"id": "b1", "alias": "b1"}));
        assert_eq!(unsettled_reference(&own, &unsettled), None);
        let removal = change(ChangeOperation::Delete, json!({"id": "b1", "tenant_id": "t1"}));
        assert_eq!(unsettled_reference(&removal, &unsettled), None);
    }
}
