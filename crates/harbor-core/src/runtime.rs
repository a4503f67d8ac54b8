//! Composition root wiring the store, the engine and the scheduler together.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::capture::ChangeCapture;
use crate::config::SyncSettings;
use crate::diagnostics::{Diagnostics, DiagnosticsExporter};
use crate::models::Conflict;
use crate::network::{spawn_probe, NetworkMonitor, ReconnectTrigger};
use crate::scheduler::{BackgroundScheduler, SchedulerState, WakeSource};
use crate::services::LocalStore;
use crate::status::{StatusAggregator, SyncStatusSnapshot};
use crate::sync::{
    ConflictResolver, PostgrestBackend, RemoteBackend, Resolution, SyncEngine, SyncEvent,
    SyncOutcome,
};
use crate::{Error, Result};

/// One app instance's sync stack.
///
/// Everything a UI needs goes through here: local mutations via
/// [`SyncRuntime::capture`], passes, status, conflicts, background sync and
/// diagnostics.
pub struct SyncRuntime {
    settings: SyncSettings,
    store: LocalStore,
    capture: ChangeCapture,
    backend: Arc<dyn RemoteBackend>,
    monitor: NetworkMonitor,
    engine: SyncEngine,
    status: StatusAggregator,
    diagnostics: DiagnosticsExporter,
    scheduler: BackgroundScheduler,
}

impl SyncRuntime {
    /// Wire a runtime from already-built parts.
    pub fn new(
        settings: SyncSettings,
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        wake_source: Arc<dyn WakeSource>,
        initially_online: bool,
    ) -> Result<Self> {
        settings.validate()?;
        let retry = settings.retry_policy();
        let monitor = NetworkMonitor::new(initially_online);
        let resolver = ConflictResolver::new(store.clone(), settings.conflict_strategy()?);
        let engine = SyncEngine::new(
            store.clone(),
            Arc::clone(&backend),
            monitor.clone(),
            resolver,
            retry,
        )
        .with_page_size(settings.page_size);
        let status =
            StatusAggregator::new(store.clone(), monitor.clone(), engine.activity(), retry);
        let diagnostics = DiagnosticsExporter::new(store.clone(), status.clone(), retry);
        let scheduler = BackgroundScheduler::new(
            store.clone(),
            engine.clone(),
            wake_source,
            settings.background_interval(),
        );

        Ok(Self {
            capture: ChangeCapture::new(store.clone()),
            settings,
            store,
            backend,
            monitor,
            engine,
            status,
            diagnostics,
            scheduler,
        })
    }

    /// Open the database at `database_path` and connect to the configured
    /// HTTP backend.
    pub fn connect(
        settings: SyncSettings,
        database_path: &Path,
        wake_source: Arc<dyn WakeSource>,
    ) -> Result<Self> {
        settings.validate()?;
        let (Some(remote_url), Some(api_key)) = (&settings.remote_url, &settings.api_key) else {
            return Err(Error::Config(
                "remote_url and api_key are required to sync".to_string(),
            ));
        };
        let backend = PostgrestBackend::new(
            remote_url.clone(),
            api_key.clone(),
            settings.access_token.clone(),
            settings.request_timeout(),
        )?;
        let store = LocalStore::open_path(database_path, &settings.tables)?;
        Self::new(settings, store, Arc::new(backend), wake_source, true)
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Entry point for local mutations.
    pub const fn capture(&self) -> &ChangeCapture {
        &self.capture
    }

    pub const fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub const fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn perform_full_sync(&self) -> Result<SyncOutcome> {
        self.engine.perform_full_sync().await
    }

    pub async fn sync_status(&self) -> Result<SyncStatusSnapshot> {
        self.status.snapshot().await
    }

    pub async fn resolve_conflict(&self, conflict_id: i64, choice: Resolution) -> Result<Conflict> {
        self.engine.resolver().resolve(conflict_id, choice).await
    }

    pub async fn toggle_background_sync(&self, enabled: bool) -> Result<SchedulerState> {
        self.scheduler.toggle(enabled).await
    }

    /// Re-register background sync from the persisted flag.
    pub async fn restore_background_sync(&self) -> Result<SchedulerState> {
        self.scheduler.restore().await
    }

    pub fn background_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub async fn export_diagnostics(&self) -> Result<Diagnostics> {
        self.diagnostics.collect(self.scheduler.state()).await
    }

    pub async fn retry_failed(&self) -> Result<usize> {
        self.engine.retry_failed().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Start a debounced pass whenever the monitor comes back online.
    pub fn install_reconnect_trigger(&self) -> Result<ReconnectTrigger> {
        let engine = self.engine.clone();
        ReconnectTrigger::install(&self.monitor, self.settings.reconnect_debounce(), move || {
            let engine = engine.clone();
            async move {
                if let Err(error) = engine.perform_full_sync().await {
                    tracing::warn!("Reconnect sync failed: {error}");
                }
            }
        })
    }

    /// Ping the backend once and record the result on the monitor.
    pub async fn probe_once(&self) -> bool {
        let reachable = match self.backend.ping().await {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!("Backend not reachable: {error}");
                false
            }
        };
        self.monitor.set_online(reachable);
        reachable
    }

    /// Poll the backend to keep the monitor current.
    pub fn spawn_probe(&self) -> JoinHandle<()> {
        spawn_probe(
            self.monitor.clone(),
            Arc::clone(&self.backend),
            self.settings.probe_interval(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::UnsupportedWakeSource;
    use crate::state::SyncState;
    use crate::sync::{InMemoryBackend, RetryPolicy};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn runtime(backend: &InMemoryBackend, initially_online: bool) -> SyncRuntime {
        let settings = SyncSettings {
            tables: vec!["boats".to_string()],
            reconnect_debounce_ms: 50,
            ..SyncSettings::default()
        };
        let store = LocalStore::open_in_memory(&settings.tables).unwrap();
        SyncRuntime::new(
            settings,
            store,
            Arc::new(backend.clone()),
            Arc::new(UnsupportedWakeSource),
            initially_online,
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_runs_one_pass() {
        let backend = InMemoryBackend::new();
        let runtime = runtime(&backend, false);
        let _trigger = runtime.install_reconnect_trigger().unwrap();
        runtime
            .capture()
            .insert("boats", json!({"id": "b1"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        runtime.monitor().set_online(true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(backend.row("boats", "b1").is_some());
        let status = runtime.sync_status().await.unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.pending_changes, 0);
        assert!(status.last_sync.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_toggle_degrades_without_wake_support() {
        let runtime = runtime(&InMemoryBackend::new(), true);

        let state = runtime.toggle_background_sync(true).await.unwrap();
        assert_eq!(state, SchedulerState::ForegroundOnly);

        let diagnostics = runtime.export_diagnostics().await.unwrap();
        assert_eq!(diagnostics.background_sync, SchedulerState::ForegroundOnly);
    }

    #[test]
    fn settings_feed_the_engine() {
        let runtime = runtime(&InMemoryBackend::new(), true);
        assert_eq!(runtime.engine().retry_policy(), RetryPolicy::default());
        assert_eq!(runtime.engine().resolver().strategy_name(), "remote_wins");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_once_updates_monitor() {
        let backend = InMemoryBackend::new();
        let runtime = runtime(&backend, true);

        backend.set_reachable(false);
        assert!(!runtime.probe_once().await);
        assert!(!runtime.monitor().is_online());

        backend.set_reachable(true);
        assert!(runtime.probe_once().await);
        assert!(runtime.monitor().is_online());
    }

    #[test]
    fn connect_requires_remote() {
        let dir = tempfile::tempdir().unwrap();
        let result = SyncRuntime::connect(
            SyncSettings::default(),
            &dir.path().join("harbor.db"),
            Arc::new(UnsupportedWakeSource),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
