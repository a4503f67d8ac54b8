//! Best-effort periodic sync outside the foreground lifecycle

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::services::LocalStore;
use crate::sync::{SyncEngine, SyncError, SyncOutcome};
use crate::Result;

/// Default period between background passes
pub const DEFAULT_BACKGROUND_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Callback run on every wake
pub type WakeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Platform capability to wake the process periodically.
pub trait WakeSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start calling `wake` every `interval` until the handle is dropped.
    fn register(
        &self,
        interval: Duration,
        wake: WakeCallback,
    ) -> std::result::Result<WakeHandle, SyncError>;
}

/// Registration returned by a [`WakeSource`]; stops the wake on drop
#[derive(Debug)]
pub struct WakeHandle {
    task: Option<JoinHandle<()>>,
}

impl WakeHandle {
    pub const fn from_task(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for WakeHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Wake source backed by a tokio interval on the current runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioIntervalSource;

impl WakeSource for TokioIntervalSource {
    fn name(&self) -> &'static str {
        "tokio_interval"
    }

    fn register(
        &self,
        interval: Duration,
        wake: WakeCallback,
    ) -> std::result::Result<WakeHandle, SyncError> {
        if interval.is_zero() {
            return Err(SyncError::Scheduling(
                "background interval must be positive".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|error| {
            SyncError::Scheduling(format!("no async runtime for background sync: {error}"))
        })?;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                wake().await;
            }
        });
        Ok(WakeHandle::from_task(task))
    }
}

/// Wake source for hosts without background execution
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedWakeSource;

impl WakeSource for UnsupportedWakeSource {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn register(
        &self,
        _interval: Duration,
        _wake: WakeCallback,
    ) -> std::result::Result<WakeHandle, SyncError> {
        Err(SyncError::Scheduling(
            "periodic background wake is not available on this platform".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Background sync is switched off
    Disabled,
    /// A wake source is registered
    Active,
    /// Enabled, but the platform cannot wake us; sync runs in the foreground only
    ForegroundOnly,
}

impl SchedulerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Active => "active",
            Self::ForegroundOnly => "foreground_only",
        }
    }
}

struct Registration {
    state: SchedulerState,
    handle: Option<WakeHandle>,
}

/// Owns the background wake registration and the persisted enabled flag.
pub struct BackgroundScheduler {
    store: LocalStore,
    engine: SyncEngine,
    source: Arc<dyn WakeSource>,
    interval: Duration,
    registration: Mutex<Registration>,
}

impl BackgroundScheduler {
    pub fn new(
        store: LocalStore,
        engine: SyncEngine,
        source: Arc<dyn WakeSource>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            source,
            interval,
            registration: Mutex::new(Registration {
                state: SchedulerState::Disabled,
                handle: None,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Persist the flag and (un)register the wake.
    ///
    /// A platform without background support is not an error: the scheduler
    /// reports [`SchedulerState::ForegroundOnly`].
    pub async fn toggle(&self, enabled: bool) -> Result<SchedulerState> {
        self.store
            .update_settings(|settings| settings.background_sync_enabled = enabled)
            .await?;
        Ok(self.apply(enabled))
    }

    /// Re-register from the persisted flag, e.g. at startup.
    pub async fn restore(&self) -> Result<SchedulerState> {
        let enabled = self.store.settings().await?.background_sync_enabled;
        Ok(self.apply(enabled))
    }

    fn apply(&self, enabled: bool) -> SchedulerState {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !enabled {
            registration.handle = None;
            registration.state = SchedulerState::Disabled;
            tracing::info!("Background sync disabled");
            return registration.state;
        }
        if registration.handle.is_some() {
            return registration.state;
        }

        match self.source.register(self.interval, self.wake_callback()) {
            Ok(handle) => {
                registration.handle = Some(handle);
                registration.state = SchedulerState::Active;
                tracing::info!(
                    "Background sync every {}s via {}",
                    self.interval.as_secs(),
                    self.source.name()
                );
            }
            Err(error) => {
                registration.state = SchedulerState::ForegroundOnly;
                tracing::warn!("Background sync unavailable, foreground only: {error}");
            }
        }
        registration.state
    }

    fn wake_callback(&self) -> WakeCallback {
        let engine = self.engine.clone();
        Arc::new(move || {
            let engine = engine.clone();
            async move {
                match engine.perform_full_sync().await {
                    Ok(SyncOutcome::Completed(report)) => tracing::debug!(
                        "Background pass uploaded {} and downloaded {}",
                        report.uploaded,
                        report.downloaded
                    ),
                    Ok(SyncOutcome::Skipped { reason }) => {
                        tracing::debug!("Background pass skipped: {reason:?}");
                    }
                    Err(error) => tracing::warn!("Background pass failed: {error}"),
                }
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChangeCapture;
    use crate::network::NetworkMonitor;
    use crate::sync::{ConflictResolver, InMemoryBackend, RemoteWins, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(source: Arc<dyn WakeSource>) -> (BackgroundScheduler, LocalStore, InMemoryBackend) {
        let store = LocalStore::open_in_memory(&["boats".to_string()]).unwrap();
        let backend = InMemoryBackend::new();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(backend.clone()),
            NetworkMonitor::new(true),
            ConflictResolver::new(store.clone(), Arc::new(RemoteWins)),
            RetryPolicy::immediate(3),
        );
        let scheduler =
            BackgroundScheduler::new(store.clone(), engine, source, Duration::from_millis(50));
        (scheduler, store, backend)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enabled_scheduler_syncs_in_background() {
        let (scheduler, store, backend) = scheduler(Arc::new(TokioIntervalSource));
        ChangeCapture::new(store.clone())
            .insert("boats", json!({"id": "b1"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        assert_eq!(scheduler.toggle(true).await.unwrap(), SchedulerState::Active);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(backend.row("boats", "b1").is_some());
        assert!(store.settings().await.unwrap().background_sync_enabled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsupported_platform_degrades_to_foreground() {
        let (scheduler, store, _) = scheduler(Arc::new(UnsupportedWakeSource));

        let state = scheduler.toggle(true).await.unwrap();

        assert_eq!(state, SchedulerState::ForegroundOnly);
        assert!(store.settings().await.unwrap().background_sync_enabled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disable_and_restore() {
        let (scheduler, store, _) = scheduler(Arc::new(TokioIntervalSource));
        scheduler.toggle(true).await.unwrap();

        assert_eq!(scheduler.toggle(false).await.unwrap(), SchedulerState::Disabled);
        assert!(!store.settings().await.unwrap().background_sync_enabled);
        assert_eq!(scheduler.restore().await.unwrap(), SchedulerState::Disabled);

        store
            .update_settings(|settings| settings.background_sync_enabled = true)
            .await
            .unwrap();
        assert_eq!(scheduler.restore().await.unwrap(), SchedulerState::Active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_handle_stops_wakes() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&wakes);
        let handle = TokioIntervalSource
            .register(
                Duration::from_millis(20),
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {}.boxed()
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let seen = wakes.load(Ordering::SeqCst);
        assert!(seen > 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(wakes.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn register_outside_runtime_fails() {
        let result = TokioIntervalSource.register(Duration::from_secs(1), Arc::new(|| async {}.boxed()));
        assert!(matches!(result, Err(SyncError::Scheduling(_))));
    }
}
