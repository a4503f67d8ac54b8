//! Sync status aggregation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::network::NetworkMonitor;
use crate::services::LocalStore;
use crate::state::{Health, SyncState};
use crate::sync::RetryPolicy;
use crate::Result;

/// Single-flight flag shared by the engine and status readers
#[derive(Debug, Clone, Default)]
pub struct SyncActivity {
    running: Arc<AtomicBool>,
}

impl SyncActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the worker slot; `None` while another pass holds it.
    pub fn try_begin(&self) -> Option<ActivityGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ActivityGuard {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Releases the worker slot when dropped
#[derive(Debug)]
pub struct ActivityGuard {
    running: Arc<AtomicBool>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Point-in-time view for status indicators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusSnapshot {
    pub state: SyncState,
    pub is_online: bool,
    pub is_syncing: bool,
    /// Completion time of the last successful pass (Unix ms)
    pub last_sync: Option<i64>,
    pub pending_changes: usize,
    /// Changes that stopped auto-retrying
    pub needs_attention: usize,
    pub unresolved_conflicts: usize,
    pub error: Option<String>,
    pub health: Health,
}

/// Builds [`SyncStatusSnapshot`]s from the store, the monitor and the engine
#[derive(Clone)]
pub struct StatusAggregator {
    store: LocalStore,
    monitor: NetworkMonitor,
    activity: SyncActivity,
    retry: RetryPolicy,
}

impl StatusAggregator {
    pub const fn new(
        store: LocalStore,
        monitor: NetworkMonitor,
        activity: SyncActivity,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            monitor,
            activity,
            retry,
        }
    }

    pub async fn snapshot(&self) -> Result<SyncStatusSnapshot> {
        let settings = self.store.settings().await?;
        let pending_changes = self.store.pending_count().await?;
        let needs_attention = self.store.exhausted_count(self.retry.max_attempts).await?;
        let unresolved_conflicts = self.store.unresolved_conflict_count().await?;
        let is_online = self.monitor.is_online();
        let is_syncing = self.activity.is_running();
        let health = self.store.health();

        let state = if is_syncing {
            SyncState::Syncing
        } else if !is_online {
            SyncState::Offline
        } else if settings.last_sync_error.is_some() || health == Health::Critical {
            SyncState::Error
        } else {
            SyncState::Synced
        };

        Ok(SyncStatusSnapshot {
            state,
            is_online,
            is_syncing,
            last_sync: settings.last_sync_at,
            pending_changes,
            needs_attention,
            unresolved_conflicts,
            error: settings.last_sync_error,
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_is_single_flight() {
        let activity = SyncActivity::new();
        let guard = activity.try_begin().unwrap();
        assert!(activity.is_running());
        assert!(activity.try_begin().is_none());

        drop(guard);
        assert!(!activity.is_running());
        assert!(activity.try_begin().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_reports_offline_and_errors() {
        let store = LocalStore::open_in_memory(&["boats".to_string()]).unwrap();
        let monitor = NetworkMonitor::new(false);
        let aggregator = StatusAggregator::new(
            store.clone(),
            monitor.clone(),
            SyncActivity::new(),
            RetryPolicy::default(),
        );

        let snapshot = aggregator.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SyncState::Offline);
        assert_eq!(snapshot.pending_changes, 0);
        assert_eq!(snapshot.health, Health::Healthy);

        monitor.set_online(true);
        store
            .update_settings(|settings| settings.last_sync_error = Some("HTTP 503".to_string()))
            .await
            .unwrap();

        let snapshot = aggregator.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SyncState::Error);
        assert_eq!(snapshot.error.as_deref(), Some("HTTP 503"));
    }
}
