//! Connectivity tracking and reconnect triggering

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::sync::{RemoteBackend, SyncError};
use crate::Result;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;
type Listeners = Mutex<Vec<(u64, Listener)>>;

/// Shared online/offline flag with transition listeners.
///
/// Owned by the composition root and handed to whoever needs it; listeners
/// only fire when the flag actually changes.
#[derive(Clone)]
pub struct NetworkMonitor {
    online: Arc<AtomicBool>,
    listeners: Arc<Listeners>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(initially_online)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update connectivity. Returns `true` when this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return false;
        }

        tracing::info!(
            "Network is now {}",
            if online { "online" } else { "offline" }
        );
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(online);
        }
        true
    }

    /// Call `listener` on every transition until the subscription is dropped.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle detaching a monitor listener on [`Subscription::unsubscribe`] or drop
#[must_use = "dropping a subscription detaches the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Runs a callback once per reconnect, after the connection stayed up for
/// the debounce window.
///
/// Transitions inside the window collapse into a single call.
pub struct ReconnectTrigger {
    generation: Arc<AtomicU64>,
    _subscription: Subscription,
}

impl ReconnectTrigger {
    /// Attach to `monitor`. Must be called from within a tokio runtime.
    pub fn install<F, Fut>(monitor: &NetworkMonitor, debounce: Duration, on_reconnect: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|error| {
            SyncError::Scheduling(format!("reconnect trigger needs a tokio runtime: {error}"))
        })?;
        let generation = Arc::new(AtomicU64::new(0));
        let on_reconnect = Arc::new(on_reconnect);
        let online = Arc::clone(&monitor.online);

        let listener_generation = Arc::clone(&generation);
        let subscription = monitor.subscribe(move |is_online| {
            let ticket = listener_generation.fetch_add(1, Ordering::SeqCst) + 1;
            if !is_online {
                return;
            }

            let generation = Arc::clone(&listener_generation);
            let online = Arc::clone(&online);
            let on_reconnect = Arc::clone(&on_reconnect);
            runtime.spawn(async move {
                tokio::time::sleep(debounce).await;
                if generation.load(Ordering::SeqCst) == ticket && online.load(Ordering::SeqCst) {
                    tracing::debug!("Reconnect settled; starting sync pass");
                    on_reconnect().await;
                }
            });
        });

        Ok(Self {
            generation,
            _subscription: subscription,
        })
    }

    /// Transitions observed so far.
    pub fn transitions(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Ping the backend every `interval` and feed the result into `monitor`.
pub fn spawn_probe(
    monitor: NetworkMonitor,
    backend: Arc<dyn RemoteBackend>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = match backend.ping().await {
                Ok(()) => true,
                Err(error) => {
                    tracing::debug!("Connectivity probe failed: {error}");
                    false
                }
            };
            monitor.set_online(reachable);
        }
    })
}
