//! Connectivity monitoring.
//!
//! [`ConnectivityMonitor`] holds the current online/offline state and turns
//! raw network signals into transitions. Listeners registered with
//! [`ConnectivityMonitor::on_online`] run exactly once per offline -> online
//! transition, however many duplicate "online" signals arrive.
//!
//! Registration returns a [`Subscription`]; dropping it unregisters the
//! listener, so an owner that is torn down and rebuilt does not leak
//! callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Network status as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// The network is reachable.
    Online,
    /// The network is not reachable.
    Offline,
}

impl ConnectivityState {
    /// Map a boolean `online` flag to a state.
    #[must_use]
    pub const fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Whether this state is online.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// A change between connectivity states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityEvent {
    /// Offline -> online.
    WentOnline,
    /// Online -> offline.
    WentOffline,
}

type Listener = Arc<dyn Fn(ConnectivityEvent) + Send + Sync>;

struct Inner {
    state: watch::Sender<ConnectivityState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Observes connectivity transitions and notifies registered listeners.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state.
    #[must_use]
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                state,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    /// Whether the monitor currently reports online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Feed a network signal into the monitor.
    ///
    /// Returns the transition it caused, or `None` if the state did not
    /// change. Listeners run on the calling thread before this returns.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let next = ConnectivityState::from_online(online);
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return None;
        }

        let event = if online {
            ConnectivityEvent::WentOnline
        } else {
            ConnectivityEvent::WentOffline
        };
        tracing::info!(?event, "Connectivity changed");
        self.dispatch(event);
        Some(event)
    }

    /// Watch the raw state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Register a listener for every transition.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn on_transition<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectivityEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Register a listener that runs once per offline -> online transition.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn on_online<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_transition(move |event| {
            if event == ConnectivityEvent::WentOnline {
                listener();
            }
        })
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn dispatch(&self, event: ConnectivityEvent) {
        // Snapshot so listeners may (un)register without deadlocking.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(?event, "Connectivity listener panicked");
            }
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

/// Registration handle. Dropping it unregisters the listener.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    monitor: Weak<Inner>,
}

impl Subscription {
    /// Unregister the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
