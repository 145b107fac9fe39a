//! # cartsync agent
//!
//! Localhost sidecar that owns the offline cart queue and interaction
//! batching for a storefront client. The client posts cart adds and
//! interaction events here instead of to the backend; the agent persists
//! them, replays them against the storefront API when the connection allows
//! and streams the results back as Server-Sent Events.
//!
//! This library is used by both the binary and integration tests.
//!
//! ```text
//! ┌──────────────┐  HTTP / SSE   ┌──────────────────────┐  HTTPS  ┌────────────┐
//! │  storefront  │ ────────────▶ │    cartsync-agent    │ ──────▶ │ storefront │
//! │    client    │ ◀──────────── │  routes · probe · FS │         │    API     │
//! └──────────────┘               └──────────────────────┘         └────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::sync::Arc;

use cartsync_core::{
    CartSync, ConnectivityMonitor, ConnectivityState, DurableBuffer, FileStore, InteractionTracker,
    InvalidationBus, KeyValueStore, MemoryStore, NotificationHub, RemoteApi, ReplayEngine,
    RetryPolicy, StorageError, StoreDrainLock, Subscription, DEFAULT_LOCK_TTL,
};

pub mod client;
pub mod config;
pub mod events;
pub mod health;
pub mod metrics;
pub mod probe;
pub mod routes;

pub use client::{ClientConfig, ClientError, StorefrontClient};
pub use config::{AgentConfig, CliArgs};
pub use probe::{spawn_reachability_probe, ProbeHandle, Reachability};

use crate::metrics::{DrainMetrics, MeteredNotifier, MeteredRemote};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Offline-aware cart flow.
    pub cart: Arc<CartSync>,
    /// Interaction batching.
    pub tracker: Arc<InteractionTracker>,
    /// Client connectivity.
    pub monitor: ConnectivityMonitor,
    /// Toast notifications.
    pub notifications: NotificationHub,
    /// Cache invalidation tags fired after cart syncs.
    pub invalidations: Arc<InvalidationBus>,
    _connectivity: Arc<Subscription>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cart", &self.cart)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

/// Open the queue store named by the configuration.
///
/// # Errors
///
/// Returns an error if the data directory cannot be created.
pub fn open_store(config: &AgentConfig) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match &config.data_dir {
        Some(dir) => {
            let store = FileStore::new(dir)?;
            tracing::info!(data_dir = %dir.display(), "Using file-backed queue");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No data directory configured, queued cart adds will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

impl AppState {
    /// Wire the queue, engines and coordinators together.
    ///
    /// `remote` is wrapped for metrics here. Must be called inside a tokio
    /// runtime: the tracker timer and the reconnect listener spawn tasks.
    pub async fn build(
        config: &AgentConfig,
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let remote: Arc<dyn RemoteApi> = Arc::new(MeteredRemote::new(remote));
        let notifications = NotificationHub::default();
        let notifier = Arc::new(MeteredNotifier::new(Arc::new(notifications.clone())));
        let invalidations = Arc::new(InvalidationBus::new());

        let buffer = Arc::new(DurableBuffer::open(Arc::clone(&store)).await);
        if buffer.is_degraded().await {
            metrics::record_storage_degraded();
        }
        metrics::set_pending_records(buffer.len().await);

        let cart_engine = ReplayEngine::new(Arc::clone(&remote), RetryPolicy::cart())
            .with_call_timeout(config.request_timeout)
            .with_invalidator(invalidations.clone())
            .with_notifier(notifier.clone())
            .with_observer(Arc::new(DrainMetrics))
            .with_lock(Arc::new(StoreDrainLock::new(store)), DEFAULT_LOCK_TTL);

        let analytics_engine = ReplayEngine::new(remote, RetryPolicy::analytics())
            .with_call_timeout(config.request_timeout)
            .with_notifier(notifier);

        let monitor = ConnectivityMonitor::new(ConnectivityState::from_online(config.start_online));
        metrics::set_connectivity(config.start_online);

        let cart = CartSync::new(buffer, Arc::new(cart_engine), monitor.clone());
        let connectivity = Arc::new(cart.attach());
        let tracker = Arc::new(InteractionTracker::new(
            Arc::new(analytics_engine),
            config.tracker,
        ));

        Self {
            cart,
            tracker,
            monitor,
            notifications,
            invalidations,
            _connectivity: connectivity,
        }
    }

    /// Final flush and background task teardown.
    pub async fn shutdown(&self) {
        let report = self.tracker.dispose().await;
        tracing::info!(?report, "Final interaction flush");
        self.cart.shutdown();
    }
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
