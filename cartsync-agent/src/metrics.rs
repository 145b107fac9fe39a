//! Prometheus metrics for cartsync-agent.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.
//! Remote calls and sync notifications are metered by wrapping the
//! [`RemoteApi`] and [`Notifier`] handed to the replay engines; drains are
//! metered by a [`DrainObserver`] on the cart engine.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cartsync_core::{
    CartAddPayload, CartItem, DrainObserver, DrainReport, DrainStatus, InteractionPayload,
    Notification, Notifier, RemoteApi, RemoteError,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Metric names as constants for consistency
const REMOTE_CALLS_TOTAL: &str = "cartsync_remote_calls_total";
const REMOTE_CALL_DURATION: &str = "cartsync_remote_call_duration_seconds";
const RECORDS_SYNCED_TOTAL: &str = "cartsync_records_synced_total";
const RECORDS_REJECTED_TOTAL: &str = "cartsync_records_rejected_total";
const RECORDS_DROPPED_TOTAL: &str = "cartsync_records_dropped_total";
const DRAINS_SKIPPED_TOTAL: &str = "cartsync_drains_skipped_total";
const BATCHES_TOTAL: &str = "cartsync_interaction_batches_total";
const STORAGE_DEGRADED_TOTAL: &str = "cartsync_storage_degraded_total";
const PENDING_RECORDS: &str = "cartsync_pending_records";
const CONNECTIVITY_STATE: &str = "cartsync_connectivity_online";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a storefront call.
///
/// # Arguments
///
/// * `endpoint` - "cart_items" or "interaction_batch"
/// * `outcome` - "ok", "rejected" or "unavailable"
/// * `duration_secs` - Call duration in seconds
pub fn record_remote_call(endpoint: &'static str, outcome: &'static str, duration_secs: f64) {
    counter!(REMOTE_CALLS_TOTAL, "endpoint" => endpoint, "outcome" => outcome).increment(1);
    histogram!(REMOTE_CALL_DURATION, "endpoint" => endpoint).record(duration_secs);
}

/// Record cart records delivered by a drain.
pub fn record_records_synced(count: usize) {
    counter!(RECORDS_SYNCED_TOTAL).increment(count as u64);
}

/// Record a cart record the server refused.
pub fn record_record_rejected() {
    counter!(RECORDS_REJECTED_TOTAL).increment(1);
}

/// Record records dropped after exhausting retries.
///
/// # Arguments
///
/// * `kind` - "cart_add" or "interaction_event"
pub fn record_records_dropped(kind: &'static str, count: usize) {
    counter!(RECORDS_DROPPED_TOTAL, "kind" => kind).increment(count as u64);
}

/// Record a drain request that found another drain running or the drain
/// lock held elsewhere.
pub fn record_drain_skipped() {
    counter!(DRAINS_SKIPPED_TOTAL).increment(1);
}

/// Record the fate of an interaction batch.
///
/// # Arguments
///
/// * `outcome` - "delivered", "rejected" or "dropped"
pub fn record_batch(outcome: &'static str) {
    counter!(BATCHES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an append that could not reach durable storage.
pub fn record_storage_degraded() {
    counter!(STORAGE_DEGRADED_TOTAL).increment(1);
}

/// Update the pending cart record gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_pending_records(count: usize) {
    gauge!(PENDING_RECORDS).set(count as f64);
}

/// Update the connectivity gauge (1 online, 0 offline).
pub fn set_connectivity(online: bool) {
    gauge!(CONNECTIVITY_STATE).set(if online { 1.0 } else { 0.0 });
}

fn outcome_label<T>(result: &Result<T, RemoteError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(RemoteError::ServerRejected { .. }) => "rejected",
        Err(RemoteError::NetworkUnavailable(_)) => "unavailable",
    }
}

// ---------------------------------------------------------------------------
// Metered wrappers
// ---------------------------------------------------------------------------

/// [`RemoteApi`] decorator that records every call.
pub struct MeteredRemote {
    inner: Arc<dyn RemoteApi>,
}

impl MeteredRemote {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn RemoteApi>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RemoteApi for MeteredRemote {
    async fn add_cart_item(&self, item: &CartAddPayload) -> Result<CartItem, RemoteError> {
        let start = Instant::now();
        let result = self.inner.add_cart_item(item).await;
        record_remote_call(
            "cart_items",
            outcome_label(&result),
            start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn submit_interactions(&self, events: &[InteractionPayload]) -> Result<(), RemoteError> {
        let start = Instant::now();
        let result = self.inner.submit_interactions(events).await;
        record_remote_call(
            "interaction_batch",
            outcome_label(&result),
            start.elapsed().as_secs_f64(),
        );
        result
    }
}

/// [`Notifier`] decorator that counts notifications before forwarding them.
pub struct MeteredNotifier {
    inner: Arc<dyn Notifier>,
}

impl MeteredNotifier {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }
}

impl Notifier for MeteredNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::CartSynced { count } => record_records_synced(*count),
            Notification::ItemRejected { .. } => record_record_rejected(),
            Notification::BatchDropped { events, .. } => {
                record_batch("dropped");
                record_records_dropped("interaction_event", *events);
            }
            Notification::SyncFailed { .. } => {}
        }
        self.inner.notify(notification);
    }
}

/// Counts skipped drains and tracks the pending gauge for every cart drain,
/// whether it came from a request, a reconnect or a scheduled retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainMetrics;

impl DrainObserver for DrainMetrics {
    fn on_drain(&self, report: &DrainReport) {
        if report.status == DrainStatus::Skipped && report.synced.is_empty() {
            record_drain_skipped();
        } else {
            set_pending_records(report.remaining);
        }
    }
}
