//! Replay engine.
//!
//! Drains pending mutations against the remote API. One engine type serves
//! both variants, parametrized by a [`RetryPolicy`]:
//!
//! - [`ReplayEngine::drain`] replays a [`DurableBuffer`] record by record in
//!   FIFO order and halts on the first transient failure, so a later record
//!   never lands before an earlier one.
//! - [`ReplayEngine::replay_batch`] sends a whole batch and retries the batch
//!   with linear backoff until the policy is exhausted.
//!
//! Only one drain runs at a time per engine. A second trigger while a drain
//! is in flight returns [`DrainStatus::Skipped`] without touching the
//! network, and asks the running drain to take one more pass before it
//! exits so records appended after its snapshot are not left behind.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::buffer::DurableBuffer;
use crate::error::SyncError;
use crate::invalidation::{CacheInvalidator, CART_TAGS};
use crate::lock::{DrainLock, DEFAULT_LOCK_TTL};
use crate::mutation::{InteractionPayload, MutationPayload, PendingMutation, RecordId};
use crate::notify::{Notification, Notifier};
use crate::remote::{RemoteApi, RemoteError};
use crate::retry::RetryPolicy;

/// Default deadline for a single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// Non-blocking "at most one at a time" flag.
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    /// Create an idle flag.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark the operation as started, or return `None` if one is already
    /// running. The returned guard clears the flag when dropped.
    #[must_use]
    pub fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard(&self.0))
    }

    /// Whether an operation is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Clears an [`InFlight`] flag on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// How a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    /// Every record in the snapshot was synced or dropped.
    Completed,
    /// A transient failure stopped the pass; the rest stays queued.
    Halted,
    /// Nothing was queued.
    Empty,
    /// Another drain holds the guard or the cross-process lock, or the
    /// lock was lost partway through the pass.
    Skipped,
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// How the pass ended.
    pub status: DrainStatus,
    /// Records delivered and removed, in order.
    pub synced: Vec<RecordId>,
    /// Records the server refused; removed.
    pub rejected: Vec<RecordId>,
    /// Records dropped because the retry policy ran out.
    pub dropped: Vec<RecordId>,
    /// Records still queued after the pass.
    pub remaining: usize,
    /// Failure that halted the pass.
    #[serde(skip)]
    pub error: Option<SyncError>,
    /// Attempt count of the record that halted the pass.
    pub halted_attempts: u32,
}

impl DrainReport {
    fn with_status(status: DrainStatus) -> Self {
        Self {
            status,
            synced: Vec::new(),
            rejected: Vec::new(),
            dropped: Vec::new(),
            remaining: 0,
            error: None,
            halted_attempts: 0,
        }
    }

    /// Whether the drain was a no-op because another was in progress.
    #[must_use]
    pub fn was_skipped(&self) -> bool {
        self.status == DrainStatus::Skipped
    }

    /// Fold a follow-up pass into this report.
    fn absorb(&mut self, next: Self) {
        self.synced.extend(next.synced);
        self.rejected.extend(next.rejected);
        self.dropped.extend(next.dropped);
        self.remaining = next.remaining;
        if next.status != DrainStatus::Empty {
            self.status = next.status;
            self.error = next.error;
            self.halted_attempts = next.halted_attempts;
        }
    }
}

/// Result of sending one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The server accepted the batch.
    Delivered {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// The server refused the batch; it was discarded without retrying.
    Rejected {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
    },
    /// Every allowed attempt failed; the batch was discarded.
    Dropped {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        error: SyncError,
    },
}

impl BatchOutcome {
    /// Whether the batch reached the server.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Sees the report of every [`ReplayEngine::drain`] call, skipped ones
/// included.
pub trait DrainObserver: Send + Sync {
    /// Called once per `drain` call with its final report.
    fn on_drain(&self, report: &DrainReport);
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Replays pending mutations against a [`RemoteApi`].
pub struct ReplayEngine {
    remote: Arc<dyn RemoteApi>,
    policy: RetryPolicy,
    call_timeout: Duration,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
    invalidate_tags: Vec<String>,
    notifier: Option<Arc<dyn Notifier>>,
    observer: Option<Arc<dyn DrainObserver>>,
    lock: Option<Arc<dyn DrainLock>>,
    lock_ttl: Duration,
    owner: String,
    in_flight: InFlight,
    rerun: AtomicBool,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .field("owner", &self.owner)
            .field("draining", &self.in_flight.is_active())
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    /// Create an engine with the given policy, the default call timeout,
    /// and no invalidator, notifier or cross-process lock.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteApi>, policy: RetryPolicy) -> Self {
        Self {
            remote,
            policy,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            invalidator: None,
            invalidate_tags: CART_TAGS.iter().map(ToString::to_string).collect(),
            notifier: None,
            observer: None,
            lock: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            owner: uuid::Uuid::new_v4().to_string(),
            in_flight: InFlight::new(),
            rerun: AtomicBool::new(false),
        }
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Invalidate the cart tags after every drain that synced something.
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Replace the tags invalidated after a successful drain.
    #[must_use]
    pub fn with_invalidate_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Publish sync notifications.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Report every drain to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DrainObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Coordinate drains with other processes through `lock`.
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn DrainLock>, ttl: Duration) -> Self {
        self.lock = Some(lock);
        self.lock_ttl = ttl;
        self
    }

    /// The retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a drain is currently running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.in_flight.is_active()
    }

    /// Drain `buffer` in FIFO order.
    ///
    /// Never returns an error: failures are classified into the report. A
    /// trigger that arrives while a pass is running gets
    /// [`DrainStatus::Skipped`]; the running drain then takes another pass
    /// over a fresh snapshot before returning, unless its pass halted.
    pub async fn drain(&self, buffer: &DurableBuffer) -> DrainReport {
        // Raised before the guard check so a running drain that is about to
        // finish cannot miss it.
        self.rerun.store(true, Ordering::SeqCst);
        let mut report: Option<DrainReport> = None;

        loop {
            let Some(guard) = self.in_flight.try_begin() else {
                break;
            };
            self.rerun.store(false, Ordering::SeqCst);
            let pass = self.drain_pass(buffer).await;
            drop(guard);

            let settled = matches!(pass.status, DrainStatus::Completed | DrainStatus::Empty);
            report = Some(match report.take() {
                Some(mut total) => {
                    total.absorb(pass);
                    total
                }
                None => pass,
            });
            if !settled || !self.rerun.load(Ordering::SeqCst) {
                break;
            }
            tracing::debug!("Drain requested during pass, draining again");
        }

        let report = report.unwrap_or_else(|| {
            tracing::debug!("Drain already in progress, skipping");
            DrainReport::with_status(DrainStatus::Skipped)
        });
        if let Some(observer) = &self.observer {
            observer.on_drain(&report);
        }
        report
    }

    async fn drain_pass(&self, buffer: &DurableBuffer) -> DrainReport {
        if !self.hold_lease().await {
            tracing::debug!(owner = %self.owner, "Drain lock held by another process, skipping");
            return DrainReport::with_status(DrainStatus::Skipped);
        }

        let report = self.drain_locked(buffer).await;

        if let Some(lock) = &self.lock {
            lock.release(&self.owner).await;
        }
        report
    }

    /// Take or extend the cross-process lease. True when there is no lock.
    async fn hold_lease(&self) -> bool {
        match &self.lock {
            Some(lock) => lock.try_acquire(&self.owner, self.lock_ttl).await,
            None => true,
        }
    }

    async fn drain_locked(&self, buffer: &DurableBuffer) -> DrainReport {
        let snapshot = buffer.read_all().await;
        if snapshot.is_empty() {
            return DrainReport::with_status(DrainStatus::Empty);
        }

        tracing::debug!(pending = snapshot.len(), "Draining buffer");
        let mut report = DrainReport::with_status(DrainStatus::Completed);

        for (index, record) in snapshot.into_iter().enumerate() {
            let record_id = record.id();

            if index > 0 && !self.hold_lease().await {
                tracing::warn!(
                    owner = %self.owner,
                    record_id = %record_id,
                    "Drain lock lost, stopping pass"
                );
                report.status = DrainStatus::Skipped;
                break;
            }

            if self.policy.is_exhausted(record.attempts()) {
                tracing::warn!(
                    record_id = %record_id,
                    attempts = record.attempts(),
                    "Dropping record after retry ceiling"
                );
                buffer.remove(record_id).await;
                report.dropped.push(record_id);
                continue;
            }

            match self.dispatch(&record).await {
                Ok(()) => {
                    buffer.remove(record_id).await;
                    tracing::debug!(record_id = %record_id, kind = %record.kind(), "Record synced");
                    report.synced.push(record_id);
                }
                Err(SyncError::ServerRejected { status, message }) => {
                    tracing::warn!(
                        record_id = %record_id,
                        status,
                        message = %message,
                        "Server rejected record, dropping"
                    );
                    buffer.remove(record_id).await;
                    report.rejected.push(record_id);
                    self.notify(Notification::ItemRejected {
                        record_id,
                        variant_id: record.as_cart_add().map(|p| p.variant_id),
                        reason: message,
                    });
                }
                Err(error) => {
                    let attempts = buffer
                        .record_attempt(record_id)
                        .await
                        .unwrap_or_else(|| record.attempts().saturating_add(1));
                    tracing::warn!(
                        record_id = %record_id,
                        attempts,
                        error = %error,
                        "Replay halted, remaining records stay queued"
                    );
                    report.status = DrainStatus::Halted;
                    report.halted_attempts = attempts;
                    report.error = Some(error);
                    break;
                }
            }
        }

        report.remaining = buffer.len().await;

        if !report.synced.is_empty() {
            if let Some(invalidator) = &self.invalidator {
                for tag in &self.invalidate_tags {
                    invalidator.invalidate(tag);
                }
            }
        }

        let synced = report.synced.len();
        if synced > 0 {
            tracing::info!(synced, remaining = report.remaining, "Offline cart synced");
            self.notify(Notification::CartSynced { count: synced });
        } else if report.status == DrainStatus::Halted && report.rejected.is_empty() {
            let message = report
                .error
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string);
            self.notify(Notification::SyncFailed { message });
        }

        report
    }

    /// Send `batch` as one unit, retrying per the engine's policy.
    pub async fn replay_batch(&self, batch: &[PendingMutation]) -> BatchOutcome {
        self.replay_batch_with(batch, &self.policy).await
    }

    /// Send `batch` once with no retries.
    pub async fn replay_batch_once(&self, batch: &[PendingMutation]) -> BatchOutcome {
        self.replay_batch_with(batch, &RetryPolicy::single_attempt())
            .await
    }

    async fn replay_batch_with(
        &self,
        batch: &[PendingMutation],
        policy: &RetryPolicy,
    ) -> BatchOutcome {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.dispatch_batch(batch).await {
                Ok(()) => {
                    tracing::debug!(events = batch.len(), attempt, "Batch delivered");
                    return BatchOutcome::Delivered { attempts: attempt };
                }
                Err(SyncError::ServerRejected { status, message }) => {
                    tracing::warn!(
                        events = batch.len(),
                        status,
                        message = %message,
                        "Server rejected batch, discarding"
                    );
                    return BatchOutcome::Rejected { status, message };
                }
                Err(error) => {
                    if policy.is_exhausted(attempt) {
                        let ceiling = SyncError::RetryCeilingExceeded { attempts: attempt };
                        tracing::warn!(
                            events = batch.len(),
                            attempts = attempt,
                            error = %error,
                            "{ceiling}, discarding batch"
                        );
                        self.notify(Notification::BatchDropped {
                            events: batch.len(),
                            attempts: attempt,
                        });
                        return BatchOutcome::Dropped {
                            attempts: attempt,
                            error,
                        };
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        events = batch.len(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Issue the remote call bound to a record's kind.
    async fn dispatch(&self, record: &PendingMutation) -> Result<(), SyncError> {
        match record.payload() {
            MutationPayload::CartAdd(item) => self
                .with_deadline(self.remote.add_cart_item(item))
                .await
                .map(|_| ()),
            MutationPayload::InteractionEvent(event) => {
                self.with_deadline(self.remote.submit_interactions(std::slice::from_ref(event)))
                    .await
            }
        }
    }

    /// Cart records in a batch go out one by one in order, then all
    /// interaction events in a single call.
    async fn dispatch_batch(&self, batch: &[PendingMutation]) -> Result<(), SyncError> {
        let mut events: Vec<InteractionPayload> = Vec::new();
        for record in batch {
            match record.payload() {
                MutationPayload::CartAdd(_) => self.dispatch(record).await?,
                MutationPayload::InteractionEvent(event) => events.push(event.clone()),
            }
        }
        if events.is_empty() {
            return Ok(());
        }
        self.with_deadline(self.remote.submit_interactions(&events))
            .await
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>> + Send,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::NetworkUnavailable(format!(
                "request timed out after {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notification);
        }
    }
}
