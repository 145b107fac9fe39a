//! Interaction tracker (flush scheduler).
//!
//! Coalesces bursts of tracked interaction events into time-windowed batches
//! sent through [`ReplayEngine::replay_batch`]. Each `track` call restarts
//! the flush window. A background timer task owns the window; forced flushes
//! (page hidden, unload, full batch, dispose) bypass it.
//!
//! ```text
//! track() ──▶ pending ──(window elapsed | hidden | unload | full)──▶ flush
//!                                                                      │
//!                                                  ReplayEngine::replay_batch
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lifecycle::PageSignal;
use crate::mutation::{InteractionPayload, PendingMutation};
use crate::replay::{BatchOutcome, InFlight, ReplayEngine};

/// Flush scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Quiet period after the last tracked event before a flush.
    pub window: Duration,
    /// Pending events that trigger an immediate flush.
    pub max_batch_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            max_batch_size: 50,
        }
    }
}

/// Result of a flush request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushReport {
    /// A batch was handed to the replay engine.
    Sent {
        /// Events in the batch.
        events: usize,
        /// What happened to it.
        outcome: BatchOutcome,
    },
    /// Nothing was pending.
    Empty,
    /// Another flush was already in flight.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    Retrying,
    SingleAttempt,
}

struct Shared {
    engine: Arc<ReplayEngine>,
    config: TrackerConfig,
    pending: Mutex<Vec<PendingMutation>>,
    deadline: watch::Sender<Option<Instant>>,
    in_flight: InFlight,
}

impl Shared {
    /// Flush whatever is pending.
    ///
    /// Events still pending once the flush is over (tracked while it ran, or
    /// left behind by a skipped flush) get a fresh window if none is armed.
    async fn flush(&self, mode: FlushMode) -> FlushReport {
        let report = self.flush_pending(mode).await;
        self.rearm_if_pending();
        report
    }

    async fn flush_pending(&self, mode: FlushMode) -> FlushReport {
        let Some(_guard) = self.in_flight.try_begin() else {
            tracing::debug!("Flush already in flight, skipping");
            return FlushReport::Skipped;
        };

        let batch = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        if batch.is_empty() {
            return FlushReport::Empty;
        }

        let events = batch.len();
        tracing::debug!(events, ?mode, "Flushing interaction batch");
        let outcome = match mode {
            FlushMode::Retrying => self.engine.replay_batch(&batch).await,
            FlushMode::SingleAttempt => self.engine.replay_batch_once(&batch).await,
        };
        FlushReport::Sent { events, outcome }
    }

    fn rearm_if_pending(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        if pending == 0 {
            return;
        }
        let window = self.config.window;
        let armed = self.deadline.send_if_modified(|deadline| {
            if deadline.is_some() {
                return false;
            }
            *deadline = Some(Instant::now() + window);
            true
        });
        if armed {
            tracing::debug!(pending, "Events left after flush, window re-armed");
        }
    }

    async fn run_timer(self: Arc<Self>) {
        let mut rx = self.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                None => {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {
                            self.deadline.send_replace(None);
                            self.flush(FlushMode::Retrying).await;
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Batches interaction events for the analytics endpoint.
///
/// Must be created inside a tokio runtime; it spawns its timer task there.
pub struct InteractionTracker {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for InteractionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionTracker")
            .field("config", &self.shared.config)
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl InteractionTracker {
    /// Create a tracker sending through `engine` (normally built with
    /// [`RetryPolicy::analytics`](crate::RetryPolicy::analytics)).
    #[must_use]
    pub fn new(engine: Arc<ReplayEngine>, config: TrackerConfig) -> Self {
        let (deadline, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            engine,
            config,
            pending: Mutex::new(Vec::new()),
            deadline,
            in_flight: InFlight::new(),
        });
        let timer = tokio::spawn(Arc::clone(&shared).run_timer());
        Self {
            shared,
            timer: Mutex::new(Some(timer)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Buffer an event and restart the flush window.
    ///
    /// Returns false if the tracker has been disposed.
    pub fn track(&self, event: InteractionPayload) -> bool {
        if self.is_disposed() {
            tracing::debug!("Tracker disposed, ignoring event");
            return false;
        }

        let pending = {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.push(PendingMutation::interaction(event));
            pending.len()
        };

        if pending >= self.shared.config.max_batch_size {
            tracing::debug!(pending, "Batch full, flushing early");
            self.shared.deadline.send_replace(None);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.flush(FlushMode::Retrying).await;
            });
        } else {
            self.shared
                .deadline
                .send_replace(Some(Instant::now() + self.shared.config.window));
        }
        true
    }

    /// Events waiting for the next flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Flush now, retrying per the engine's policy.
    pub async fn flush(&self) -> FlushReport {
        self.shared.deadline.send_replace(None);
        self.shared.flush(FlushMode::Retrying).await
    }

    /// React to a page lifecycle signal. Returns the flush report if the
    /// signal forced one.
    pub async fn on_page_signal(&self, signal: PageSignal) -> Option<FlushReport> {
        if !signal.forces_flush() {
            return None;
        }
        tracing::debug!(?signal, "Page signal forces flush");
        self.shared.deadline.send_replace(None);
        let mode = if signal.is_terminal() {
            FlushMode::SingleAttempt
        } else {
            FlushMode::Retrying
        };
        Some(self.shared.flush(mode).await)
    }

    /// Stop the timer and make one final delivery attempt.
    ///
    /// Later `track` calls are ignored.
    pub async fn dispose(&self) -> FlushReport {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return FlushReport::Empty;
        }
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        self.shared.deadline.send_replace(None);
        let report = self.shared.flush(FlushMode::SingleAttempt).await;
        tracing::info!(?report, "Interaction tracker disposed");
        report
    }
}

impl Drop for InteractionTracker {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Visibility;
    use crate::mutation::CartAddPayload;
    use crate::remote::{CartItem, RemoteApi, RemoteError};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;

    #[derive(Default)]
    struct BatchRecorder {
        fail: bool,
        /// Calls to fail before succeeding.
        failures: std::sync::atomic::AtomicUsize,
        delay: Option<Duration>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl BatchRecorder {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl RemoteApi for BatchRecorder {
        async fn add_cart_item(&self, _: &CartAddPayload) -> Result<CartItem, RemoteError> {
            Ok(CartItem::default())
        }

        async fn submit_interactions(
            &self,
            batch: &[InteractionPayload],
        ) -> Result<(), RemoteError> {
            self.batches
                .lock()
                .expect("lock")
                .push(batch.iter().map(|e| e.interaction_type.clone()).collect());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted_failure = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if self.fail || scripted_failure {
                Err(RemoteError::NetworkUnavailable("offline".into()))
            } else {
                Ok(())
            }
        }
    }

    fn tracker_with(remote: Arc<BatchRecorder>, config: TrackerConfig) -> InteractionTracker {
        let engine = Arc::new(ReplayEngine::new(remote, RetryPolicy::analytics()));
        InteractionTracker::new(engine, config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_one_batch() {
        let remote = Arc::new(BatchRecorder::default());
        let tracker = tracker_with(remote.clone(), TrackerConfig::default());

        tracker.track(InteractionPayload::new("view"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.track(InteractionPayload::new("click"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.track(InteractionPayload::new("add_to_cart"));

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(remote.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            remote.batches(),
            vec![vec![
                "view".to_string(),
                "click".to_string(),
                "add_to_cart".to_string()
            ]]
        );
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_forces_flush_before_window() {
        let remote = Arc::new(BatchRecorder::default());
        let tracker = tracker_with(remote.clone(), TrackerConfig::default());
        tracker.track(InteractionPayload::new("view"));
        tracker.track(InteractionPayload::new("click"));

        let start = Instant::now();
        let report = tracker
            .on_page_signal(PageSignal::VisibilityChanged(Visibility::Hidden))
            .await
            .expect("forced");
        assert!(matches!(report, FlushReport::Sent { events: 2, .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The timer must not send the same events again.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_does_not_flush() {
        let remote = Arc::new(BatchRecorder::default());
        let tracker = tracker_with(remote.clone(), TrackerConfig::default());
        tracker.track(InteractionPayload::new("view"));

        let report = tracker
            .on_page_signal(PageSignal::VisibilityChanged(Visibility::Visible))
            .await;
        assert!(report.is_none());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_early() {
        let remote = Arc::new(BatchRecorder::default());
        let tracker = tracker_with(
            remote.clone(),
            TrackerConfig {
                window: Duration::from_secs(5),
                max_batch_size: 3,
            },
        );
        for _ in 0..3 {
            tracker.track(InteractionPayload::new("view"));
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(remote.batches().len(), 1);
        assert_eq!(remote.batches()[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_batch_is_dropped_after_ceiling() {
        let remote = Arc::new(BatchRecorder {
            fail: true,
            ..BatchRecorder::default()
        });
        let tracker = tracker_with(remote.clone(), TrackerConfig::default());
        tracker.track(InteractionPayload::new("view"));
        tracker.track(InteractionPayload::new("click"));

        let report = tracker.flush().await;
        assert!(matches!(
            report,
            FlushReport::Sent {
                events: 2,
                outcome: BatchOutcome::Dropped { attempts: 3, .. }
            }
        ));
        assert_eq!(remote.batches().len(), 3);
        assert_eq!(tracker.pending_count(), 0);

        // Nothing left to retry.
        assert_eq!(tracker.flush().await, FlushReport::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_flush_during_flight_is_not_duplicated() {
        let remote = Arc::new(BatchRecorder {
            delay: Some(Duration::from_secs(1)),
            ..BatchRecorder::default()
        });
        let tracker = Arc::new(tracker_with(remote.clone(), TrackerConfig::default()));
        tracker.track(InteractionPayload::new("view"));

        let background = Arc::clone(&tracker);
        let first = tokio::spawn(async move { background.flush().await });
        tokio::task::yield_now().await;

        let second = tracker
            .on_page_signal(PageSignal::VisibilityChanged(Visibility::Hidden))
            .await;
        assert_eq!(second, Some(FlushReport::Skipped));

        let first = first.await.expect("join");
        assert!(matches!(first, FlushReport::Sent { events: 1, .. }));
        assert_eq!(remote.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_tracked_during_retrying_flush_is_sent_later() {
        let remote = Arc::new(BatchRecorder {
            failures: 3.into(),
            ..BatchRecorder::default()
        });
        let tracker = Arc::new(tracker_with(remote.clone(), TrackerConfig::default()));
        tracker.track(InteractionPayload::new("view"));

        let background = Arc::clone(&tracker);
        let hidden = tokio::spawn(async move {
            background
                .on_page_signal(PageSignal::VisibilityChanged(Visibility::Hidden))
                .await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        tracker.track(InteractionPayload::new("click"));

        let hidden = hidden.await.expect("join").expect("forced");
        assert!(matches!(
            hidden,
            FlushReport::Sent {
                events: 1,
                outcome: BatchOutcome::Dropped { attempts: 3, .. }
            }
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            remote.batches().last().cloned(),
            Some(vec!["click".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_during_flight_is_sent_later() {
        let remote = Arc::new(BatchRecorder {
            delay: Some(Duration::from_secs(1)),
            ..BatchRecorder::default()
        });
        let tracker = Arc::new(tracker_with(
            remote.clone(),
            TrackerConfig {
                window: Duration::from_secs(5),
                max_batch_size: 2,
            },
        ));
        tracker.track(InteractionPayload::new("view"));

        let background = Arc::clone(&tracker);
        let first = tokio::spawn(async move { background.flush().await });
        tokio::task::yield_now().await;

        // Fills the batch while the first flush is still in flight.
        tracker.track(InteractionPayload::new("click"));
        tracker.track(InteractionPayload::new("scroll"));

        first.await.expect("join");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            remote.batches(),
            vec![
                vec!["view".to_string()],
                vec!["click".to_string(), "scroll".to_string()]
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_makes_single_attempt() {
        let remote = Arc::new(BatchRecorder {
            fail: true,
            ..BatchRecorder::default()
        });
        let tracker = tracker_with(remote.clone(), TrackerConfig::default());
        tracker.track(InteractionPayload::new("view"));

        let report = tracker
            .on_page_signal(PageSignal::BeforeUnload)
            .await
            .expect("forced");
        assert!(matches!(
            report,
            FlushReport::Sent {
                outcome: BatchOutcome::Dropped { attempts: 1, .. },
                ..
            }
        ));
        assert_eq!(remote.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_flushes_and_stops_tracking() {
        let remote = Arc::new(BatchRecorder::default());
        let tracker = tracker_with(remote.clone(), TrackerConfig::default());
        tracker.track(InteractionPayload::new("view"));

        let report = tracker.dispose().await;
        assert!(matches!(report, FlushReport::Sent { events: 1, .. }));
        assert!(tracker.is_disposed());
        assert!(!tracker.track(InteractionPayload::new("click")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.batches().len(), 1);
        assert_eq!(tracker.dispose().await, FlushReport::Empty);
    }
}
