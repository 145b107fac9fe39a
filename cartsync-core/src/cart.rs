//! Cart coordinator.
//!
//! Ties the durable buffer, the replay engine and the connectivity monitor
//! together for the "add to cart" flow. Every add goes through the buffer
//! first, so an add made while earlier records are still pending can never
//! overtake them.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::buffer::{AppendOutcome, DurableBuffer};
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::mutation::{PendingMutation, RecordId};
use crate::replay::{DrainReport, DrainStatus, ReplayEngine};

/// What happened to an add-to-cart request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AddOutcome {
    /// The server accepted the item.
    Synced {
        /// Record that carried the add.
        record_id: RecordId,
    },
    /// The server refused the item.
    Rejected {
        /// Record that carried the add.
        record_id: RecordId,
    },
    /// The add is queued for a later drain.
    Queued {
        /// Record that carries the add.
        record_id: RecordId,
        /// Whether the record survives a restart.
        persisted: bool,
    },
}

impl AddOutcome {
    /// The record ID carried by this outcome.
    #[must_use]
    pub const fn record_id(&self) -> RecordId {
        match self {
            Self::Synced { record_id }
            | Self::Rejected { record_id }
            | Self::Queued { record_id, .. } => *record_id,
        }
    }
}

/// Offline-aware cart mutation flow.
pub struct CartSync {
    buffer: Arc<DurableBuffer>,
    engine: Arc<ReplayEngine>,
    monitor: ConnectivityMonitor,
    retry: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl std::fmt::Debug for CartSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartSync")
            .field("buffer", &self.buffer)
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl CartSync {
    /// Create the coordinator.
    #[must_use]
    pub fn new(
        buffer: Arc<DurableBuffer>,
        engine: Arc<ReplayEngine>,
        monitor: ConnectivityMonitor,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            buffer,
            engine,
            monitor,
            retry: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Drain on every offline -> online transition.
    ///
    /// Must be called inside a tokio runtime. Keep the returned
    /// subscription alive for as long as draining should follow
    /// connectivity.
    #[must_use = "dropping the subscription stops reacting to connectivity"]
    pub fn attach(&self) -> Subscription {
        let handle = tokio::runtime::Handle::current();
        let this = self.this.clone();
        self.monitor.on_online(move || {
            if let Some(cart) = this.upgrade() {
                tracing::info!("Back online, draining offline cart");
                handle.spawn(async move {
                    cart.drain().await;
                });
            }
        })
    }

    /// Queue a cart add and try to deliver it right away when online.
    pub async fn add_to_cart(&self, variant_id: u64, quantity: u32) -> AddOutcome {
        let record = PendingMutation::cart_add(variant_id, quantity);
        let record_id = record.id();
        let appended = self.buffer.append(record).await;
        let queued = AddOutcome::Queued {
            record_id,
            persisted: appended == AppendOutcome::Persisted,
        };

        if !self.monitor.is_online() {
            tracing::info!(variant_id, quantity, record_id = %record_id, "Offline, cart add queued");
            return queued;
        }

        let report = self.drain().await;
        if report.synced.contains(&record_id) {
            AddOutcome::Synced { record_id }
        } else if report.rejected.contains(&record_id) {
            AddOutcome::Rejected { record_id }
        } else {
            queued
        }
    }

    /// Replay the buffer now.
    ///
    /// If a transient failure halts the pass while still online, one
    /// delayed re-drain is scheduled using the engine's backoff. A pass
    /// skipped because another process holds the drain lock is retried the
    /// same way. A pass skipped because this engine is already draining
    /// needs nothing: the running drain picks the new records up.
    pub async fn drain(&self) -> DrainReport {
        let report = self.engine.drain(&self.buffer).await;
        if !self.monitor.is_online() {
            return report;
        }
        match report.status {
            DrainStatus::Halted => {
                let delay = self.engine.policy().delay_for_attempt(report.halted_attempts);
                self.schedule_retry(delay);
            }
            DrainStatus::Skipped if !self.engine.is_draining() => {
                tracing::debug!("Drain lock held elsewhere, retrying later");
                self.schedule_retry(self.engine.policy().delay_for_attempt(1));
            }
            _ => {}
        }
        report
    }

    /// Records still waiting to be delivered.
    pub async fn pending(&self) -> Vec<PendingMutation> {
        self.buffer.read_all().await
    }

    /// The connectivity monitor driving this coordinator.
    #[must_use]
    pub const fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// The underlying buffer.
    #[must_use]
    pub const fn buffer(&self) -> &Arc<DurableBuffer> {
        &self.buffer
    }

    /// Cancel any scheduled re-drain.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .retry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        let Some(cart) = self.this.upgrade() else {
            return;
        };
        tracing::debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Scheduling cart re-drain");

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cart.monitor.is_online() {
                cart.drain().await;
            }
        });

        let previous = self
            .retry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
