//! User-facing sync notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::mutation::RecordId;

/// Non-blocking notification about background sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Queued cart mutations reached the server.
    CartSynced {
        /// Records synced in this drain.
        count: usize,
    },
    /// The server refused a queued record; it was dropped.
    ItemRejected {
        /// Dropped record.
        record_id: RecordId,
        /// Variant the record referred to, for cart records.
        variant_id: Option<u64>,
        /// Server-provided reason.
        reason: String,
    },
    /// A drain made no progress.
    SyncFailed {
        /// Failure description.
        message: String,
    },
    /// An analytics batch was discarded.
    BatchDropped {
        /// Events in the discarded batch.
        events: usize,
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl Notification {
    /// Short text suitable for a toast.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::CartSynced { .. } => "Offline cart synced".to_string(),
            Self::ItemRejected {
                variant_id: Some(v),
                ..
            } => format!("Failed to sync item {v}"),
            Self::ItemRejected { record_id, .. } => format!("Failed to sync item {record_id}"),
            Self::SyncFailed { message } => format!("Cart sync failed: {message}"),
            Self::BatchDropped { events, .. } => format!("Dropped {events} analytics events"),
        }
    }

    /// Whether this reports a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Self::CartSynced { .. })
    }
}

/// Sink for [`Notification`]s.
pub trait Notifier: Send + Sync {
    /// Publish a notification. Must not block.
    fn notify(&self, notification: Notification);
}

/// Broadcast hub fanning notifications out to subscribers.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationHub {
    /// Create a hub buffering up to `capacity` notifications per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Current number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Notifier for NotificationHub {
    fn notify(&self, notification: Notification) {
        if notification.is_error() {
            tracing::warn!(message = %notification.message(), "Sync notification");
        } else {
            tracing::info!(message = %notification.message(), "Sync notification");
        }
        let _ = self.tx.send(notification);
    }
}
