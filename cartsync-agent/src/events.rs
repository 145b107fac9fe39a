//! Server-Sent Events stream of sync notifications.
//!
//! The storefront UI subscribes once, shows each notification as a toast and
//! refetches cached queries named by `invalidate` events.
//!
//! ```text
//! event: cart_synced
//! data: {"type":"cart_synced","count":2,"message":"Offline cart synced","error":false}
//!
//! event: invalidate
//! data: {"tag":"cart-items"}
//! ```

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use cartsync_core::Notification;
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

/// Payload of one SSE event.
#[derive(Debug, Serialize)]
pub struct NotificationEnvelope {
    /// The notification itself.
    #[serde(flatten)]
    pub notification: Notification,
    /// Toast text.
    pub message: String,
    /// Whether the toast should be styled as an error.
    pub error: bool,
}

impl From<Notification> for NotificationEnvelope {
    fn from(notification: Notification) -> Self {
        Self {
            message: notification.message(),
            error: notification.is_error(),
            notification,
        }
    }
}

/// SSE event name for a notification.
#[must_use]
pub const fn event_name(notification: &Notification) -> &'static str {
    match notification {
        Notification::CartSynced { .. } => "cart_synced",
        Notification::ItemRejected { .. } => "item_rejected",
        Notification::SyncFailed { .. } => "sync_failed",
        Notification::BatchDropped { .. } => "batch_dropped",
    }
}

fn invalidation_event(result: Result<String, BroadcastStreamRecvError>) -> Option<Event> {
    match result {
        Ok(tag) => Some(
            Event::default()
                .event("invalidate")
                .data(serde_json::json!({ "tag": tag }).to_string()),
        ),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "Invalidation stream lagged");
            None
        }
    }
}

fn to_event(result: Result<Notification, BroadcastStreamRecvError>) -> Event {
    match result {
        Ok(notification) => {
            let name = event_name(&notification);
            let data = serde_json::to_string(&NotificationEnvelope::from(notification))
                .unwrap_or_default();
            Event::default().event(name).data(data)
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "Notification stream lagged");
            Event::default()
                .event("lagged")
                .data(format!("{{\"skipped\":{skipped}}}"))
        }
    }
}

/// `GET /events`.
///
/// # Example
///
/// ```text
/// curl -N http://localhost:9474/events
/// ```
pub async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let notifications = BroadcastStream::new(state.notifications.subscribe()).map(to_event);
    let invalidations =
        BroadcastStream::new(state.invalidations.subscribe()).filter_map(invalidation_event);
    let stream = notifications
        .merge(invalidations)
        .map(Ok::<_, Infallible>);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartsync_core::RecordId;

    #[test]
    fn test_envelope_serialization() {
        let envelope = NotificationEnvelope::from(Notification::CartSynced { count: 2 });
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(json["type"], "cart_synced");
        assert_eq!(json["count"], 2);
        assert_eq!(json["message"], "Offline cart synced");
        assert_eq!(json["error"], false);
    }

    #[test]
    fn test_rejection_envelope_is_error() {
        let envelope = NotificationEnvelope::from(Notification::ItemRejected {
            record_id: RecordId::new(),
            variant_id: Some(13),
            reason: "variant deleted".into(),
        });
        assert!(envelope.error);
        assert_eq!(envelope.message, "Failed to sync item 13");
    }

    #[test]
    fn test_lagged_invalidation_is_skipped() {
        assert!(invalidation_event(Err(BroadcastStreamRecvError::Lagged(3))).is_none());
        assert!(invalidation_event(Ok("cart".into())).is_some());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            event_name(&Notification::SyncFailed {
                message: "down".into()
            }),
            "sync_failed"
        );
        assert_eq!(
            event_name(&Notification::BatchDropped {
                events: 1,
                attempts: 3
            }),
            "batch_dropped"
        );
    }
}
