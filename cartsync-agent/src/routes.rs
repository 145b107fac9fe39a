//! Control API handlers.
//!
//! The storefront client talks to the agent instead of the backend for the
//! two flows that must survive being offline:
//!
//! | Method | Path                  | Purpose                              |
//! |--------|-----------------------|--------------------------------------|
//! | POST   | `/cart/items`         | add to cart (queued, then replayed)  |
//! | GET    | `/cart/pending`       | records waiting for delivery         |
//! | POST   | `/cart/sync`          | drain the queue now                  |
//! | POST   | `/interactions`       | track an interaction event           |
//! | POST   | `/interactions/flush` | flush buffered interactions          |
//! | PUT    | `/connectivity`       | report the client's online flag      |
//! | PUT    | `/visibility`         | report page visibility               |
//! | POST   | `/lifecycle/unload`   | page is about to unload              |
//! | GET    | `/events`             | SSE notifications                    |

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use cartsync_core::{
    AddOutcome, BatchOutcome, ConnectivityState, FlushReport, InteractionPayload, PageSignal,
    PendingMutation, Visibility,
};
use serde::{Deserialize, Serialize};

use crate::{events, health, metrics, AppState};

/// Build the control API router.
///
/// Middleware (CORS, tracing, request IDs) and `/metrics` are layered on by
/// the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/cart/items", post(add_cart_item_handler))
        .route("/cart/pending", get(pending_handler))
        .route("/cart/sync", post(sync_handler))
        .route("/interactions", post(track_handler))
        .route("/interactions/flush", post(flush_handler))
        .route("/connectivity", put(connectivity_handler))
        .route("/visibility", put(visibility_handler))
        .route("/lifecycle/unload", post(unload_handler))
        .route("/events", get(events::stream_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Short machine-readable error.
    pub error: &'static str,
    /// Human-readable detail.
    pub message: String,
}

fn error_response(code: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

const fn default_quantity() -> u32 {
    1
}

/// Body of `POST /cart/items`.
#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    /// Product variant.
    pub variant_id: u64,
    /// Units to add.
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

/// Body of `GET /cart/pending`.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    /// Queued records.
    pub count: usize,
    /// Whether the queue has fallen back to memory.
    pub degraded: bool,
    /// Records in delivery order.
    pub records: Vec<PendingMutation>,
}

/// Body of `POST /interactions`.
#[derive(Debug, Serialize)]
pub struct TrackResponse {
    /// Events buffered after this one.
    pub pending: usize,
}

/// Result of a forced interaction flush.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FlushResponse {
    /// "delivered", "rejected", "dropped", "empty" or "skipped".
    pub status: &'static str,
    /// Events in the flushed batch.
    pub events: usize,
    /// Attempts used, when a batch was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl From<&FlushReport> for FlushResponse {
    fn from(report: &FlushReport) -> Self {
        match report {
            FlushReport::Sent { events, outcome } => {
                let (status, attempts) = match outcome {
                    BatchOutcome::Delivered { attempts } => ("delivered", Some(*attempts)),
                    BatchOutcome::Rejected { .. } => ("rejected", None),
                    BatchOutcome::Dropped { attempts, .. } => ("dropped", Some(*attempts)),
                };
                Self {
                    status,
                    events: *events,
                    attempts,
                }
            }
            FlushReport::Empty => Self {
                status: "empty",
                events: 0,
                attempts: None,
            },
            FlushReport::Skipped => Self {
                status: "skipped",
                events: 0,
                attempts: None,
            },
        }
    }
}

fn record_flush(report: &FlushReport) -> FlushResponse {
    if let FlushReport::Sent { outcome, .. } = report {
        match outcome {
            BatchOutcome::Delivered { .. } => metrics::record_batch("delivered"),
            BatchOutcome::Rejected { .. } => metrics::record_batch("rejected"),
            // Counted by the metered notifier.
            BatchOutcome::Dropped { .. } => {}
        }
    }
    FlushResponse::from(report)
}

/// Body of `PUT /connectivity`.
#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    /// The client's online flag.
    pub online: bool,
}

/// Response of `PUT /connectivity`.
#[derive(Debug, Serialize)]
pub struct ConnectivityResponse {
    /// State after the update.
    pub state: ConnectivityState,
    /// Whether this was a transition.
    pub changed: bool,
}

/// Body of `PUT /visibility`.
#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    /// New page visibility.
    pub state: Visibility,
}

/// Response of page lifecycle updates.
#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    /// The forced flush, if the signal caused one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<FlushResponse>,
}

// ---------------------------------------------------------------------------
// Cart
// ---------------------------------------------------------------------------

async fn refresh_pending_gauge(state: &AppState) {
    metrics::set_pending_records(state.cart.buffer().len().await);
}

/// `POST /cart/items`.
///
/// `201` when the item reached the server, `202` when it is queued and
/// `422` when the server refused it.
#[tracing::instrument(name = "add_cart_item", skip(state), fields(variant_id = request.variant_id))]
pub async fn add_cart_item_handler(
    State(state): State<AppState>,
    Json(request): Json<AddItemRequest>,
) -> Response {
    if request.quantity == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_quantity",
            "quantity must be at least 1",
        );
    }

    let outcome = state
        .cart
        .add_to_cart(request.variant_id, request.quantity)
        .await;
    refresh_pending_gauge(&state).await;

    let code = match &outcome {
        AddOutcome::Synced { .. } => StatusCode::CREATED,
        AddOutcome::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AddOutcome::Queued { persisted, .. } => {
            if !persisted {
                metrics::record_storage_degraded();
            }
            StatusCode::ACCEPTED
        }
    };
    (code, Json(outcome)).into_response()
}

/// `GET /cart/pending`.
#[tracing::instrument(name = "pending_cart", skip(state))]
pub async fn pending_handler(State(state): State<AppState>) -> Json<PendingResponse> {
    let records = state.cart.pending().await;
    metrics::set_pending_records(records.len());
    Json(PendingResponse {
        count: records.len(),
        degraded: state.cart.buffer().is_degraded().await,
        records,
    })
}

/// `POST /cart/sync`.
///
/// Refuses with `409` while offline; the drain happens on reconnect.
#[tracing::instrument(name = "sync_cart", skip(state))]
pub async fn sync_handler(State(state): State<AppState>) -> Response {
    if !state.monitor.is_online() {
        return error_response(
            StatusCode::CONFLICT,
            "offline",
            "queued records will sync when the connection returns",
        );
    }

    let report = state.cart.drain().await;
    refresh_pending_gauge(&state).await;
    Json(report).into_response()
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

/// `POST /interactions`.
#[tracing::instrument(
    name = "track_interaction",
    skip(state, event),
    fields(interaction_type = %event.interaction_type)
)]
pub async fn track_handler(
    State(state): State<AppState>,
    Json(event): Json<InteractionPayload>,
) -> Response {
    if event.interaction_type.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_interaction",
            "interaction type must not be empty",
        );
    }
    if !state.tracker.track(event) {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "tracker_disposed",
            "agent is shutting down",
        );
    }
    (
        StatusCode::ACCEPTED,
        Json(TrackResponse {
            pending: state.tracker.pending_count(),
        }),
    )
        .into_response()
}

/// `POST /interactions/flush`.
#[tracing::instrument(name = "flush_interactions", skip(state))]
pub async fn flush_handler(State(state): State<AppState>) -> Json<FlushResponse> {
    let report = state.tracker.flush().await;
    Json(record_flush(&report))
}

// ---------------------------------------------------------------------------
// Client signals
// ---------------------------------------------------------------------------

/// `PUT /connectivity`.
#[tracing::instrument(name = "set_connectivity", skip(state))]
pub async fn connectivity_handler(
    State(state): State<AppState>,
    Json(request): Json<ConnectivityRequest>,
) -> Json<ConnectivityResponse> {
    let changed = state.monitor.set_online(request.online).is_some();
    if changed {
        metrics::set_connectivity(request.online);
    }
    Json(ConnectivityResponse {
        state: state.monitor.state(),
        changed,
    })
}

/// `PUT /visibility`.
#[tracing::instrument(name = "set_visibility", skip(state))]
pub async fn visibility_handler(
    State(state): State<AppState>,
    Json(request): Json<VisibilityRequest>,
) -> Json<LifecycleResponse> {
    let flush = state
        .tracker
        .on_page_signal(PageSignal::VisibilityChanged(request.state))
        .await;
    Json(LifecycleResponse {
        flush: flush.as_ref().map(record_flush),
    })
}

/// `POST /lifecycle/unload`.
#[tracing::instrument(name = "page_unload", skip(state))]
pub async fn unload_handler(State(state): State<AppState>) -> Json<LifecycleResponse> {
    let flush = state.tracker.on_page_signal(PageSignal::BeforeUnload).await;
    Json(LifecycleResponse {
        flush: flush.as_ref().map(record_flush),
    })
}
