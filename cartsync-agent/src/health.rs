//! Health check endpoints.
//!
//! - `/health/live` - Liveness probe
//! - `/health/ready` - Readiness probe with component checks
//!
//! Being offline or running on memory-only storage is reported as
//! `degraded` but still ready: the agent keeps accepting work in both cases.
//! Only a disposed tracker makes the agent unready.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::AppState;

/// Health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status: "healthy", "degraded" or "unhealthy"
    pub status: &'static str,
    /// Agent version
    pub version: &'static str,
    /// Individual component checks
    pub checks: HealthChecks,
}

/// Individual health checks.
#[derive(Debug, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct HealthChecks {
    /// Queue writes reach durable storage
    pub storage_durable: bool,
    /// Connectivity monitor reports online
    pub online: bool,
    /// Interaction tracker accepts events
    pub tracker_active: bool,
}

impl HealthChecks {
    /// Overall status label.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        if !self.tracker_active {
            "unhealthy"
        } else if self.storage_durable && self.online {
            "healthy"
        } else {
            "degraded"
        }
    }
}

/// Liveness probe - is the agent running?
#[tracing::instrument(name = "liveness_probe")]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe - can the agent accept work?
#[tracing::instrument(name = "readiness_probe", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let checks = HealthChecks {
        storage_durable: !state.cart.buffer().is_degraded().await,
        online: state.monitor.is_online(),
        tracker_active: !state.tracker.is_disposed(),
    };

    let code = if checks.tracker_active {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthStatus {
            status: checks.status(),
            version: env!("CARGO_PKG_VERSION"),
            checks,
        }),
    )
}
