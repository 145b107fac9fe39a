//! Remote API boundary.
//!
//! The replay engine talks to the storefront backend only through
//! [`RemoteApi`]. The agent provides an HTTP implementation; tests provide
//! scripted ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::mutation::{CartAddPayload, InteractionPayload};

/// Failure reported by a [`RemoteApi`] call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The server could not be reached, timed out, or is temporarily
    /// overloaded.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The server definitively refused the request.
    #[error("Rejected with status {status}: {message}")]
    ServerRejected {
        /// HTTP status.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NetworkUnavailable(msg) => Self::NetworkUnavailable(msg),
            RemoteError::ServerRejected { status, message } => {
                Self::ServerRejected { status, message }
            }
        }
    }
}

/// Cart item resource returned by `POST /cart/items`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    /// Server-assigned identifier.
    #[serde(default)]
    pub id: serde_json::Value,
    /// Product variant.
    #[serde(default)]
    pub variant_id: u64,
    /// Quantity now in the cart.
    #[serde(default)]
    pub quantity: u32,
}

/// Calls the queue replays against the storefront backend.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `POST /cart/items`.
    async fn add_cart_item(&self, item: &CartAddPayload) -> Result<CartItem, RemoteError>;

    /// `POST /user-interactions/batch`.
    async fn submit_interactions(&self, batch: &[InteractionPayload]) -> Result<(), RemoteError>;
}
