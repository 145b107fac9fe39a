//! Error types for the offline mutation queue.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while buffering or replaying mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Durable persistence failed (quota exceeded, storage disabled, I/O).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The remote API could not be reached or timed out.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The remote API definitively rejected the mutation.
    #[error("Server rejected mutation ({status}): {message}")]
    ServerRejected {
        /// HTTP status returned by the server.
        status: u16,
        /// Message returned by the server, if any.
        message: String,
    },

    /// A batch failed on every attempt allowed by its retry policy.
    #[error("Retry ceiling exceeded after {attempts} attempts")]
    RetryCeilingExceeded {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// A record or stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Returns true if the failure is transient and the mutation should stay queued.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
