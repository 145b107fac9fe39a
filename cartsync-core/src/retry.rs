//! Retry policy shared by cart replay and analytics batching.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for retry behaviour.
///
/// Backoff is linear: the wait after the `n`th failed attempt is
/// `backoff_base_ms * n`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up. `None` means unbounded.
    pub max_attempts: Option<u32>,
    /// Base delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::cart()
    }
}

impl RetryPolicy {
    /// Cart mutations: never dropped for transient failures.
    #[must_use]
    pub const fn cart() -> Self {
        Self {
            max_attempts: None,
            backoff_base_ms: 2000,
            max_delay_ms: 30_000,
        }
    }

    /// Analytics batches: three attempts, 2 s linear backoff.
    #[must_use]
    pub const fn analytics() -> Self {
        Self {
            max_attempts: Some(3),
            backoff_base_ms: 2000,
            max_delay_ms: 30_000,
        }
    }

    /// One attempt, no retries.
    #[must_use]
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: Some(1),
            backoff_base_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(u64::from(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether `attempts` failed attempts use up the policy.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}
