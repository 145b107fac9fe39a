//! Advisory cross-process drain lock.
//!
//! Two processes sharing one store could both drain the buffer and submit
//! every record twice. [`StoreDrainLock`] keeps a lease record
//! (`{owner, expires_at}`) next to the buffer. The check-and-set is a single
//! [`KeyValueStore::update`], and an expired lease may be taken over so a
//! crashed holder cannot block draining forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mutation::current_timestamp_ms;
use crate::storage::KeyValueStore;

/// Storage key of the lease next to the default buffer.
pub const DEFAULT_LOCK_KEY: &str = "offline-cart.lock";

/// Default lease duration.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Mutual exclusion for drains across processes.
#[async_trait]
pub trait DrainLock: Send + Sync {
    /// Try to take the lease for `owner`. Returns false if someone else
    /// holds an unexpired lease.
    async fn try_acquire(&self, owner: &str, ttl: Duration) -> bool;

    /// Release the lease if `owner` holds it.
    async fn release(&self, owner: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    owner: String,
    expires_at: u64,
}

/// [`DrainLock`] backed by a [`KeyValueStore`] entry.
pub struct StoreDrainLock {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl std::fmt::Debug for StoreDrainLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDrainLock")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl StoreDrainLock {
    /// Lock stored under [`DEFAULT_LOCK_KEY`].
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, DEFAULT_LOCK_KEY)
    }

    /// Lock stored under `key`.
    #[must_use]
    pub fn with_key(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

fn parse_lease(value: Option<&Value>) -> Option<Lease> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[async_trait]
impl DrainLock for StoreDrainLock {
    async fn try_acquire(&self, owner: &str, ttl: Duration) -> bool {
        let now = current_timestamp_ms();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let me = owner.to_string();

        let result = self
            .store
            .update(
                &self.key,
                Box::new(move |current| {
                    match parse_lease(current.as_ref()) {
                        Some(lease) if lease.owner != me && lease.expires_at > now => {
                            return current.unwrap_or(Value::Null);
                        }
                        _ => {}
                    }
                    flag.store(true, Ordering::SeqCst);
                    serde_json::to_value(Lease {
                        owner: me,
                        expires_at: now.saturating_add(ttl_ms),
                    })
                    .unwrap_or(Value::Null)
                }),
            )
            .await;

        match result {
            Ok(_) => acquired.load(Ordering::SeqCst),
            Err(e) => {
                // Without storage there is nothing to coordinate through.
                tracing::warn!(key = %self.key, error = %e, "Drain lock storage failed, proceeding unlocked");
                true
            }
        }
    }

    async fn release(&self, owner: &str) {
        let me = owner.to_string();
        let result = self
            .store
            .update(
                &self.key,
                Box::new(move |current| match parse_lease(current.as_ref()) {
                    Some(lease) if lease.owner == me => Value::Null,
                    _ => current.unwrap_or(Value::Null),
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(key = %self.key, error = %e, "Failed to release drain lock");
        }
    }
}
