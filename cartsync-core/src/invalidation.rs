//! Cache invalidation bridge.
//!
//! After a successful replay the engine marks dependent read caches stale by
//! tag. [`InvalidationBus`] broadcasts each tag to subscribers (the read
//! layer) and keeps per-tag counts.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;

/// Cart resource.
pub const CART: &str = "cart";
/// Cart line items.
pub const CART_ITEMS: &str = "cart-items";
/// Derived totals (subtotal, tax, shipping).
pub const CART_TOTALS: &str = "cart-totals";

/// Tags invalidated after a cart drain.
pub const CART_TAGS: [&str; 3] = [CART, CART_ITEMS, CART_TOTALS];

/// Consumer of invalidation signals.
pub trait CacheInvalidator: Send + Sync {
    /// Mark every cache entry under `tag` as stale.
    fn invalidate(&self, tag: &str);
}

/// Broadcasting [`CacheInvalidator`].
#[derive(Debug)]
pub struct InvalidationBus {
    tx: broadcast::Sender<String>,
    counts: RwLock<HashMap<String, u64>>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Receive invalidated tags.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// How many times `tag` has been invalidated.
    #[must_use]
    pub fn count(&self, tag: &str) -> u64 {
        self.counts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(tag)
            .copied()
            .unwrap_or(0)
    }
}

impl CacheInvalidator for InvalidationBus {
    fn invalidate(&self, tag: &str) {
        *self
            .counts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(tag.to_string())
            .or_insert(0) += 1;

        tracing::debug!(tag, "Cache tag invalidated");
        // No subscribers is fine
        let _ = self.tx.send(tag.to_string());
    }
}
