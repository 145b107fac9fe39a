//! # cartsync core
//!
//! Offline-resilient mutation queue for the storefront client.
//! Cart additions made while offline are persisted and replayed in order
//! once the network returns; interaction analytics are coalesced into
//! time-windowed batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    cartsync-core                     │
//! ├──────────────────────────────────────────────────────┤
//! │  CartSync            │  InteractionTracker           │
//! │  - add_to_cart       │  - track / flush / dispose    │
//! │  - drain on online   │  - 5 s window, page signals   │
//! ├──────────────────────────────────────────────────────┤
//! │  ReplayEngine (RetryPolicy, per-call timeout)        │
//! │  - FIFO drain, halt on transient failure             │
//! │  - batch replay with linear backoff                  │
//! ├──────────────────────────────────────────────────────┤
//! │  DurableBuffer  │  ConnectivityMonitor │  DrainLock  │
//! │  KeyValueStore  │  InvalidationBus     │  Notifier   │
//! └──────────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod cart;
pub mod connectivity;
pub mod error;
pub mod invalidation;
pub mod lifecycle;
pub mod lock;
pub mod mutation;
pub mod notify;
pub mod remote;
pub mod replay;
pub mod retry;
pub mod storage;
pub mod tracker;

pub use buffer::{AppendOutcome, DurableBuffer, DEFAULT_BUFFER_KEY};
pub use cart::{AddOutcome, CartSync};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState, Subscription};
pub use error::{SyncError, SyncResult};
pub use invalidation::{CacheInvalidator, InvalidationBus};
pub use lifecycle::{PageSignal, Visibility};
pub use lock::{DrainLock, StoreDrainLock, DEFAULT_LOCK_KEY, DEFAULT_LOCK_TTL};
pub use mutation::{
    current_timestamp_ms, CartAddPayload, InteractionPayload, MutationKind, MutationPayload,
    PendingMutation, RecordId,
};
pub use notify::{Notification, NotificationHub, Notifier};
pub use remote::{CartItem, RemoteApi, RemoteError};
pub use replay::{
    BatchOutcome, DrainObserver, DrainReport, DrainStatus, ReplayEngine, DEFAULT_CALL_TIMEOUT,
};
pub use retry::RetryPolicy;
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use tracker::{FlushReport, InteractionTracker, TrackerConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
