//! Durable, FIFO buffer of pending mutations.
//!
//! The buffer is the only component that touches its storage key. Every
//! mutation is a single read-modify-write through [`KeyValueStore::update`],
//! and the in-memory mirror is only replaced with what storage reports as
//! committed.
//!
//! If storage fails, the buffer logs the failure and switches to memory-only
//! mode for the rest of the process lifetime. Callers never see a storage
//! error: `append` reports [`AppendOutcome::MemoryOnly`] instead.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::mutation::{PendingMutation, RecordId};
use crate::storage::KeyValueStore;

/// Storage key used for the offline cart.
pub const DEFAULT_BUFFER_KEY: &str = "offline-cart";

/// Where an appended record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Committed to durable storage.
    Persisted,
    /// Storage is unavailable; the record lives in memory only and will not
    /// survive a restart.
    MemoryOnly,
}

impl AppendOutcome {
    /// Whether the record was durably committed.
    #[must_use]
    pub const fn is_persisted(self) -> bool {
        matches!(self, Self::Persisted)
    }
}

#[derive(Debug, Default)]
struct BufferState {
    records: Vec<PendingMutation>,
    degraded: bool,
}

/// Persisted FIFO buffer of [`PendingMutation`] records.
pub struct DurableBuffer {
    store: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<BufferState>,
}

impl std::fmt::Debug for DurableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBuffer")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl DurableBuffer {
    /// Open the buffer stored under [`DEFAULT_BUFFER_KEY`].
    pub async fn open(store: Arc<dyn KeyValueStore>) -> Self {
        Self::open_with_key(store, DEFAULT_BUFFER_KEY).await
    }

    /// Open the buffer stored under `key`, loading whatever was committed
    /// by a previous process.
    pub async fn open_with_key(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let mut state = BufferState::default();

        match store.get(&key).await {
            Ok(value) => match decode(value) {
                Ok(records) => {
                    if !records.is_empty() {
                        tracing::info!(
                            key = %key,
                            pending = records.len(),
                            "Loaded pending mutations from storage"
                        );
                    }
                    state.records = records;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Stored buffer unreadable, using memory only");
                    state.degraded = true;
                }
            },
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Storage unavailable, using memory only");
                state.degraded = true;
            }
        }

        Self {
            store,
            key,
            state: Mutex::new(state),
        }
    }

    /// The storage key this buffer owns.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the buffer has fallen back to memory-only mode.
    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    /// Append a record to the end of the buffer.
    ///
    /// Never fails: if storage is unavailable the record is kept in memory
    /// and the degradation is logged.
    pub async fn append(&self, record: PendingMutation) -> AppendOutcome {
        let mut state = self.state.lock().await;
        let record_id = record.id();

        if !state.degraded {
            let encoded = match serde_json::to_value(&record) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(record_id = %record_id, error = %e, "Failed to encode record");
                    state.records.push(record);
                    return AppendOutcome::MemoryOnly;
                }
            };
            let result = self
                .commit(Box::new(move |current| {
                    let mut items = as_array(current);
                    items.push(encoded);
                    Value::Array(items)
                }))
                .await;
            match result {
                Ok(records) => {
                    state.records = records;
                    tracing::debug!(record_id = %record_id, pending = state.records.len(), "Record appended");
                    return AppendOutcome::Persisted;
                }
                Err(e) => self.degrade(&mut state, &e),
            }
        }

        state.records.push(record);
        tracing::warn!(
            record_id = %record_id,
            "Record queued in memory only; it will be lost on restart"
        );
        AppendOutcome::MemoryOnly
    }

    /// Return the full ordered list of pending records.
    ///
    /// Re-reads storage when healthy so records committed by another process
    /// sharing the same store are visible.
    pub async fn read_all(&self) -> Vec<PendingMutation> {
        let mut state = self.state.lock().await;
        if !state.degraded {
            match self.store.get(&self.key).await.map_err(SyncError::from) {
                Ok(value) => match decode(value) {
                    Ok(records) => state.records = records,
                    Err(e) => self.degrade(&mut state, &e),
                },
                Err(e) => self.degrade(&mut state, &e),
            }
        }
        state.records.clone()
    }

    /// Number of pending records.
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Whether no records are pending.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    /// Remove a single record. Returns whether it was present.
    pub async fn remove(&self, id: RecordId) -> bool {
        let mut state = self.state.lock().await;
        let present = state.records.iter().any(|r| r.id() == id);

        if !state.degraded {
            let result = self
                .commit(Box::new(move |current| {
                    let items = as_array(current)
                        .into_iter()
                        .filter(|item| record_id_of(item) != Some(id))
                        .collect();
                    Value::Array(items)
                }))
                .await;
            match result {
                Ok(records) => {
                    state.records = records;
                    return present;
                }
                Err(e) => self.degrade(&mut state, &e),
            }
        }

        state.records.retain(|r| r.id() != id);
        present
    }

    /// Increment the attempt counter of a record in place.
    ///
    /// Returns the new count, or `None` if the record is not buffered.
    pub async fn record_attempt(&self, id: RecordId) -> Option<u32> {
        let mut state = self.state.lock().await;

        if !state.degraded {
            let result = self
                .commit(Box::new(move |current| {
                    let items = as_array(current)
                        .into_iter()
                        .map(|item| {
                            if record_id_of(&item) != Some(id) {
                                return item;
                            }
                            match serde_json::from_value::<PendingMutation>(item.clone()) {
                                Ok(mut record) => {
                                    record.record_attempt();
                                    serde_json::to_value(&record).unwrap_or(item)
                                }
                                Err(_) => item,
                            }
                        })
                        .collect();
                    Value::Array(items)
                }))
                .await;
            match result {
                Ok(records) => {
                    state.records = records;
                    return state
                        .records
                        .iter()
                        .find(|r| r.id() == id)
                        .map(PendingMutation::attempts);
                }
                Err(e) => self.degrade(&mut state, &e),
            }
        }

        let record = state.records.iter_mut().find(|r| r.id() == id)?;
        record.record_attempt();
        Some(record.attempts())
    }

    /// Empty the buffer atomically.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        if !state.degraded {
            if let Err(e) = self.store.delete(&self.key).await {
                self.degrade(&mut state, &e.into());
            }
        }
        state.records.clear();
    }

    async fn commit(
        &self,
        updater: crate::storage::Updater,
    ) -> Result<Vec<PendingMutation>, SyncError> {
        let committed = self.store.update(&self.key, updater).await?;
        decode(Some(committed))
    }

    fn degrade(&self, state: &mut BufferState, error: &SyncError) {
        if !state.degraded {
            tracing::warn!(
                key = %self.key,
                error = %error,
                "Storage failed, falling back to memory-only buffering for this session"
            );
        }
        state.degraded = true;
    }
}

fn decode(value: Option<Value>) -> Result<Vec<PendingMutation>, SyncError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v).map_err(SyncError::from),
    }
}

fn as_array(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn record_id_of(item: &Value) -> Option<RecordId> {
    item.get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}
