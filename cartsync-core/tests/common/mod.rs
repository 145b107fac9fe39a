//! Shared fixtures for cartsync-core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cartsync_core::{
    CartAddPayload, CartItem, DurableBuffer, InteractionPayload, MemoryStore, PendingMutation,
    RemoteApi, RemoteError,
};

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// `POST /cart/items`.
    AddCartItem(CartAddPayload),
    /// `POST /user-interactions/batch` with the event types in order.
    SubmitBatch(Vec<String>),
}

/// In-process storefront backend with scripted failures.
#[derive(Default)]
pub struct MockStorefront {
    cart_script: Mutex<VecDeque<Result<(), RemoteError>>>,
    batch_script: Mutex<VecDeque<Result<(), RemoteError>>>,
    latency: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl MockStorefront {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Self::default()
        })
    }

    /// Results for the next cart calls, in order. Unscripted calls succeed.
    pub fn script_cart(&self, results: Vec<Result<(), RemoteError>>) {
        self.cart_script.lock().expect("lock").extend(results);
    }

    /// Results for the next batch calls, in order. Unscripted calls succeed.
    pub fn script_batches(&self, results: Vec<Result<(), RemoteError>>) {
        self.batch_script.lock().expect("lock").extend(results);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn cart_calls(&self) -> Vec<CartAddPayload> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCartItem(p) => Some(p),
                Call::SubmitBatch(_) => None,
            })
            .collect()
    }

    pub fn batch_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SubmitBatch(b) => Some(b),
                Call::AddCartItem(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl RemoteApi for MockStorefront {
    async fn add_cart_item(&self, item: &CartAddPayload) -> Result<CartItem, RemoteError> {
        self.calls.lock().expect("lock").push(Call::AddCartItem(*item));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.cart_script.lock().expect("lock").pop_front();
        next.unwrap_or(Ok(())).map(|()| CartItem {
            id: serde_json::json!(1),
            variant_id: item.variant_id,
            quantity: item.quantity,
        })
    }

    async fn submit_interactions(&self, batch: &[InteractionPayload]) -> Result<(), RemoteError> {
        self.calls.lock().expect("lock").push(Call::SubmitBatch(
            batch.iter().map(|e| e.interaction_type.clone()).collect(),
        ));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.batch_script.lock().expect("lock").pop_front();
        next.unwrap_or(Ok(()))
    }
}

pub fn network_down() -> Result<(), RemoteError> {
    Err(RemoteError::NetworkUnavailable("connection refused".into()))
}

pub fn cart(variant_id: u64, quantity: u32) -> CartAddPayload {
    CartAddPayload {
        variant_id,
        quantity,
    }
}

/// Buffer over a fresh in-memory store, pre-filled with `records`.
pub async fn buffer_with(records: &[PendingMutation]) -> (MemoryStore, DurableBuffer) {
    let store = MemoryStore::new();
    let buffer = DurableBuffer::open(Arc::new(store.clone())).await;
    for record in records {
        buffer.append(record.clone()).await;
    }
    (store, buffer)
}
