//! Shared fixtures for cartsync-agent integration tests.

#![allow(dead_code)]

mod server;

pub use server::TestAgent;

use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Storefront answering cart adds with `status`.
pub async fn mount_cart_items(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/api/cart/items"))
        .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
            "id": 1, "variant_id": 0, "quantity": 1
        })))
        .mount(server)
        .await;
}

/// Storefront answering interaction batches with `status`.
pub async fn mount_batch(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/api/user-interactions/batch"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// JSON bodies the storefront received on `endpoint`, in arrival order.
pub async fn bodies(server: &MockServer, endpoint: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .iter()
        .filter(|req| req.url.path() == endpoint)
        .map(|req| serde_json::from_slice(&req.body).expect("JSON body"))
        .collect()
}
