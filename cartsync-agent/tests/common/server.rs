//! Test agent harness for integration tests.
//!
//! Spins up the real control API on a random port, wired to a storefront
//! URL (usually a `wiremock::MockServer`).

use std::net::SocketAddr;
use std::sync::Arc;

use cartsync_agent::{open_store, routes, AgentConfig, AppState, ClientConfig, StorefrontClient};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running agent with control handles.
pub struct TestAgent {
    addr: SocketAddr,
    state: AppState,
    http: reqwest::Client,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestAgent {
    /// Start an agent talking to `storefront_uri` + `/api`.
    pub async fn start(storefront_uri: &str, start_online: bool) -> Self {
        let config =
            AgentConfig::new(format!("{storefront_uri}/api")).with_start_online(start_online);
        Self::start_with(config).await
    }

    /// Start an agent with a custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or the agent fails to bind.
    pub async fn start_with(config: AgentConfig) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let client =
            StorefrontClient::new(ClientConfig::from(&config)).expect("storefront client");
        let store = open_store(&config).expect("queue store");
        let state = AppState::build(&config, Arc::new(client), store).await;
        let app = routes::router(state.clone());

        let listener = TcpListener::bind(addr).await.expect("failed to bind");
        let actual_addr = listener.local_addr().expect("failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        // Give the server a moment to start
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            addr: actual_addr,
            state,
            http: reqwest::Client::new(),
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// The agent's socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL of a control API path.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Shared state, for assertions.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// HTTP client for talking to the agent.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `GET` a path and parse the JSON body.
    pub async fn get_json(&self, path: &str) -> (u16, serde_json::Value) {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .expect("request should succeed");
        let status = response.status().as_u16();
        (status, response.json().await.expect("JSON body"))
    }

    /// `POST` a JSON body and parse the JSON response.
    pub async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> (u16, serde_json::Value) {
        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request should succeed");
        let status = response.status().as_u16();
        (status, response.json().await.expect("JSON body"))
    }

    /// `PUT` a JSON body and parse the JSON response.
    pub async fn put_json(&self, path: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
        let response = self
            .http
            .put(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("request should succeed");
        let status = response.status().as_u16();
        (status, response.json().await.expect("JSON body"))
    }

    /// Poll `/cart/pending` until it reports `expected` records.
    pub async fn wait_for_pending(&self, expected: u64) -> bool {
        for _ in 0..200 {
            let (_, body) = self.get_json("/cart/pending").await;
            if body["count"] == expected {
                return true;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        false
    }

    /// Dispose the agent's state and stop the server.
    pub async fn shutdown(mut self) {
        self.state.shutdown().await;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), self.handle).await;
    }
}
