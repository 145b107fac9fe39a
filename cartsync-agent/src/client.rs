//! Storefront REST client.
//!
//! Implements [`RemoteApi`] over HTTP. Status codes are classified once
//! here so the replay engine only ever sees two kinds of failure:
//!
//! - 4xx (other than 408 and 429) means the server refused the record and
//!   retrying cannot help: [`RemoteError::ServerRejected`].
//! - Anything else (connect errors, timeouts, 408, 429, 5xx) is treated as
//!   the network being unavailable: [`RemoteError::NetworkUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cartsync_core::{CartAddPayload, CartItem, InteractionPayload, RemoteApi, RemoteError};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use url::Url;

use crate::probe::Reachability;

/// Path of the cart item endpoint, relative to the API base.
pub const CART_ITEMS_PATH: &str = "cart/items";
/// Path of the interaction batch endpoint, relative to the API base.
pub const INTERACTION_BATCH_PATH: &str = "user-interactions/batch";
/// Path of the health endpoint, relative to the API base.
pub const HEALTH_PATH: &str = "health";

/// Client construction errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The base URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Storefront client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL, e.g. `https://shop.example.com/api`.
    pub base_url: String,
    /// Bearer token, if the API requires one.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Settings for `base_url` with no token and the default timeout.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: cartsync_core::DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl From<&crate::config::AgentConfig> for ClientConfig {
    fn from(config: &crate::config::AgentConfig) -> Self {
        Self {
            base_url: config.api_url.clone(),
            token: config.api_token.clone(),
            timeout: config.request_timeout,
        }
    }
}

/// HTTP client for the storefront backend.
#[derive(Clone)]
pub struct StorefrontClient {
    inner: Arc<InnerClient>,
}

struct InnerClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl std::fmt::Debug for StorefrontClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorefrontClient")
            .field("base", &self.inner.base.as_str())
            .field("authenticated", &self.inner.token.is_some())
            .finish()
    }
}

impl StorefrontClient {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if the base URL is malformed and
    /// [`ClientError::Http`] if the HTTP client fails to build.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut base =
            Url::parse(&config.base_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(format!(
                "{} cannot be used as a base URL",
                config.base_url
            )));
        }
        // `Url::join` replaces the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(format!("cartsync-agent/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(InnerClient {
                http,
                base,
                token: config.token,
            }),
        })
    }

    /// The normalised base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.inner.base
    }

    /// Whether `GET {base}/health` answers with a success status.
    pub async fn check_health(&self) -> bool {
        let Ok(url) = self.endpoint(HEALTH_PATH) else {
            return false;
        };
        match self.authorized(self.inner.http.get(url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Storefront health check failed");
                false
            }
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.inner
            .base
            .join(path)
            .map_err(|e| RemoteError::NetworkUnavailable(format!("invalid endpoint {path}: {e}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.inner.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_json<B: serde::Serialize + ?Sized + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, RemoteError> {
        let url = self.endpoint(path)?;
        let response = self
            .authorized(self.inner.http.post(url).json(body))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, message))
    }
}

/// Map a non-success status to a [`RemoteError`].
///
/// Client errors are rejections, except timeouts, rate limiting and
/// authentication failures: a record refused because the session expired
/// stays queued until the client signs in again.
#[must_use]
pub fn classify_status(status: StatusCode, message: String) -> RemoteError {
    let message = if message.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        message
    };

    let transient = matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
    );
    if status.is_client_error() && !transient {
        RemoteError::ServerRejected {
            status: status.as_u16(),
            message,
        }
    } else {
        RemoteError::NetworkUnavailable(format!("HTTP {}: {message}", status.as_u16()))
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::NetworkUnavailable(format!("request timed out: {e}"))
    } else {
        RemoteError::NetworkUnavailable(e.to_string())
    }
}

#[async_trait]
impl RemoteApi for StorefrontClient {
    async fn add_cart_item(&self, item: &CartAddPayload) -> Result<CartItem, RemoteError> {
        let response = self.post_json(CART_ITEMS_PATH, item).await?;
        // The add already happened; an unexpected body must not cause a replay.
        match response.json::<CartItem>().await {
            Ok(created) => Ok(created),
            Err(e) => {
                tracing::debug!(variant_id = item.variant_id, error = %e, "Unreadable cart item body");
                Ok(CartItem {
                    id: serde_json::Value::Null,
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                })
            }
        }
    }

    async fn submit_interactions(&self, events: &[InteractionPayload]) -> Result<(), RemoteError> {
        self.post_json(INTERACTION_BATCH_PATH, events).await?;
        Ok(())
    }
}

#[async_trait]
impl Reachability for StorefrontClient {
    async fn is_reachable(&self) -> bool {
        self.check_health().await
    }
}
