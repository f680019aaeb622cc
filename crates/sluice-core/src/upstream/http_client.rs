use reqwest::{header, Client, ClientBuilder, RequestBuilder, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{types::Provider, upstream::UpstreamError};

/// Maximum bytes of an error body kept in [`UpstreamError::Http`].
const MAX_ERROR_BODY_BYTES: usize = 256;

/// Configuration for the outbound HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of concurrent HTTP requests across all providers
    pub concurrent_limit: usize,
    /// Permit acquisition timeout in milliseconds
    pub permit_timeout_ms: u64,
    /// Identifying `User-Agent`: application name plus a contact address.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 64,
            permit_timeout_ms: 5_000,
            user_agent: concat!("sluice/", env!("CARGO_PKG_VERSION"), " ops@example.com")
                .to_string(),
        }
    }
}

/// Read-only JSON client shared by every provider adapter.
///
/// Performs exactly one attempt per call; retry and backoff belong to the gateway so that every
/// attempt passes through the throttle and circuit breaker.
pub struct HttpClient {
    client: Client,
    concurrent_limit: Arc<Semaphore>,
    config: HttpClientConfig,
}

/// RAII guard ensuring semaphore permits are always released.
struct PermitGuard {
    _permit: OwnedSemaphorePermit,
    semaphore: Arc<Semaphore>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        tracing::trace!(
            available_permits = self.semaphore.available_permits(),
            "permit guard dropped"
        );
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_config(HttpClientConfig::default())
    }

    /// Sanitizes network errors to prevent information disclosure.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_redirect() {
            "unexpected redirect".to_string()
        } else {
            "network error".to_string()
        }
    }

    /// Creates a new HTTP client with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(config: HttpClientConfig) -> Result<Self, UpstreamError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            client,
            concurrent_limit: Arc::new(Semaphore::new(config.concurrent_limit.max(1))),
            config,
        })
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    /// Sends a GET with query parameters and decodes the JSON body.
    ///
    /// # Errors
    ///
    /// See [`Self::post_json`].
    pub async fn get_json(
        &self,
        provider: &Provider,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let request = self.client.get(url).query(query);
        self.execute(provider, url, request, timeout).await
    }

    /// Sends a read-style POST with a JSON filter body and decodes the JSON response.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::RateLimited`] on HTTP 429, carrying `Retry-After` when present
    /// - [`UpstreamError::NotFound`] on HTTP 404
    /// - [`UpstreamError::Http`] for any other non-success status
    /// - [`UpstreamError::Timeout`] if permit acquisition or the request times out
    /// - [`UpstreamError::ConnectionFailed`] for transport failures
    /// - [`UpstreamError::InvalidResponse`] if the body is not JSON
    pub async fn post_json(
        &self,
        provider: &Provider,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let request = self.client.post(url).json(body);
        self.execute(provider, url, request, timeout).await
    }

    async fn execute(
        &self,
        provider: &Provider,
        url: &str,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.permit_timeout_ms),
            Arc::clone(&self.concurrent_limit).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                provider = %provider,
                available_permits = self.concurrent_limit.available_permits(),
                "http client semaphore acquisition timeout"
            );
            UpstreamError::Timeout
        })?
        .map_err(|_| UpstreamError::ConnectionFailed("http client closed".to_string()))?;

        let _guard = PermitGuard { _permit: permit, semaphore: Arc::clone(&self.concurrent_limit) };

        tracing::trace!(provider = %provider, url = url, "http request started");

        let response = request.timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::ConnectionFailed(Self::sanitize_network_error(&e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::ConnectionFailed(Self::sanitize_network_error(&e))
                }
            })?;
            return serde_json::from_slice(&bytes)
                .map_err(|e| UpstreamError::InvalidResponse(format!("invalid JSON body: {e}")));
        }

        tracing::trace!(provider = %provider, status = status.as_u16(), "http request failed");

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = parse_retry_after(response.headers());
                Err(UpstreamError::RateLimited { retry_after })
            }
            StatusCode::NOT_FOUND => Err(UpstreamError::NotFound(url.to_string())),
            _ => {
                let raw_text = response.text().await.unwrap_or_default();
                Err(UpstreamError::Http { status: status.as_u16(), body: truncate_body(raw_text) })
            }
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.concurrent_limit.available_permits()
    }
}

/// Parses a delay-seconds `Retry-After` header. HTTP-date values are ignored.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_body(mut text: String) -> String {
    if text.len() <= MAX_ERROR_BODY_BYTES {
        return text;
    }
    let mut cut = MAX_ERROR_BODY_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("... (truncated)");
    text
}
