//! Builder pattern for constructing a [`Gateway`] with explicit configuration.

use std::sync::Arc;
use thiserror::Error;

use super::{retry::RetryPolicy, Gateway, GatewayInner};
use crate::{
    cache::{InProcessCache, RequestCollapser},
    config::{AppConfig, GatewayConfig, ProviderConfig},
    types::Provider,
    upstream::{HttpClient, HttpClientConfig, ProviderLimits, ProviderRegistry},
};

/// Errors that can occur during gateway construction.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// HTTP client initialization failed
    #[error("Failed to initialize HTTP client: {0}")]
    HttpClientInit(String),

    #[error("No providers registered")]
    NoProviders,
}

/// Builder for constructing a [`Gateway`].
///
/// Each call to [`build`](Self::build) yields an independent gateway with its own cache,
/// collapser, and provider states, so tests can create a fresh one per case.
///
/// # Examples
///
/// ```no_run
/// # use sluice_core::{config::ProviderConfig, gateway::GatewayBuilder};
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let gateway = GatewayBuilder::new()
///     .provider(ProviderConfig::new("edgar", "https://data.sec.gov", 10, 1_000, 100))
///     .cache_capacity(5_000)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct GatewayBuilder {
    config: GatewayConfig,
    providers: Vec<ProviderConfig>,
    http: Option<Arc<HttpClient>>,
}

impl GatewayBuilder {
    /// Creates a new builder with default settings and no providers.
    #[must_use]
    pub fn new() -> Self {
        Self { config: GatewayConfig::default(), providers: Vec::new(), http: None }
    }

    /// Seeds the builder from the `gateway` and `providers` sections of the app config.
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self { config: config.gateway.clone(), providers: config.providers.clone(), http: None }
    }

    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn stale_multiplier(mut self, multiplier: u32) -> Self {
        self.config.stale_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.rate_limit_retries = policy.rate_limit_retries;
        self.config.timeout_retries = policy.timeout_retries;
        self.config.upstream_retries = policy.upstream_retries;
        self.config.retry_base_delay_ms =
            u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets a shared HTTP client (default: one built from the gateway config).
    #[must_use]
    pub fn http_client(mut self, client: Arc<HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    /// Builds the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError`] if no provider is registered or the HTTP client fails to build.
    pub fn build(self) -> Result<Gateway, BuilderError> {
        if self.providers.is_empty() {
            return Err(BuilderError::NoProviders);
        }

        let http = match self.http {
            Some(http) => http,
            None => Arc::new(
                HttpClient::with_config(HttpClientConfig {
                    concurrent_limit: self.config.max_concurrent_requests,
                    user_agent: self.config.user_agent.clone(),
                    ..HttpClientConfig::default()
                })
                .map_err(|e| BuilderError::HttpClientInit(e.to_string()))?,
            ),
        };

        let registry = ProviderRegistry::new();
        for provider in &self.providers {
            registry.register(Provider::new(&provider.name), ProviderLimits::from(provider));
        }

        tracing::info!(
            providers = registry.len(),
            cache_capacity = self.config.cache_capacity,
            stale_multiplier = self.config.stale_multiplier,
            "gateway initialized"
        );

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                registry,
                cache: InProcessCache::new(self.config.cache_capacity, self.config.stale_multiplier),
                collapser: RequestCollapser::new(),
                http,
                retry: RetryPolicy::from(&self.config),
                dedup_max_age: self.config.dedup_max_age(),
            }),
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
