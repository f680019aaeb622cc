//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: Hardcoded in struct `Default` implementations
//! 2. **Config file**: TOML file specified by `SLUICE_CONFIG` env var
//! 3. **Environment variables**: `SLUICE__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: HTTP server settings
//! - [`GatewayConfig`]: in-process cache sizing, stale window, retry budgets, identifying header
//! - [`ProviderConfig`]: per-provider pacing and circuit breaker settings
//! - [`TtlPresets`]: named TTLs per data category
//! - [`StoreConfig`]: durable store location and refresh-log retention
//! - [`SourceConfig`]: provider adapters feeding the durable store
//! - [`MetricsConfig`] / [`LoggingConfig`]
//!
//! # Example
//!
//! ```toml
//! [gateway]
//! cache_capacity = 5000
//! user_agent = "sluice/0.1 ops@example.com"
//!
//! [[providers]]
//! name = "edgar"
//! base_url = "https://data.sec.gov"
//! max_requests = 10
//! window_ms = 1000
//! min_interval_ms = 100
//! ```

use crate::sources::SourceConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};
use thiserror::Error;

/// Rejected configuration, reported at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("no providers configured")]
    NoProviders,

    #[error("duplicate provider name: {0}")]
    DuplicateProvider(String),

    #[error("invalid base URL for provider {provider}: {url}")]
    InvalidBaseUrl { provider: String, url: String },

    #[error("provider {provider}: {reason}")]
    InvalidProvider { provider: String, reason: String },

    #[error("source {source_name} references undefined provider {provider}")]
    UnknownSourceProvider { source_name: String, provider: String },

    #[error("source {source_name}: {reason}")]
    InvalidSource { source_name: String, reason: String },

    #[error("unknown TTL preset: {0}")]
    UnknownTtlPreset(String),

    #[error("{0}")]
    Invalid(String),
}

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind the server to. Defaults to `127.0.0.1`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port number to listen on. Must be greater than 0. Defaults to `3030`.
    pub bind_port: u16,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

/// Gateway-wide cache and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum entries held by the in-process cache. Defaults to `10000`.
    pub cache_capacity: usize,

    /// Stale window as a multiple of TTL when a call does not set its own. Defaults to `4`.
    pub stale_multiplier: u32,

    /// In-flight fetches older than this are not joined by new callers. Defaults to `30000`.
    pub dedup_max_age_ms: u64,

    /// Retries after an upstream 429 before surfacing `ProviderUnavailable`. Defaults to `3`.
    pub rate_limit_retries: u32,

    /// Retries after a timeout before surfacing `ProviderTimeout`. Defaults to `2`.
    pub timeout_retries: u32,

    /// Retries after a 5xx or connection failure. Defaults to `2`.
    pub upstream_retries: u32,

    /// Base delay for exponential retry backoff. Defaults to `500`.
    pub retry_base_delay_ms: u64,

    /// Identifying `User-Agent`: application name plus a contact address.
    pub user_agent: String,

    /// Maximum concurrent outbound requests across all providers. Defaults to `64`.
    pub max_concurrent_requests: usize,

    /// Interval of the expired-entry purge task. Defaults to `60`.
    pub purge_interval_seconds: u64,
}

impl GatewayConfig {
    #[must_use]
    pub fn dedup_max_age(&self) -> Duration {
        Duration::from_millis(self.dedup_max_age_ms)
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Pacing and failure settings for one external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identifier used in cache keys and metrics labels.
    pub name: String,

    /// Base URL that source paths are appended to. Must start with `http`.
    pub base_url: String,

    /// Requests allowed within one sliding window.
    pub max_requests: usize,

    /// Sliding window length in milliseconds.
    pub window_ms: u64,

    /// Minimum gap between consecutive requests. Defaults to `0`.
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Consecutive failures before the breaker opens. Defaults to `5`.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Cool-down before an open breaker admits a probe. Defaults to `60000`.
    #[serde(default = "default_circuit_breaker_reset_ms")]
    pub circuit_breaker_reset_ms: u64,

    /// Per-attempt request bound. Must be within 1-60s. Defaults to `20000`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Cap on the throttle's backoff exponent. Defaults to `4` (16x).
    #[serde(default = "default_max_backoff_exponent")]
    pub max_backoff_exponent: u32,
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_reset_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    20_000
}

fn default_max_backoff_exponent() -> u32 {
    4
}

impl ProviderConfig {
    /// Convenience constructor with default breaker and timeout settings.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        max_requests: usize,
        window_ms: u64,
        min_interval_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            max_requests,
            window_ms,
            min_interval_ms,
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_reset_ms: default_circuit_breaker_reset_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_backoff_exponent: default_max_backoff_exponent(),
        }
    }
}

/// Named TTLs per data category, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtlPresets {
    pub prices_seconds: u64,
    pub filings_seconds: u64,
    pub financials_seconds: u64,
    pub holdings_seconds: u64,
    pub lobbying_seconds: u64,
    pub spending_seconds: u64,
    pub company_seconds: u64,
}

impl TtlPresets {
    /// Looks up a preset by category name (`"prices"`, `"filings"`, ...).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Duration> {
        let seconds = match name {
            "prices" => self.prices_seconds,
            "filings" => self.filings_seconds,
            "financials" => self.financials_seconds,
            "holdings" => self.holdings_seconds,
            "lobbying" => self.lobbying_seconds,
            "spending" => self.spending_seconds,
            "company" | "companies" => self.company_seconds,
            _ => return None,
        };
        Some(Duration::from_secs(seconds))
    }
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `SQLite` database URL. Defaults to `sqlite://./db/sluice.db`.
    pub database_url: String,

    /// Refresh-log rows older than this are pruned. Defaults to `30`.
    pub refresh_log_retention_days: u32,

    /// Next-due interval after a failed sync. Defaults to `300`.
    pub failure_retry_seconds: u64,

    /// Interval of the refresh-log prune task. Defaults to `3600`.
    pub prune_interval_seconds: u64,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the recorder is installed and `/metrics` served. Defaults to `true`.
    pub enabled: bool,
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

/// Root application configuration containing all subsystem settings.
///
/// Environment overrides use the `SLUICE__` prefix with `__` as a separator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment (e.g., "development", "production"). Defaults to `"development"`.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub ttl_presets: TtlPresets,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new("edgar", "https://data.sec.gov", 10, 1_000, 100),
        ProviderConfig::new("lda", "https://lda.senate.gov/api/v1", 2, 1_000, 500),
        ProviderConfig::new("usaspending", "https://api.usaspending.gov/api/v2", 5, 1_000, 200),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), bind_port: 3030 }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            stale_multiplier: 4,
            dedup_max_age_ms: 30_000,
            rate_limit_retries: 3,
            timeout_retries: 2,
            upstream_retries: 2,
            retry_base_delay_ms: 500,
            user_agent: concat!("sluice/", env!("CARGO_PKG_VERSION"), " ops@example.com")
                .to_string(),
            max_concurrent_requests: 64,
            purge_interval_seconds: 60,
        }
    }
}

impl Default for TtlPresets {
    fn default() -> Self {
        Self {
            prices_seconds: 60,
            filings_seconds: 6 * 3600,
            financials_seconds: 24 * 3600,
            holdings_seconds: 24 * 3600,
            lobbying_seconds: 7 * 24 * 3600,
            spending_seconds: 7 * 24 * 3600,
            company_seconds: 30 * 24 * 3600,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let path = std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join("db")
            .join("sluice.db");

        Self {
            database_url: format!("sqlite://{}", path.display()),
            refresh_log_retention_days: 30,
            failure_retry_seconds: 300,
            prune_interval_seconds: 3600,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            providers: default_providers(),
            ttl_presets: TtlPresets::default(),
            store: StoreConfig::default(),
            sources: Vec::new(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `SLUICE__` prefix can override any configuration value.
    /// Use `__` as a separator for nested fields (e.g., `SLUICE__SERVER__BIND_PORT=8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let defaults = GatewayConfig::default();
        let store = StoreConfig::default();
        let presets = TtlPresets::default();

        let config_builder = Config::builder()
            .set_default("environment", "development")?
            .set_default("server.bind_address", "127.0.0.1")?
            .set_default("server.bind_port", 3030)?
            .set_default("gateway.cache_capacity", defaults.cache_capacity as u64)?
            .set_default("gateway.stale_multiplier", defaults.stale_multiplier)?
            .set_default("gateway.dedup_max_age_ms", defaults.dedup_max_age_ms)?
            .set_default("gateway.rate_limit_retries", defaults.rate_limit_retries)?
            .set_default("gateway.timeout_retries", defaults.timeout_retries)?
            .set_default("gateway.upstream_retries", defaults.upstream_retries)?
            .set_default("gateway.retry_base_delay_ms", defaults.retry_base_delay_ms)?
            .set_default("gateway.user_agent", defaults.user_agent)?
            .set_default("gateway.max_concurrent_requests", defaults.max_concurrent_requests as u64)?
            .set_default("gateway.purge_interval_seconds", defaults.purge_interval_seconds)?
            .set_default("ttl_presets.prices_seconds", presets.prices_seconds)?
            .set_default("ttl_presets.filings_seconds", presets.filings_seconds)?
            .set_default("ttl_presets.financials_seconds", presets.financials_seconds)?
            .set_default("ttl_presets.holdings_seconds", presets.holdings_seconds)?
            .set_default("ttl_presets.lobbying_seconds", presets.lobbying_seconds)?
            .set_default("ttl_presets.spending_seconds", presets.spending_seconds)?
            .set_default("ttl_presets.company_seconds", presets.company_seconds)?
            .set_default("store.database_url", store.database_url)?
            .set_default("store.refresh_log_retention_days", store.refresh_log_retention_days)?
            .set_default("store.failure_retry_seconds", store.failure_retry_seconds)?
            .set_default("store.prune_interval_seconds", store.prune_interval_seconds)?
            .set_default("metrics.enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("SLUICE").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `SLUICE_CONFIG` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("SLUICE_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Returns the parsed socket address for the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed into a valid [`SocketAddr`].
    ///
    /// [`SocketAddr`]: std::net::SocketAddr
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port).parse().map_err(|_| {
            format!("Invalid socket address: {}:{}", self.server.bind_address, self.server.bind_port)
        })
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigValidationError`] found.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.providers.is_empty() {
            return Err(ConfigValidationError::NoProviders);
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigValidationError::DuplicateProvider(provider.name.clone()));
            }
            if !provider.base_url.starts_with("http") {
                return Err(ConfigValidationError::InvalidBaseUrl {
                    provider: provider.name.clone(),
                    url: provider.base_url.clone(),
                });
            }
            let invalid = |reason: &str| ConfigValidationError::InvalidProvider {
                provider: provider.name.clone(),
                reason: reason.to_string(),
            };
            if provider.max_requests == 0 {
                return Err(invalid("max_requests must be greater than 0"));
            }
            if provider.window_ms == 0 {
                return Err(invalid("window_ms must be greater than 0"));
            }
            if provider.circuit_breaker_threshold == 0 {
                return Err(invalid("circuit_breaker_threshold must be greater than 0"));
            }
            if !(1_000..=60_000).contains(&provider.request_timeout_ms) {
                return Err(invalid("request_timeout_ms must be between 1000 and 60000"));
            }
        }

        if self.gateway.stale_multiplier < 1 {
            return Err(ConfigValidationError::Invalid(
                "stale_multiplier must be at least 1".to_string(),
            ));
        }

        if self.gateway.cache_capacity == 0 {
            return Err(ConfigValidationError::Invalid(
                "cache_capacity must be greater than 0".to_string(),
            ));
        }

        if self.gateway.user_agent.trim().is_empty() {
            return Err(ConfigValidationError::Invalid("user_agent must not be empty".to_string()));
        }

        for source in &self.sources {
            if !seen.contains(source.provider.as_str()) {
                return Err(ConfigValidationError::UnknownSourceProvider {
                    source_name: source.name.clone(),
                    provider: source.provider.clone(),
                });
            }
            source.validate()?;
            source.ttl.build(&self.ttl_presets)?;
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err(ConfigValidationError::Invalid(
                "Logging format must be 'json' or 'pretty'".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.environment, "development");
        assert_eq!(config.server.bind_port, 3030);
        assert_eq!(config.gateway.stale_multiplier, 4);
        assert_eq!(config.gateway.dedup_max_age(), Duration::from_secs(30));
        assert_eq!(config.store.refresh_log_retention_days, 30);
        assert_eq!(config.ttl_presets.get("lobbying"), Some(Duration::from_secs(604_800)));
        assert!(config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();

        config.providers.clear();
        assert_eq!(config.validate(), Err(ConfigValidationError::NoProviders));

        config.providers = vec![ProviderConfig::new("edgar", "ftp://nope", 10, 1_000, 0)];
        assert!(matches!(config.validate(), Err(ConfigValidationError::InvalidBaseUrl { .. })));

        config.providers = vec![
            ProviderConfig::new("edgar", "https://a", 10, 1_000, 0),
            ProviderConfig::new("edgar", "https://b", 10, 1_000, 0),
        ];
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DuplicateProvider("edgar".to_string()))
        );

        config.providers = vec![ProviderConfig::new("edgar", "https://a", 0, 1_000, 0)];
        assert!(matches!(config.validate(), Err(ConfigValidationError::InvalidProvider { .. })));

        let mut provider = ProviderConfig::new("edgar", "https://a", 10, 1_000, 0);
        provider.request_timeout_ms = 120_000;
        config.providers = vec![provider];
        assert!(matches!(config.validate(), Err(ConfigValidationError::InvalidProvider { .. })));
    }

    #[test]
    fn test_stale_multiplier_and_logging_format_validation() {
        let mut config = AppConfig::default();
        config.gateway.stale_multiplier = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[server]
bind_port = 8080

[gateway]
cache_capacity = 500
stale_multiplier = 2
dedup_max_age_ms = 10000
rate_limit_retries = 1
timeout_retries = 1
upstream_retries = 1
retry_base_delay_ms = 100
user_agent = "dash/1.0 team@example.com"
max_concurrent_requests = 8
purge_interval_seconds = 30

[[providers]]
name = "lda"
base_url = "https://lda.senate.gov/api/v1"
max_requests = 2
window_ms = 1000
min_interval_ms = 500
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.bind_port, 8080);
        assert_eq!(config.gateway.cache_capacity, 500);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].circuit_breaker_threshold, 5);
        assert_eq!(config.providers[0].request_timeout_ms, 20_000);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_ttl_presets_lookup() {
        let presets = TtlPresets::default();
        assert_eq!(presets.get("prices"), Some(Duration::from_secs(60)));
        assert_eq!(presets.get("companies"), presets.get("company"));
        assert_eq!(presets.get("weather"), None);
    }
}
