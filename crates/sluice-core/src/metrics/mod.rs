//! # Metrics
//!
//! Prometheus counters and gauges recorded through the `metrics` facade.
//!
//! Recording functions are free functions so the gateway and sync engine can call them without
//! holding a collector; with no recorder installed they are no-ops. [`MetricsCollector`] installs
//! the process-wide Prometheus recorder once and renders the text exposition for `/metrics`.
//!
//! ## Label interning
//!
//! Provider names are interned to avoid per-request allocations. The set of providers is fixed
//! by configuration, so the leak is bounded.

use crate::{
    gateway::GatewayError,
    types::FetchSource,
    upstream::{circuit_breaker::CircuitBreakerState, errors::UpstreamError},
};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::{borrow::Cow, sync::OnceLock};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

static PROVIDER_NAME_POOL: OnceLock<dashmap::DashMap<String, &'static str>> = OnceLock::new();

#[inline]
fn provider_to_static(provider: &str) -> Cow<'static, str> {
    let pool = PROVIDER_NAME_POOL.get_or_init(dashmap::DashMap::new);

    if let Some(interned) = pool.get(provider) {
        return Cow::Borrowed(*interned);
    }

    let owned = provider.to_string();
    let leaked: &'static str = Box::leak(owned.clone().into_boxed_str());
    pool.insert(owned, leaked);
    Cow::Borrowed(leaked)
}

/// Maps a state or error onto a metric label and gauge value.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
    fn as_gauge_value(&self) -> f64;
}

impl MetricsState for CircuitBreakerState {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 0.5,
        }
    }
}

impl MetricsState for UpstreamError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Http { status, .. } if *status >= 500 => "http_5xx",
            Self::Http { .. } => "http_4xx",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        if self.is_transient() {
            0.5
        } else {
            1.0
        }
    }
}

impl MetricsState for GatewayError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "unknown_provider",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::Upstream { .. } => "upstream",
            Self::NotFound { .. } => "not_found",
            Self::Decode(_) => "decode",
            Self::Cancelled(_) => "cancelled",
        }
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::CircuitOpen { .. } | Self::ProviderUnavailable { .. } => 1.0,
            _ => 0.5,
        }
    }
}

/// Counts one `cached_fetch` answer by where it came from.
pub fn record_fetch(provider: &str, source: FetchSource) {
    counter!("gateway_requests_total", "provider" => provider_to_static(provider), "source" => source.as_str())
        .increment(1);
}

/// Counts one outbound call attempt.
pub fn record_upstream_call(provider: &str) {
    counter!("gateway_upstream_calls_total", "provider" => provider_to_static(provider))
        .increment(1);
}

pub fn record_upstream_error(provider: &str, error: &UpstreamError) {
    counter!("gateway_upstream_errors_total", "provider" => provider_to_static(provider), "error_type" => error.as_metric_str())
        .increment(1);
}

/// Counts a failed fetch answered from a held cache value.
pub fn record_stale_fallback(provider: &str) {
    counter!("gateway_stale_fallbacks_total", "provider" => provider_to_static(provider))
        .increment(1);
}

pub fn record_breaker_state(provider: &str, state: CircuitBreakerState) {
    gauge!("gateway_breaker_state", "provider" => provider_to_static(provider))
        .set(state.as_gauge_value());
}

pub fn record_sync_run(provider: &str, success: bool, rows_upserted: u64) {
    let status = if success { "success" } else { "failed" };
    counter!("sync_runs_total", "provider" => provider_to_static(provider), "status" => status)
        .increment(1);
    if rows_upserted > 0 {
        counter!("sync_rows_upserted_total", "provider" => provider_to_static(provider))
            .increment(rows_upserted);
    }
}

fn try_init_prometheus_recorder(
) -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match try_init_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to install primary Prometheus recorder, attempting fallback"
                );

                let recorder = PrometheusBuilder::new().build_recorder();
                tracing::warn!(
                    "Using fallback Prometheus recorder (install error: {e}) - metrics may not be globally visible"
                );
                recorder.handle()
            }
        })
        .clone()
}

/// Owns the process-wide Prometheus handle.
#[derive(Clone)]
pub struct MetricsCollector {
    prometheus_handle: PrometheusHandle,
}

impl MetricsCollector {
    /// Installs the global recorder on first use and returns a handle to it.
    #[must_use]
    pub fn new() -> Self {
        Self { prometheus_handle: init_prometheus_recorder() }
    }

    /// Renders the Prometheus text exposition format.
    #[must_use]
    pub fn get_prometheus_metrics(&self) -> String {
        self.prometheus_handle.render()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
