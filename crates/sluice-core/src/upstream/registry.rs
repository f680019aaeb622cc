use dashmap::DashMap;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    config::ProviderConfig,
    types::Provider,
    upstream::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerState},
        throttle::{Throttle, ThrottleLimits, ThrottleSnapshot},
    },
};

/// Static per-provider limits derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLimits {
    pub base_url: String,
    pub throttle: ThrottleLimits,
    pub breaker_threshold: u32,
    pub breaker_reset: Duration,
    pub request_timeout: Duration,
}

impl From<&ProviderConfig> for ProviderLimits {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            throttle: ThrottleLimits {
                max_requests: config.max_requests,
                window: Duration::from_millis(config.window_ms),
                min_interval: Duration::from_millis(config.min_interval_ms),
                max_backoff_exponent: config.max_backoff_exponent,
            },
            breaker_threshold: config.circuit_breaker_threshold,
            breaker_reset: Duration::from_millis(config.circuit_breaker_reset_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

/// Lock-free counters behind [`ProviderStats`].
#[derive(Debug, Default)]
pub struct ProviderCounters {
    pub upstream_calls: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub deduplicated: AtomicU64,
    pub misses: AtomicU64,
}

impl ProviderCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the gateway owns for one provider: its throttle, its breaker, and its counters.
///
/// Never shared across providers.
pub struct ProviderState {
    provider: Provider,
    limits: ProviderLimits,
    throttle: Throttle,
    breaker: CircuitBreaker,
    counters: ProviderCounters,
}

impl ProviderState {
    #[must_use]
    pub fn new(provider: Provider, limits: ProviderLimits) -> Self {
        let throttle = Throttle::new(provider.clone(), limits.throttle);
        let breaker =
            CircuitBreaker::new(provider.clone(), limits.breaker_threshold, limits.breaker_reset);
        Self { provider, limits, throttle, breaker, counters: ProviderCounters::default() }
    }

    #[must_use]
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    #[must_use]
    pub fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    #[must_use]
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn counters(&self) -> &ProviderCounters {
        &self.counters
    }

    /// Builds the provider section of the gateway stats.
    pub async fn stats(&self) -> ProviderStats {
        let throttle = self.throttle.snapshot();
        let breaker_state = self.breaker.get_state().await;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let cache_hits = load(&self.counters.cache_hits);
        let stale_hits = load(&self.counters.stale_hits);
        let deduplicated = load(&self.counters.deduplicated);
        let misses = load(&self.counters.misses);
        let answered = cache_hits + stale_hits + deduplicated + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if answered == 0 {
            0.0
        } else {
            (cache_hits + stale_hits + deduplicated) as f64 / answered as f64
        };

        ProviderStats {
            provider: self.provider.clone(),
            throttle,
            breaker_state,
            upstream_calls: load(&self.counters.upstream_calls),
            upstream_errors: load(&self.counters.upstream_errors),
            cache_hits,
            stale_hits,
            deduplicated,
            misses,
            hit_rate,
        }
    }
}

/// Per-provider view returned by the gateway's stats call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub provider: Provider,
    #[serde(flatten)]
    pub throttle: ThrottleSnapshot,
    pub breaker_state: CircuitBreakerState,
    pub upstream_calls: u64,
    pub upstream_errors: u64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub deduplicated: u64,
    pub misses: u64,
    /// Share of answers served without this caller going upstream.
    pub hit_rate: f64,
}

/// Registry of provider states keyed by provider name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<Provider, Arc<ProviderState>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from provider configuration.
    #[must_use]
    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.register(Provider::new(&config.name), ProviderLimits::from(config));
        }
        registry
    }

    /// Registers (or replaces) a provider and returns its state.
    pub fn register(&self, provider: Provider, limits: ProviderLimits) -> Arc<ProviderState> {
        let state = Arc::new(ProviderState::new(provider.clone(), limits));
        self.providers.insert(provider.clone(), Arc::clone(&state));
        tracing::debug!(provider = %provider, "provider registered");
        state
    }

    #[must_use]
    pub fn get(&self, provider: &Provider) -> Option<Arc<ProviderState>> {
        self.providers.get(provider).map(|entry| Arc::clone(entry.value()))
    }

    /// All registered providers, sorted by name.
    #[must_use]
    pub fn providers(&self) -> Vec<Arc<ProviderState>> {
        let mut states: Vec<_> =
            self.providers.iter().map(|entry| Arc::clone(entry.value())).collect();
        states.sort_by(|a, b| a.provider().cmp(b.provider()));
        states
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
