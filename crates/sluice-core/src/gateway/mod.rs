//! # Gateway
//!
//! Composes the per-provider throttle and breaker, the in-process cache, and the request
//! collapser behind one call: [`Gateway::cached_fetch`].
//!
//! ```text
//! cached_fetch(provider, key, fetch, ttl, options)
//!   │
//!   ├─ cache.get(key) ── Fresh ──────────────────────────────► source = cache
//!   │                 └─ Stale + allow_stale ─► spawn bg:key ─► source = stale
//!   │
//!   ├─ collapser.join_or_start(key)
//!   │     ├─ Joined ─────────────────────────────────────────► source = deduplicated
//!   │     └─ Leader ─► loop {
//!   │                    throttle.acquire()          (unless skip_rate_limit)
//!   │                    breaker.allow()?            (CircuitOpen: fail fast)
//!   │                    timeout(fetch())
//!   │                    retry policy on failure
//!   │                  }
//!   │                  cache.put(key) ───────────────────────► source = api
//!   │
//!   └─ on error: serve any held value for key ───────────────► source = stale
//!                (not for CircuitOpen / NotFound)
//! ```
//!
//! Values are held as `Arc<serde_json::Value>` so one cache serves every payload type; callers
//! get them back decoded into their own `T`.

pub mod builder;
pub mod errors;
pub mod retry;

pub use builder::{BuilderError, GatewayBuilder};
pub use errors::GatewayError;
pub use retry::{RetryPolicy, RetryState};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    cache::{CacheStats, CachedValue, InProcessCache, Lookup, RequestCollapser, Slot},
    metrics,
    types::{CacheKey, FetchOptions, FetchSource, Fetched, Provider},
    upstream::{
        registry::ProviderCounters, HttpClient, ProviderRegistry, ProviderState, ProviderStats,
        UpstreamError,
    },
};

/// Shared, immutable cached payload.
pub type Payload = Arc<Value>;

type FetchOutcome = Result<(Payload, DateTime<Utc>), GatewayError>;

type RawFetch = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, UpstreamError>> + Send + Sync>;

/// Everything one leader needs to run a fetch on its own.
#[derive(Clone)]
struct FetchRequest {
    state: Arc<ProviderState>,
    key: CacheKey,
    fetch: RawFetch,
    ttl: Duration,
    options: FetchOptions,
}

/// Snapshot returned by [`Gateway::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub providers: Vec<ProviderStats>,
    pub cache: CacheStats,
    pub in_flight: usize,
}

pub(crate) struct GatewayInner {
    pub(crate) registry: ProviderRegistry,
    pub(crate) cache: InProcessCache<Payload>,
    pub(crate) collapser: RequestCollapser<FetchOutcome>,
    pub(crate) http: Arc<HttpClient>,
    pub(crate) retry: RetryPolicy,
    pub(crate) dedup_max_age: Duration,
}

/// External data access gateway.
///
/// Cheap to clone; clones share the same cache, collapser, and provider states.
#[derive(Clone)]
pub struct Gateway {
    pub(crate) inner: Arc<GatewayInner>,
}

impl Gateway {
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Returns cached data for `key` or performs a throttled, breaker-guarded, deduplicated
    /// fetch through `fetch` and caches the result for `ttl`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownProvider`] if `provider` was never registered
    /// - [`GatewayError::CircuitOpen`] while the provider's breaker is open
    /// - [`GatewayError::NotFound`] if the provider reports the entity missing
    /// - [`GatewayError::ProviderUnavailable`], [`GatewayError::ProviderTimeout`] or
    ///   [`GatewayError::Upstream`] once retries are exhausted and no cached value can stand in
    /// - [`GatewayError::Decode`] if the payload does not deserialize into `T`
    pub async fn cached_fetch<T, F, Fut>(
        &self,
        provider: &Provider,
        key: &CacheKey,
        fetch: F,
        ttl: Duration,
        options: FetchOptions,
    ) -> Result<Fetched<T>, GatewayError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        let state = self.provider_state(provider)?;
        let counters = state.counters();

        if !options.force_refresh {
            match self.inner.cache.get(key) {
                Lookup::Fresh(cached) => {
                    ProviderCounters::incr(&counters.cache_hits);
                    metrics::record_fetch(provider.as_str(), FetchSource::Cache);
                    tracing::debug!(provider = %provider, key = %key, "cache hit");
                    return decode(&cached, FetchSource::Cache);
                }
                Lookup::Stale(cached) if options.allow_stale => {
                    ProviderCounters::incr(&counters.stale_hits);
                    metrics::record_fetch(provider.as_str(), FetchSource::Stale);
                    tracing::debug!(
                        provider = %provider,
                        key = %key,
                        age_ms = cached.age.as_millis() as u64,
                        "serving stale entry, refreshing in background"
                    );
                    self.refresh_in_background(FetchRequest {
                        state: Arc::clone(&state),
                        key: key.clone(),
                        fetch: erase(fetch),
                        ttl,
                        options,
                    });
                    return decode(&cached, FetchSource::Stale);
                }
                Lookup::Stale(_) | Lookup::Miss => {}
            }
        }

        let request =
            FetchRequest { state: Arc::clone(&state), key: key.clone(), fetch: erase(fetch), ttl, options };
        let inner = Arc::clone(&self.inner);
        let slot = self
            .inner
            .collapser
            .join_or_start(key, self.inner.dedup_max_age, move || inner.fetch_and_store(request));

        let (source, handle) = match slot {
            Slot::Leader(handle) => {
                ProviderCounters::incr(&counters.misses);
                (FetchSource::Api, handle)
            }
            Slot::Joined(handle) => {
                ProviderCounters::incr(&counters.deduplicated);
                (FetchSource::Deduplicated, handle)
            }
        };

        let outcome = handle
            .wait()
            .await
            .unwrap_or_else(|| Err(GatewayError::Cancelled(format!("fetch for {key} aborted"))));

        match outcome {
            Ok((payload, stored_at)) => {
                metrics::record_fetch(provider.as_str(), source);
                decode(&CachedValue { value: payload, stored_at, age: Duration::ZERO }, source)
            }
            Err(error) => self.fallback(provider, key, options, error),
        }
    }

    /// Returns the fresh or stale value `provider` holds for `key`, decoded into `T`.
    ///
    /// A key outside `provider`'s namespace yields `None`.
    #[must_use]
    pub fn get_cached<T: DeserializeOwned>(
        &self,
        provider: &Provider,
        key: &CacheKey,
    ) -> Option<T> {
        if !key.belongs_to(provider) {
            return None;
        }
        match self.inner.cache.get(key) {
            Lookup::Fresh(cached) | Lookup::Stale(cached) => T::deserialize(cached.value.as_ref()).ok(),
            Lookup::Miss => None,
        }
    }

    /// Stores a value directly, as if it had just been fetched.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Decode`] if `value` cannot be serialized.
    pub fn set_cache<T: Serialize>(
        &self,
        key: CacheKey,
        value: &T,
        ttl: Duration,
        stale_duration: Option<Duration>,
    ) -> Result<(), GatewayError> {
        let payload =
            serde_json::to_value(value).map_err(|e| GatewayError::Decode(e.to_string()))?;
        self.inner.cache.put(key, Arc::new(payload), ttl, stale_duration);
        Ok(())
    }

    /// Drops one cached entry. Returns `true` if it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.inner.cache.invalidate(key);
        tracing::debug!(key = %key, removed, "cache entry invalidated");
        removed
    }

    /// Drops every cached entry owned by `provider`.
    pub fn invalidate_provider(&self, provider: &Provider) -> usize {
        let removed = self.inner.cache.invalidate_provider(provider);
        tracing::info!(provider = %provider, removed, "provider cache invalidated");
        removed
    }

    /// Drops entries past their stale window. Run periodically by the server.
    pub fn purge_expired(&self) -> usize {
        self.inner.cache.purge_expired()
    }

    /// Per-provider utilization, hit rate and breaker state, plus cache occupancy.
    pub async fn stats(&self) -> GatewayStats {
        let mut providers = Vec::with_capacity(self.inner.registry.len());
        for state in self.inner.registry.providers() {
            providers.push(state.stats().await);
        }
        GatewayStats {
            providers,
            cache: self.inner.cache.stats(),
            in_flight: self.inner.collapser.in_flight(),
        }
    }

    /// Shared outbound HTTP client, for provider adapters.
    #[must_use]
    pub fn http(&self) -> &Arc<HttpClient> {
        &self.inner.http
    }

    /// Looks up a registered provider.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownProvider`] if `provider` was never registered.
    pub fn provider_state(&self, provider: &Provider) -> Result<Arc<ProviderState>, GatewayError> {
        self.inner
            .registry
            .get(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))
    }

    #[must_use]
    pub fn providers(&self) -> Vec<Provider> {
        self.inner.registry.providers().iter().map(|state| state.provider().clone()).collect()
    }

    fn refresh_in_background(&self, request: FetchRequest) {
        let inner = Arc::clone(&self.inner);
        let key = request.key.background();
        // Detached: the slot handle is dropped, the spawned work still completes
        let _ = self.inner.collapser.join_or_start(&key, self.inner.dedup_max_age, move || async move {
            let key = request.key.clone();
            let provider = request.state.provider().clone();
            let outcome = inner.fetch_and_store(request).await;
            if let Err(error) = &outcome {
                tracing::warn!(
                    provider = %provider,
                    key = %key,
                    error = %error,
                    "background refresh failed"
                );
            }
            outcome
        });
    }

    fn fallback<T: DeserializeOwned>(
        &self,
        provider: &Provider,
        key: &CacheKey,
        options: FetchOptions,
        error: GatewayError,
    ) -> Result<Fetched<T>, GatewayError> {
        if options.serve_stale_on_error && error.allows_stale_fallback() {
            if let Some(cached) = self.inner.cache.peek_any(key) {
                tracing::warn!(
                    provider = %provider,
                    key = %key,
                    error = %error,
                    age_ms = cached.age.as_millis() as u64,
                    "upstream failed, serving cached value"
                );
                metrics::record_stale_fallback(provider.as_str());
                metrics::record_fetch(provider.as_str(), FetchSource::Stale);
                return decode(&cached, FetchSource::Stale);
            }
        }
        Err(error)
    }
}

impl GatewayInner {
    async fn fetch_and_store(self: Arc<Self>, request: FetchRequest) -> FetchOutcome {
        let value = self.fetch_with_retry(&request).await?;
        let payload = Arc::new(value);
        let stored_at = self.cache.put(
            request.key.clone(),
            Arc::clone(&payload),
            request.ttl,
            request.options.stale_duration,
        );
        Ok((payload, stored_at))
    }

    async fn fetch_with_retry(&self, request: &FetchRequest) -> Result<Value, GatewayError> {
        let state = &request.state;
        let provider = state.provider();
        let timeout = state.limits().request_timeout;
        let mut retry = RetryState::default();

        loop {
            if !request.options.skip_rate_limit {
                let waited = state.throttle().acquire().await;
                if !waited.is_zero() {
                    tracing::trace!(
                        provider = %provider,
                        waited_ms = waited.as_millis() as u64,
                        "throttled"
                    );
                }
            }

            if let Err(open) = state.breaker().allow().await {
                metrics::record_breaker_state(provider.as_str(), state.breaker().get_state().await);
                return Err(GatewayError::CircuitOpen {
                    provider: provider.clone(),
                    remaining: open.remaining,
                });
            }

            ProviderCounters::incr(&state.counters().upstream_calls);
            metrics::record_upstream_call(provider.as_str());

            let result = match tokio::time::timeout(timeout, (request.fetch)()).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout),
            };

            let error = match result {
                Ok(value) => {
                    self.record_success(state).await;
                    return Ok(value);
                }
                Err(UpstreamError::NotFound(entity)) => {
                    // A healthy provider answering "no such entity"
                    self.record_success(state).await;
                    tracing::debug!(provider = %provider, entity = %entity, "entity not found");
                    return Err(GatewayError::NotFound {
                        provider: provider.clone(),
                        entity: request.key.to_string(),
                    });
                }
                Err(error) => error,
            };

            ProviderCounters::incr(&state.counters().upstream_errors);
            metrics::record_upstream_error(provider.as_str(), &error);
            state.throttle().on_failure();
            if error.should_trip_breaker() {
                state.breaker().on_failure().await;
                metrics::record_breaker_state(provider.as_str(), state.breaker().get_state().await);
            }

            match self.retry.next_delay(&error, &mut retry) {
                Some(delay) => {
                    tracing::warn!(
                        provider = %provider,
                        key = %request.key,
                        error = %error,
                        attempt = retry.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::warn!(
                        provider = %provider,
                        key = %request.key,
                        error = %error,
                        attempts = retry.attempts,
                        "upstream call failed"
                    );
                    return Err(self.retry.exhausted(provider, request.key.as_str(), error, &retry));
                }
            }
        }
    }

    async fn record_success(&self, state: &ProviderState) {
        state.throttle().on_success();
        state.breaker().on_success().await;
        metrics::record_breaker_state(state.provider().as_str(), state.breaker().get_state().await);
    }
}

/// Type-erases a caller's fetch function into one producing JSON.
fn erase<T, F, Fut>(fetch: F) -> RawFetch
where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
{
    let fetch = Arc::new(fetch);
    Arc::new(move || {
        let fut = fetch();
        Box::pin(async move {
            let data = fut.await?;
            serde_json::to_value(data)
                .map_err(|e| UpstreamError::InvalidResponse(format!("unserializable payload: {e}")))
        })
    })
}

fn decode<T: DeserializeOwned>(
    cached: &CachedValue<Payload>,
    source: FetchSource,
) -> Result<Fetched<T>, GatewayError> {
    let data = T::deserialize(cached.value.as_ref()).map_err(|e| GatewayError::Decode(e.to_string()))?;
    Ok(Fetched { data, source, fetched_at: cached.stored_at })
}
