//! Identifiers and request/response envelopes shared across the gateway.
//!
//! - [`Provider`]: one external data source with its own pacing and failure state
//! - [`CacheKey`]: `provider:entity[:params]`, identifies one cached value and one in-flight slot
//! - [`FetchOptions`] / [`Fetched`]: the `cached_fetch` request knobs and its tagged result

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// Separator between the segments of a [`CacheKey`].
pub const KEY_SEPARATOR: char = ':';

/// Namespace prefix for background stale refreshes in the request collapser.
const BACKGROUND_NAMESPACE: &str = "bg";

/// External data source identifier (filings registry, lobbying registry, pricing feed, ...).
///
/// Cheap to clone; the name is shared behind an `Arc<str>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provider(Arc<str>);

impl Provider {
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Provider {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Provider {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

/// Cache key composed of `provider:entity` plus optional sorted parameters.
///
/// The provider prefix lets [`crate::cache::InProcessCache::invalidate_provider`] drop every
/// key owned by one provider without a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds `provider:entity`.
    #[must_use]
    pub fn new(provider: &Provider, entity: &str) -> Self {
        Self(format!("{provider}{KEY_SEPARATOR}{entity}"))
    }

    /// Builds `provider:entity:k1=v1&k2=v2` with parameters sorted by name, so callers that pass
    /// the same parameters in a different order share one slot.
    #[must_use]
    pub fn with_params(provider: &Provider, entity: &str, params: &[(&str, &str)]) -> Self {
        if params.is_empty() {
            return Self::new(provider, entity);
        }
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort_unstable();
        let query =
            sorted.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
        Self(format!("{provider}{KEY_SEPARATOR}{entity}{KEY_SEPARATOR}{query}"))
    }

    /// Wraps an already-composed key. The caller is responsible for the `provider:` prefix.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this key is scoped to `provider`.
    #[must_use]
    pub fn belongs_to(&self, provider: &Provider) -> bool {
        self.0
            .strip_prefix(provider.as_str())
            .is_some_and(|rest| rest.starts_with(KEY_SEPARATOR))
    }

    /// Key used to register a stale background refresh in the request collapser, kept apart
    /// from the foreground slot for the same key.
    #[must_use]
    pub(crate) fn background(&self) -> Self {
        Self(format!("{BACKGROUND_NAMESPACE}{KEY_SEPARATOR}{}", self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a `cached_fetch` answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    /// Fresh in-process cache hit.
    Cache,
    /// Stale cache hit (a background refresh was scheduled) or a cached value served after the
    /// upstream failed.
    Stale,
    /// Fetched from the provider by this call.
    Api,
    /// Shared the result of an identical in-flight fetch.
    Deduplicated,
}

impl FetchSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Stale => "stale",
            Self::Api => "api",
            Self::Deduplicated => "deduplicated",
        }
    }
}

impl fmt::Display for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for [`crate::gateway::Gateway::cached_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip the in-process cache lookup and always go to the provider.
    pub force_refresh: bool,
    /// Serve a stale entry immediately and refresh it in the background.
    pub allow_stale: bool,
    /// Total lifetime of the entry (fresh + stale) from the moment it is stored. Defaults to
    /// `ttl * stale_multiplier` when unset.
    pub stale_duration: Option<Duration>,
    /// Bypass the provider throttle. Circuit breaker and retries still apply.
    pub skip_rate_limit: bool,
    /// When the provider fails after retries, answer with any value still held for the key.
    pub serve_stale_on_error: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            allow_stale: true,
            stale_duration: None,
            skip_rate_limit: false,
            serve_stale_on_error: true,
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    #[must_use]
    pub fn no_stale(mut self) -> Self {
        self.allow_stale = false;
        self
    }

    #[must_use]
    pub fn stale_duration(mut self, duration: Duration) -> Self {
        self.stale_duration = Some(duration);
        self
    }

    #[must_use]
    pub fn skip_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }

    #[must_use]
    pub fn fail_on_error(mut self) -> Self {
        self.serve_stale_on_error = false;
        self
    }
}

/// Result of a `cached_fetch`: the data, where it came from, and when it was stored.
///
/// `fetched_at` drives the "last updated" indicator the dashboard renders next to stale data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fetched<T> {
    pub data: T,
    pub source: FetchSource,
    pub fetched_at: DateTime<Utc>,
}
