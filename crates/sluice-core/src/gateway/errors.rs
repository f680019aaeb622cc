use std::time::Duration;
use thiserror::Error;

use crate::{types::Provider, upstream::UpstreamError};

/// Typed failure surfaced by [`super::Gateway::cached_fetch`].
///
/// Cloneable so a single failed fetch can be delivered to every collapsed caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider's breaker is open. Callers must not retry synchronously.
    #[error("circuit open for {provider}, retry in {}ms", remaining.as_millis())]
    CircuitOpen { provider: Provider, remaining: Duration },

    /// The provider kept answering 429 after the retry budget was spent.
    #[error("{provider} unavailable: rate limited after {attempts} attempts")]
    ProviderUnavailable { provider: Provider, attempts: u32 },

    #[error("{provider} timed out after {attempts} attempts")]
    ProviderTimeout { provider: Provider, attempts: u32 },

    #[error("{provider} request failed: {source}")]
    Upstream { provider: Provider, source: UpstreamError },

    /// The entity does not exist upstream. Never retried.
    #[error("{provider} has no entity {entity}")]
    NotFound { provider: Provider, entity: String },

    /// The cached or fetched payload does not match the caller's type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The shared fetch ended without producing a result.
    #[error("fetch cancelled: {0}")]
    Cancelled(String),
}

impl GatewayError {
    /// Returns `true` if a held cache value may be served in place of this error.
    ///
    /// `CircuitOpen` and `NotFound` are always surfaced as-is.
    #[must_use]
    pub fn allows_stale_fallback(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } |
                Self::ProviderTimeout { .. } |
                Self::Upstream { .. } |
                Self::Cancelled(_)
        )
    }

    /// Human-readable reason suitable for the presentation layer.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::CircuitOpen { provider, remaining } => format!(
                "{provider} is temporarily unavailable, try again in {}s",
                remaining.as_secs().max(1)
            ),
            Self::ProviderUnavailable { provider, .. } => {
                format!("{provider} is rate limiting requests, try again shortly")
            }
            Self::ProviderTimeout { provider, .. } => format!("{provider} is not responding"),
            Self::NotFound { entity, .. } => format!("{entity} was not found"),
            other => other.to_string(),
        }
    }
}
