//! Unified retry policy for provider calls.
//!
//! | Error class            | Budget               | Delay                               | Exhausted as          |
//! |------------------------|----------------------|-------------------------------------|-----------------------|
//! | `RateLimited` (429)    | `rate_limit_retries` | `max(Retry-After, base * 2^n)`      | `ProviderUnavailable` |
//! | `Timeout`              | `timeout_retries`    | `base * 2^n`                        | `ProviderTimeout`     |
//! | 5xx / connection       | `upstream_retries`   | `base * 2^n`                        | `Upstream`            |
//! | 404, other 4xx, decode | none                 |                                     | surfaced directly     |

use std::time::Duration;

use crate::{
    config::GatewayConfig,
    gateway::GatewayError,
    types::Provider,
    upstream::{ErrorCategory, UpstreamError},
};

/// Longest single wait between attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub rate_limit_retries: u32,
    pub timeout_retries: u32,
    pub upstream_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for RetryPolicy {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            rate_limit_retries: config.rate_limit_retries,
            timeout_retries: config.timeout_retries,
            upstream_retries: config.upstream_retries,
            base_delay: config.retry_base_delay(),
        }
    }
}

/// Retries spent so far in one fetch, per error class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    rate_limited: u32,
    timeouts: u32,
    transient: u32,
}

impl RetryPolicy {
    /// Records a failed attempt and returns the delay before the next one, or `None` when the
    /// error is not retryable or its budget is spent.
    pub fn next_delay(&self, error: &UpstreamError, state: &mut RetryState) -> Option<Duration> {
        state.attempts += 1;
        let (used, budget) = match error.category() {
            ErrorCategory::RateLimit => (&mut state.rate_limited, self.rate_limit_retries),
            ErrorCategory::Timeout => (&mut state.timeouts, self.timeout_retries),
            ErrorCategory::Transient => (&mut state.transient, self.upstream_retries),
            ErrorCategory::NotFound | ErrorCategory::Permanent => return None,
        };
        if *used >= budget {
            return None;
        }

        let backoff = self.base_delay.saturating_mul(1u32 << (*used).min(16));
        *used += 1;

        let delay = error.retry_after().map_or(backoff, |hint| hint.max(backoff));
        Some(delay.min(MAX_RETRY_DELAY))
    }

    /// Maps the last upstream error onto the gateway error surfaced once retries are exhausted.
    #[must_use]
    pub fn exhausted(
        &self,
        provider: &Provider,
        entity: &str,
        error: UpstreamError,
        state: &RetryState,
    ) -> GatewayError {
        let provider = provider.clone();
        let attempts = state.attempts;
        match error.category() {
            ErrorCategory::RateLimit => GatewayError::ProviderUnavailable { provider, attempts },
            ErrorCategory::Timeout => GatewayError::ProviderTimeout { provider, attempts },
            ErrorCategory::NotFound => GatewayError::NotFound { provider, entity: entity.to_string() },
            ErrorCategory::Transient | ErrorCategory::Permanent => {
                GatewayError::Upstream { provider, source: error }
            }
        }
    }
}
