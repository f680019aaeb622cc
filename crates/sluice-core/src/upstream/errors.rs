use std::time::Duration;
use thiserror::Error;

/// Classification of provider failures for retry handling.
///
/// Different categories require different handling strategies:
/// - Rate limits back off through the throttle and retry a bounded number of times
/// - Timeouts retry once or twice, then surface
/// - Transient upstream errors (5xx, connection) retry a small fixed number of times
/// - Permanent errors (missing entity, other 4xx, malformed body) are surfaced directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The provider signaled throttling (HTTP 429).
    RateLimit,
    /// No response within the per-call bound.
    Timeout,
    /// 5xx or connection-level failure; likely to succeed on retry.
    Transient,
    /// The entity does not exist upstream.
    NotFound,
    /// Retrying will not help: non-429 4xx, malformed body.
    Permanent,
}

impl ErrorCategory {
    /// Classifies an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            404 => Self::NotFound,
            408 | 504 => Self::Timeout,
            500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }

    /// Returns `true` if the category is worth retrying locally.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::Transient)
    }

    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Permanent => "permanent",
        }
    }
}

/// Errors returned by a single provider call.
///
/// Cloneable so one failed fetch can be handed to every caller collapsed onto it; network errors
/// are carried as sanitized messages rather than the underlying `reqwest::Error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The provider answered 429.
    #[error("Rate limited by provider")]
    RateLimited {
        /// Parsed `Retry-After` header, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// Request exceeded the configured timeout duration.
    #[error("Request timeout")]
    Timeout,

    /// The entity does not exist upstream (HTTP 404 or an adapter-level "no such entity").
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-success HTTP status other than 404/429.
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    /// Failed to establish a connection or the transport failed mid-flight.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Response from upstream could not be parsed or was malformed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Returns the retry category for this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Timeout => ErrorCategory::Timeout,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Http { status, .. } => ErrorCategory::from_status(*status),
            Self::ConnectionFailed(_) => ErrorCategory::Transient,
            Self::InvalidResponse(_) => ErrorCategory::Permanent,
        }
    }

    /// Returns `true` if this error is transient and the request should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }

    /// Returns `true` if this error is permanent and retrying won't help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::NotFound | ErrorCategory::Permanent)
    }

    /// Returns `true` if this error counts against the provider's circuit breaker.
    ///
    /// A 404 is a correct answer from a healthy provider and does not trip the breaker.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(self.category(), ErrorCategory::NotFound)
    }

    /// Provider-suggested wait before retrying, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
