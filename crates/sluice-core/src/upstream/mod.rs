//! Per-provider outbound plumbing.
//!
//! Each provider owns exactly one [`Throttle`] and one [`CircuitBreaker`]; the
//! [`ProviderRegistry`] holds them and the [`HttpClient`] performs the actual calls.
//!
//! ```text
//! gateway ──► ProviderRegistry ──► ProviderState { Throttle, CircuitBreaker, counters }
//!                                          │
//!                                          ▼
//!                                      HttpClient (User-Agent, Accept: json, 429/404 split)
//! ```

pub mod circuit_breaker;
pub mod errors;
pub mod http_client;
pub mod registry;
pub mod throttle;

pub use circuit_breaker::{BreakerOpen, CircuitBreaker, CircuitBreakerState};
pub use errors::{ErrorCategory, UpstreamError};
pub use http_client::{HttpClient, HttpClientConfig};
pub use registry::{ProviderLimits, ProviderRegistry, ProviderState, ProviderStats};
pub use throttle::{Throttle, ThrottleLimits, ThrottleSnapshot};
