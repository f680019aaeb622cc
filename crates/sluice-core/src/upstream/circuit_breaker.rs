use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};

use crate::types::Provider;

/// Internal mutable state protected by a single `RwLock`.
///
/// Consolidates `failure_count`, `opened_at`, and `state` so every transition happens within
/// one lock acquisition.
#[derive(Debug)]
struct CircuitBreakerInternalState {
    /// Number of consecutive failures.
    failure_count: u32,
    /// When the breaker last entered `Open`.
    opened_at: Option<Instant>,
    /// Current state of the circuit breaker FSM.
    state: CircuitBreakerState,
}

impl CircuitBreakerInternalState {
    fn new() -> Self {
        Self { failure_count: 0, opened_at: None, state: CircuitBreakerState::Closed }
    }
}

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: consecutive failures reach the threshold
/// - `Open` -> `HalfOpen`: lazily, on the first check after the reset interval
/// - `HalfOpen` -> `Closed`: on the next success
/// - `HalfOpen` -> `Open`: on the next failure, restarting the cool-down
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Normal operation, requests are allowed through.
    Closed,
    /// Failures exceeded threshold, requests are blocked.
    Open,
    /// Recovery mode, testing if the provider has recovered.
    HalfOpen,
}

/// Returned by [`CircuitBreaker::allow`] while the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOpen {
    /// Time left before the breaker will let a probe request through.
    pub remaining: Duration,
}

/// Per-provider failure tracker that fails fast while a provider is degraded.
///
/// # Thread Safety
///
/// All mutable state is protected by a single `RwLock` to ensure atomic state transitions.
pub struct CircuitBreaker {
    provider: Provider,
    /// All mutable state under a single lock to prevent race conditions.
    inner: Arc<RwLock<CircuitBreakerInternalState>>,
    /// Immutable: Number of consecutive failures before opening the circuit.
    threshold: u32,
    /// Immutable: Time to wait in Open state before transitioning to `HalfOpen`.
    reset_interval: Duration,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the specified failure threshold and reset interval.
    #[must_use]
    pub fn new(provider: Provider, threshold: u32, reset_interval: Duration) -> Self {
        Self {
            provider,
            inner: Arc::new(RwLock::new(CircuitBreakerInternalState::new())),
            threshold: threshold.max(1),
            reset_interval,
        }
    }

    /// Checks whether a request may proceed.
    ///
    /// Returns `Err(BreakerOpen)` with the remaining cool-down while open. Once the reset
    /// interval has elapsed the breaker moves to `HalfOpen` and the call is allowed.
    ///
    /// Uses double-checked locking: the common `Closed` path only takes the read lock.
    pub async fn allow(&self) -> Result<(), BreakerOpen> {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => return Ok(()),
                CircuitBreakerState::Open => {
                    if let Some(remaining) = self.remaining(inner.opened_at) {
                        return Err(BreakerOpen { remaining });
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;

        // Another task may have transitioned while we waited for the write lock
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => Ok(()),
            CircuitBreakerState::Open => match self.remaining(inner.opened_at) {
                Some(remaining) => Err(BreakerOpen { remaining }),
                None => {
                    inner.state = CircuitBreakerState::HalfOpen;
                    tracing::warn!(
                        provider = %self.provider,
                        "circuit breaker transitioning to half-open state"
                    );
                    Ok(())
                }
            },
        }
    }

    /// Boolean form of [`allow`](Self::allow).
    pub async fn can_execute(&self) -> bool {
        self.allow().await.is_ok()
    }

    /// Records the outcome of a provider call.
    pub async fn record_result(&self, ok: bool) {
        if ok {
            self.on_success().await;
        } else {
            self.on_failure().await;
        }
    }

    /// Resets the failure streak and closes the breaker.
    pub async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
            }
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {
                inner.state = CircuitBreakerState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                tracing::info!(
                    provider = %self.provider,
                    "circuit breaker closed after successful request"
                );
            }
        }
    }

    /// Counts a failure, opening the breaker at the threshold or immediately from `HalfOpen`.
    pub async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.failure_count = inner.failure_count.saturating_add(1);

        let should_open = match inner.state {
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Closed => inner.failure_count >= self.threshold,
            CircuitBreakerState::Open => false,
        };

        if should_open {
            inner.state = CircuitBreakerState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                provider = %self.provider,
                threshold = self.threshold,
                failures = inner.failure_count,
                "circuit breaker opened"
            );
        }
    }

    /// Returns the current circuit breaker state.
    pub async fn get_state(&self) -> CircuitBreakerState {
        self.inner.read().await.state
    }

    /// Returns the current failure count.
    pub async fn get_failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    /// Time left in the cool-down, or `None` once it has elapsed.
    fn remaining(&self, opened_at: Option<Instant>) -> Option<Duration> {
        let elapsed = opened_at?.elapsed();
        (elapsed < self.reset_interval).then(|| self.reset_interval - elapsed)
    }
}
