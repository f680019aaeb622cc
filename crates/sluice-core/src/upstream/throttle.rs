//! Per-provider request pacing.
//!
//! Every outbound call for a provider passes through [`Throttle::acquire`], which enforces two
//! limits at once:
//!
//! ```text
//!   window (e.g. 1000ms, max 2)        min interval (200ms * 2^errors)
//!  |----x----x-----------------|        x<----->x
//!       ^ oldest leaves the window      gap since the previous request
//! ```
//!
//! Callers are admitted one at a time through a FIFO queue (`tokio::sync::Mutex` is fair), so a
//! burst cannot slip several requests past the window check before any timestamp is recorded.
//! The timestamp list itself sits behind a short-lived `parking_lot` lock so stats can read it
//! while a caller is sleeping in the queue.

use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};
use tokio::time::Instant;

use crate::types::Provider;

/// Upper bound on the consecutive-error counter.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Default backoff cap: `2^4 = 16x` the minimum interval.
pub const DEFAULT_MAX_BACKOFF_EXPONENT: u32 = 4;

/// Pacing limits for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLimits {
    /// Maximum requests inside one sliding window.
    pub max_requests: usize,
    /// Sliding window length.
    pub window: Duration,
    /// Minimum gap between consecutive requests with no recent errors.
    pub min_interval: Duration,
    /// Cap on the backoff exponent applied to `min_interval`.
    pub max_backoff_exponent: u32,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
            min_interval: Duration::from_millis(100),
            max_backoff_exponent: DEFAULT_MAX_BACKOFF_EXPONENT,
        }
    }
}

#[derive(Debug, Default)]
struct ThrottleWindow {
    timestamps: VecDeque<Instant>,
    last_request: Option<Instant>,
}

impl ThrottleWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self.timestamps.front().is_some_and(|&ts| now.duration_since(ts) >= window) {
            self.timestamps.pop_front();
        }
    }
}

/// Point-in-time view of a throttle, used for gateway stats.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ThrottleSnapshot {
    pub requests_in_window: usize,
    pub max_requests: usize,
    pub utilization: f64,
    pub consecutive_errors: u32,
    #[serde(with = "duration_ms")]
    pub current_interval: Duration,
}

/// Sliding-window plus minimum-interval throttle with exponential backoff on errors.
pub struct Throttle {
    provider: Provider,
    limits: ThrottleLimits,
    queue: tokio::sync::Mutex<()>,
    window: Mutex<ThrottleWindow>,
    consecutive_errors: AtomicU32,
}

impl Throttle {
    #[must_use]
    pub fn new(provider: Provider, limits: ThrottleLimits) -> Self {
        let limits = ThrottleLimits { max_requests: limits.max_requests.max(1), ..limits };
        Self {
            provider,
            limits,
            queue: tokio::sync::Mutex::new(()),
            window: Mutex::new(ThrottleWindow::default()),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    /// Waits until a request may be sent, then records it.
    ///
    /// Returns how long the caller waited, including time spent queued behind other callers.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let _turn = self.queue.lock().await;

        // Window gate: wait for the oldest timestamp to leave the window
        loop {
            let wait_until = {
                let mut window = self.window.lock();
                window.prune(Instant::now(), self.limits.window);
                if window.timestamps.len() < self.limits.max_requests {
                    None
                } else {
                    window.timestamps.front().map(|&oldest| oldest + self.limits.window)
                }
            };
            match wait_until {
                Some(deadline) => {
                    tracing::trace!(provider = %self.provider, "throttle window full, waiting");
                    tokio::time::sleep_until(deadline).await;
                }
                None => break,
            }
        }

        // Interval gate, stretched by the current backoff
        let interval = self.current_interval();
        let last_request = self.window.lock().last_request;
        if let Some(last) = last_request {
            let deadline = last + interval;
            if deadline > Instant::now() {
                tracing::trace!(
                    provider = %self.provider,
                    interval_ms = interval.as_millis() as u64,
                    "throttle interval wait"
                );
                tokio::time::sleep_until(deadline).await;
            }
        }

        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.limits.window);
        window.timestamps.push_back(now);
        window.last_request = Some(now);

        now.duration_since(started)
    }

    /// Clears the backoff after a successful call.
    pub fn on_success(&self) {
        let previous = self.consecutive_errors.swap(0, Ordering::Relaxed);
        if previous > 0 {
            tracing::debug!(provider = %self.provider, previous, "throttle backoff reset");
        }
    }

    /// Increments the consecutive-error counter, capped at [`MAX_CONSECUTIVE_ERRORS`].
    pub fn on_failure(&self) {
        let _ = self.consecutive_errors.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some((n + 1).min(MAX_CONSECUTIVE_ERRORS))
        });
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Minimum interval in effect for the next request: `min_interval * 2^min(errors, cap)`.
    #[must_use]
    pub fn current_interval(&self) -> Duration {
        let exponent = self.consecutive_errors().min(self.limits.max_backoff_exponent);
        self.limits.min_interval.saturating_mul(1u32 << exponent.min(31))
    }

    #[must_use]
    pub fn snapshot(&self) -> ThrottleSnapshot {
        let requests_in_window = {
            let mut window = self.window.lock();
            window.prune(Instant::now(), self.limits.window);
            window.timestamps.len()
        };
        #[allow(clippy::cast_precision_loss)]
        let utilization = requests_in_window as f64 / self.limits.max_requests as f64;
        ThrottleSnapshot {
            requests_in_window,
            max_requests: self.limits.max_requests,
            utilization,
            consecutive_errors: self.consecutive_errors(),
            current_interval: self.current_interval(),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}
