//! Token-bucket rate limiting with a per-minute and a per-hour budget.
//!
//! Backed by the governor crate. A call waits for a token as long as the
//! wait fits inside both the configured ceiling and the caller's remaining
//! time budget; otherwise it fails fast with `RateLimited`.
//!
//! The buckets read time through [`TokioClock`], the same clock the waits
//! sleep on, so a paused or advanced tokio clock drives token refill too.

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Failure;
use crate::traits::backend::BackendKind;
use crate::types::config::RateLimitConfig;

/// Governor clock backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    TokioClock,
    NoOpMiddleware<std::time::Instant>,
>;

pub struct CallRateLimiter {
    backend: BackendKind,
    per_minute: DirectRateLimiter,
    per_hour: DirectRateLimiter,
    clock: TokioClock,
    max_wait: Duration,

    /// Earliest instant the hour window admits another call, once it has refused
    hour_blocked_until: Mutex<Option<Instant>>,
}

impl CallRateLimiter {
    pub fn new(backend: BackendKind, config: &RateLimitConfig) -> Self {
        let per_minute = NonZeroU32::new(config.per_minute).unwrap_or(nonzero!(1u32));
        let per_hour = NonZeroU32::new(config.per_hour).unwrap_or(nonzero!(1u32));
        let clock = TokioClock;

        Self {
            backend,
            per_minute: RateLimiter::direct_with_clock(Quota::per_minute(per_minute), clock),
            per_hour: RateLimiter::direct_with_clock(Quota::per_hour(per_hour), clock),
            clock,
            max_wait: Duration::from_millis(config.max_wait_ms),
            hour_blocked_until: Mutex::new(None),
        }
    }

    /// Take one token from both windows.
    ///
    /// Tokens are taken minute-window first. When the hour window refuses,
    /// the refusal is remembered until its next slot, and later calls fail
    /// on it without drawing from the minute window. At most one minute
    /// token is lost per hour-window refusal.
    pub async fn acquire(&self, budget: Duration) -> Result<(), Failure> {
        let ceiling = self.max_wait.min(budget);
        let started = Instant::now();

        let blocked_until = *self.blocked();
        if let Some(until) = blocked_until {
            let wait = until.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                if wait > ceiling {
                    return Err(self.exhausted("hour", wait));
                }
                self.wait("hour", wait).await;
            }
        }

        for (window, limiter) in [("minute", &self.per_minute), ("hour", &self.per_hour)] {
            loop {
                let Err(not_until) = limiter.check() else {
                    break;
                };

                let wait = not_until.wait_time_from(self.clock.now());
                if window == "hour" {
                    *self.blocked() = Some(Instant::now() + wait);
                }
                if started.elapsed() + wait > ceiling {
                    return Err(self.exhausted(window, wait));
                }
                self.wait(window, wait).await;
            }
        }

        *self.blocked() = None;
        Ok(())
    }

    async fn wait(&self, window: &str, wait: Duration) {
        debug!(
            backend = %self.backend,
            window,
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limit slot"
        );
        tokio::time::sleep(wait).await;
    }

    fn exhausted(&self, window: &str, wait: Duration) -> Failure {
        Failure::rate_limited(format!(
            "{} backend per-{window} budget exhausted, next slot in {}ms",
            self.backend,
            wait.as_millis()
        ))
        .with_backend(self.backend)
    }

    fn blocked(&self) -> MutexGuard<'_, Option<Instant>> {
        self.hour_blocked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CallRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRateLimiter")
            .field("backend", &self.backend)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}
