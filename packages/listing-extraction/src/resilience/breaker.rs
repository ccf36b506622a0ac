//! Per-backend circuit breaker.
//!
//! Three states:
//! - `Closed`: calls flow; consecutive failures inside the window are counted.
//! - `Open`: calls are rejected immediately until the cooldown elapses.
//! - `HalfOpen`: exactly one trial call is admitted. Success closes the
//!   circuit, failure re-opens it and restarts the cooldown.
//!
//! State lives behind a mutex so transitions are atomic across the
//! concurrent requests sharing one backend.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::Failure;
use crate::traits::backend::BackendKind;
use crate::types::config::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed {
        failures: u32,
        streak_started: Option<Instant>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        trial_in_flight: bool,
    },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    backend: BackendKind,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(backend: BackendKind, config: &BreakerConfig) -> Self {
        Self {
            backend,
            threshold: config.failure_threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(Inner::Closed {
                failures: 0,
                streak_started: None,
            }),
        }
    }

    /// Current state. An open circuit whose cooldown has elapsed reports
    /// `HalfOpen` even before the next call moves it there.
    pub fn state(&self) -> CircuitState {
        match &*self.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { until } if Instant::now() >= *until => CircuitState::HalfOpen,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Ask to make a call.
    ///
    /// Returns a permit that must be resolved with [`CircuitPermit::succeed`]
    /// or [`CircuitPermit::fail`]. A permit dropped unresolved (cancelled
    /// call) frees the half-open trial slot without changing state.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, Failure> {
        let mut inner = self.lock();
        let now = Instant::now();

        let trial = match &mut *inner {
            Inner::Closed { .. } => false,
            Inner::Open { until } => {
                if now < *until {
                    let remaining = *until - now;
                    return Err(Failure::circuit_open(format!(
                        "{} backend circuit open for another {}ms",
                        self.backend,
                        remaining.as_millis()
                    ))
                    .with_backend(self.backend));
                }
                info!(backend = %self.backend, "Circuit half-open, admitting trial call");
                *inner = Inner::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            Inner::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    return Err(Failure::circuit_open(format!(
                        "{} backend circuit half-open, trial call in flight",
                        self.backend
                    ))
                    .with_backend(self.backend));
                }
                *trial_in_flight = true;
                true
            }
        };

        Ok(CircuitPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match &mut *inner {
            Inner::Closed {
                failures,
                streak_started,
            } => {
                *failures = 0;
                *streak_started = None;
            }
            Inner::HalfOpen { .. } if trial => {
                info!(backend = %self.backend, "Trial call succeeded, circuit closed");
                *inner = Inner::Closed {
                    failures: 0,
                    streak_started: None,
                };
            }
            // Stale result from a call admitted before the circuit opened.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        let now = Instant::now();

        match &mut *inner {
            Inner::Closed {
                failures,
                streak_started,
            } => {
                match streak_started {
                    Some(started) if now.duration_since(*started) <= self.window => *failures += 1,
                    _ => {
                        *failures = 1;
                        *streak_started = Some(now);
                    }
                }

                if *failures >= self.threshold {
                    warn!(
                        backend = %self.backend,
                        failures = *failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Circuit opened"
                    );
                    *inner = Inner::Open {
                        until: now + self.cooldown,
                    };
                }
            }
            Inner::HalfOpen { .. } if trial => {
                warn!(backend = %self.backend, "Trial call failed, circuit re-opened");
                *inner = Inner::Open {
                    until: now + self.cooldown,
                };
            }
            _ => {}
        }
    }

    fn on_abandon(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.lock();
        if let Inner::HalfOpen { trial_in_flight } = &mut *inner {
            *trial_in_flight = false;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit<'_> {
    /// Whether this is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandon(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            BackendKind::Voice,
            &BreakerConfig {
                failure_threshold: threshold,
                window_secs: 60,
                cooldown_secs: 30,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3);

        for _ in 0..3 {
            breaker.try_acquire().unwrap().fail();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        let err = breaker.try_acquire().unwrap_err();
        assert_eq!(err.kind, FailureKind::CircuitOpen);
        assert_eq!(err.backend, Some(BackendKind::Voice));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_streak() {
        let breaker = breaker(3);

        breaker.try_acquire().unwrap().fail();
        breaker.try_acquire().unwrap().fail();
        breaker.try_acquire().unwrap().succeed();
        breaker.try_acquire().unwrap().fail();
        breaker.try_acquire().unwrap().fail();

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_not_consecutive() {
        let breaker = breaker(3);

        breaker.try_acquire().unwrap().fail();
        breaker.try_acquire().unwrap().fail();
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.try_acquire().unwrap().fail();

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_err());

        trial.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().fail();
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().fail();
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }
}
