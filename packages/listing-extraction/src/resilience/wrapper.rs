//! Resilient backend invocation.
//!
//! [`ResilientBackend`] wraps one [`BackendClient`] with, in order per attempt:
//! cancellation check, circuit breaker admission, rate limiter, quota
//! reservation, per-attempt timeout. Retryable failures are retried with
//! exponential backoff while the attempt budget, the quota and the caller's
//! deadline allow. Each attempt reserves its own estimated cost and settles
//! it with what that attempt billed.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::breaker::{CircuitBreaker, CircuitState};
use super::rate_limit::CallRateLimiter;
use super::retry::Backoff;
use crate::error::{Failure, FailureKind};
use crate::quota::QuotaGuard;
use crate::traits::backend::{BackendClient, BackendKind, BackendOutput, BackendPayload, BackendRequest};
use crate::traits::observer::{CallEvent, CallObserver, CallStatus};
use crate::types::config::BackendConfig;

/// Result of one wrapped call, across all of its attempts.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub outcome: Result<BackendOutput, Failure>,

    /// Attempts made, including ones rejected before reaching the backend
    pub attempts: u32,

    /// Total cost billed across attempts
    pub billed_cost: f64,
}

impl Invocation {
    pub(crate) fn failed(failure: Failure, attempts: u32, billed_cost: f64) -> Self {
        Self {
            outcome: Err(failure),
            attempts,
            billed_cost,
        }
    }
}

pub struct ResilientBackend {
    kind: BackendKind,
    client: Arc<dyn BackendClient>,
    config: BackendConfig,
    breaker: CircuitBreaker,
    limiter: CallRateLimiter,
    backoff: Backoff,
    observer: Arc<dyn CallObserver>,
}

impl ResilientBackend {
    pub fn new(
        kind: BackendKind,
        client: Arc<dyn BackendClient>,
        config: BackendConfig,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self {
            kind,
            breaker: CircuitBreaker::new(kind, &config.breaker),
            limiter: CallRateLimiter::new(kind, &config.rate_limit),
            backoff: Backoff::new(&config.retry),
            client,
            config,
            observer,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Configured cost of a single attempt carrying `payload`.
    pub fn estimated_cost(&self, payload: &BackendPayload) -> f64 {
        self.config.cost.estimate(payload.units())
    }

    /// Invoke the backend, retrying transient failures until `deadline`.
    ///
    /// Every attempt is charged against `quota` before it is sent. An attempt
    /// the quota cannot cover ends the call with `QuotaExceeded`.
    pub async fn call(
        &self,
        request: &BackendRequest,
        quota: &QuotaGuard,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Invocation {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let attempt_cost = self.estimated_cost(&request.payload);
        let mut billed = 0.0;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Invocation::failed(self.cancelled(), attempt - 1, billed);
            }

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                let failure = Failure::timeout(format!("{} backend: deadline elapsed", self.kind))
                    .with_backend(self.kind);
                self.emit(attempt, CallStatus::Rejected(failure.kind), 0.0, Duration::ZERO);
                return Invocation::failed(failure, attempt, billed);
            }

            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(failure) => {
                    debug!(backend = %self.kind, attempt, "Call rejected by open circuit");
                    self.emit(attempt, CallStatus::Rejected(failure.kind), 0.0, Duration::ZERO);
                    return Invocation::failed(failure, attempt, billed);
                }
            };

            let admitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(self.cancelled()),
                result = self.limiter.acquire(remaining) => result,
            };
            if let Err(failure) = admitted {
                self.emit(attempt, CallStatus::Rejected(failure.kind), 0.0, now.elapsed());
                return Invocation::failed(failure, attempt, billed);
            }

            let per_attempt = self
                .config
                .timeout()
                .min(deadline.saturating_duration_since(Instant::now()));
            if per_attempt.is_zero() {
                // The limiter wait used up the budget; nothing reached the backend.
                let failure = Failure::timeout(format!(
                    "{} backend: deadline elapsed waiting for rate limit",
                    self.kind
                ))
                .with_backend(self.kind);
                self.emit(attempt, CallStatus::Rejected(failure.kind), 0.0, now.elapsed());
                return Invocation::failed(failure, attempt, billed);
            }

            let reservation = match quota.reserve(attempt_cost) {
                Ok(reservation) => reservation,
                Err(failure) => {
                    warn!(backend = %self.kind, attempt, error = %failure, "Backend call blocked by quota");
                    let failure = failure.with_backend(self.kind);
                    self.emit(attempt, CallStatus::Rejected(failure.kind), 0.0, now.elapsed());
                    return Invocation::failed(failure, attempt, billed);
                }
            };
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Dropping the in-flight future aborts the request, but the
                    // provider may already have done the work.
                    reservation.settle(attempt_cost);
                    billed += attempt_cost;
                    self.emit(attempt, CallStatus::Rejected(FailureKind::Cancelled), attempt_cost, started.elapsed());
                    return Invocation::failed(self.cancelled(), attempt, billed);
                }
                result = tokio::time::timeout(per_attempt, self.client.invoke(request)) => result,
            };
            let latency = started.elapsed();

            let failure = match result {
                Ok(Ok(output)) => {
                    permit.succeed();
                    let cost = output.billed_cost.unwrap_or(attempt_cost);
                    reservation.settle(cost);
                    billed += cost;
                    self.emit(attempt, CallStatus::Succeeded, cost, latency);
                    return Invocation {
                        outcome: Ok(output),
                        attempts: attempt,
                        billed_cost: billed,
                    };
                }
                Ok(Err(backend_failure)) => {
                    if backend_failure.trips_breaker() {
                        permit.fail();
                    } else {
                        permit.succeed();
                    }
                    let cost = backend_failure.billed_cost;
                    reservation.settle(cost);
                    billed += cost;
                    let failure = backend_failure.into_failure(self.kind);
                    self.emit(attempt, CallStatus::Failed(failure.kind), cost, latency);
                    failure
                }
                Err(_elapsed) => {
                    permit.fail();
                    // The provider may already have done the work.
                    reservation.settle(attempt_cost);
                    billed += attempt_cost;
                    let failure = Failure::timeout(format!(
                        "{} backend did not respond within {}ms",
                        self.kind,
                        per_attempt.as_millis()
                    ))
                    .with_backend(self.kind);
                    self.emit(attempt, CallStatus::Failed(failure.kind), attempt_cost, latency);
                    failure
                }
            };

            if !failure.retryable {
                warn!(backend = %self.kind, attempt, error = %failure, "Non-retryable backend failure");
                return Invocation::failed(failure, attempt, billed);
            }

            if attempt >= max_attempts {
                error!(
                    backend = %self.kind,
                    attempts = attempt,
                    error = %failure,
                    "Backend call failed after all retry attempts"
                );
                return Invocation::failed(failure, attempt, billed);
            }

            let delay = self.backoff.delay(attempt);
            if Instant::now() + delay >= deadline {
                warn!(
                    backend = %self.kind,
                    attempt,
                    error = %failure,
                    "No time left for another attempt"
                );
                return Invocation::failed(failure, attempt, billed);
            }

            warn!(
                backend = %self.kind,
                attempt,
                max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure,
                "Backend call failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Invocation::failed(self.cancelled(), attempt, billed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self) -> Failure {
        Failure::cancelled(format!("{} backend call cancelled", self.kind)).with_backend(self.kind)
    }

    fn emit(&self, attempt: u32, status: CallStatus, billed_cost: f64, latency: Duration) {
        self.observer.on_call(&CallEvent {
            backend: self.kind,
            attempt,
            status,
            billed_cost,
            latency,
        });
    }
}

impl std::fmt::Debug for ResilientBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientBackend")
            .field("kind", &self.kind)
            .field("client", &self.client.name())
            .field("model", &self.config.model)
            .field("circuit", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, RecordingObserver};
    use crate::traits::backend::{BackendErrorKind, BackendFailure};
    use crate::types::config::{BreakerConfig, QuotaConfig, RateLimitConfig, RetryConfig};
    use serde_json::json;

    fn request() -> BackendRequest {
        BackendRequest {
            kind: BackendKind::Text,
            instructions: "extract".into(),
            payload: BackendPayload::Text("3 bed flat".into()),
            schema: json!({}),
        }
    }

    fn config() -> BackendConfig {
        BackendConfig::text_default()
            .with_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig {
                max_attempts: 3,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            })
            .with_cost(0.01, 0.0)
    }

    fn wrap(
        mock: &Arc<MockBackend>,
        config: BackendConfig,
    ) -> (ResilientBackend, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::new());
        let backend = ResilientBackend::new(BackendKind::Text, mock.clone(), config, observer.clone());
        (backend, observer)
    }

    fn unlimited() -> QuotaGuard {
        QuotaGuard::new(QuotaConfig::default())
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let mock = Arc::new(MockBackend::new("text").with_default_output(
            BackendOutput::default().with_field("bedrooms", json!(3)),
        ));
        let (backend, observer) = wrap(&mock, config());

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &CancellationToken::new()).await;

        assert_eq!(invocation.attempts, 1);
        assert!((invocation.billed_cost - 0.01).abs() < 1e-9);
        assert_eq!(invocation.outcome.unwrap().fields["bedrooms"], 3);
        assert_eq!(observer.statuses(), vec![CallStatus::Succeeded]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failure() {
        let mock = Arc::new(
            MockBackend::new("text")
                .then_fail(BackendFailure::new(BackendErrorKind::Unavailable, "502"))
                .then_fail(BackendFailure::new(BackendErrorKind::RateLimited, "429"))
                .then_output(BackendOutput::default().with_field("city", json!("Lisbon"))),
        );
        let (backend, observer) = wrap(&mock, config());

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &CancellationToken::new()).await;

        assert!(invocation.outcome.is_ok());
        assert_eq!(invocation.attempts, 3);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(
            observer.statuses(),
            vec![
                CallStatus::Failed(FailureKind::BackendError),
                CallStatus::Failed(FailureKind::RateLimited),
                CallStatus::Succeeded,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_not_retried() {
        let mock = Arc::new(
            MockBackend::new("text").then_fail(BackendFailure::new(BackendErrorKind::BadInput, "400")),
        );
        let (backend, _) = wrap(&mock, config());

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &CancellationToken::new()).await;

        let failure = invocation.outcome.unwrap_err();
        assert_eq!(failure.kind, FailureKind::BackendError);
        assert!(!failure.retryable);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(backend.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let mock = Arc::new(
            MockBackend::new("text")
                .with_default_failure(BackendFailure::new(BackendErrorKind::Unavailable, "503")),
        );
        let (backend, _) = wrap(&mock, config());

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &CancellationToken::new()).await;

        assert!(invocation.outcome.is_err());
        assert_eq!(invocation.attempts, 3);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let mock = Arc::new(MockBackend::new("text").with_delay(Duration::from_secs(10)));
        let config = config().with_retry(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
        let (backend, _) = wrap(&mock, config);

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &CancellationToken::new()).await;

        let failure = invocation.outcome.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_rejects_without_calling() {
        let mock = Arc::new(
            MockBackend::new("text")
                .with_default_failure(BackendFailure::new(BackendErrorKind::Unavailable, "503")),
        );
        let config = config()
            .with_retry(RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            })
            .with_breaker(BreakerConfig {
                failure_threshold: 2,
                window_secs: 60,
                cooldown_secs: 30,
            });
        let (backend, observer) = wrap(&mock, config);
        let cancel = CancellationToken::new();

        backend.call(&request(), &unlimited(), far_deadline(), &cancel).await;
        backend.call(&request(), &unlimited(), far_deadline(), &cancel).await;
        assert_eq!(backend.circuit_state(), CircuitState::Open);

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &cancel).await;
        assert_eq!(invocation.outcome.unwrap_err().kind, FailureKind::CircuitOpen);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(
            observer.statuses().last(),
            Some(&CallStatus::Rejected(FailureKind::CircuitOpen))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_call() {
        let mock = Arc::new(MockBackend::new("text").with_delay(Duration::from_secs(10)));
        let (backend, _) = wrap(&mock, config());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let invocation = backend.call(&request(), &unlimited(), far_deadline(), &cancel).await;
        assert_eq!(invocation.outcome.unwrap_err().kind, FailureKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_past_deadline() {
        let mock = Arc::new(
            MockBackend::new("text")
                .with_default_failure(BackendFailure::new(BackendErrorKind::Unavailable, "503")),
        );
        let config = config().with_retry(RetryConfig {
            max_attempts: 5,
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
        });
        let (backend, _) = wrap(&mock, config);

        let deadline = Instant::now() + Duration::from_secs(2);
        let invocation = backend.call(&request(), &unlimited(), deadline, &CancellationToken::new()).await;

        assert!(invocation.outcome.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_retry_is_charged_against_quota() {
        let mock = Arc::new(MockBackend::new("text").with_default_failure(
            BackendFailure::new(BackendErrorKind::Unavailable, "503").with_billed_cost(0.002),
        ));
        let (backend, observer) = wrap(&mock, config().with_cost(0.002, 0.0));
        let quota = QuotaGuard::new(QuotaConfig {
            daily_ceiling: 0.005,
            monthly_ceiling: 1.0,
        });

        let invocation = backend.call(&request(), &quota, far_deadline(), &CancellationToken::new()).await;

        // Two attempts fit under the ceiling, the third cannot be reserved.
        assert_eq!(mock.call_count(), 2);
        assert_eq!(invocation.attempts, 3);
        assert_eq!(invocation.outcome.unwrap_err().kind, FailureKind::QuotaExceeded);
        assert!((invocation.billed_cost - 0.004).abs() < 1e-9);

        let usage = quota.usage();
        assert!(usage.daily_spent <= 0.005);
        assert!((usage.daily_spent - invocation.billed_cost).abs() < 1e-9);
        assert_eq!(usage.pending, 0.0);
        assert_eq!(
            observer.statuses().last(),
            Some(&CallStatus::Rejected(FailureKind::QuotaExceeded))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_settles_actual_cost_per_attempt() {
        let mock = Arc::new(
            MockBackend::new("text")
                .then_fail(BackendFailure::new(BackendErrorKind::Unavailable, "502").with_billed_cost(0.001))
                .then_output(BackendOutput::default().with_billed_cost(0.003)),
        );
        let (backend, _) = wrap(&mock, config());
        let quota = unlimited();

        let invocation = backend.call(&request(), &quota, far_deadline(), &CancellationToken::new()).await;

        assert!(invocation.outcome.is_ok());
        assert!((quota.usage().daily_spent - 0.004).abs() < 1e-9);
        assert_eq!(quota.usage().pending, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_wait_to_deadline_is_not_billed() {
        let mock = Arc::new(MockBackend::new("text"));
        let config = config().with_rate_limit(RateLimitConfig {
            per_minute: 1,
            per_hour: 100,
            max_wait_ms: 120_000,
        });
        let (backend, observer) = wrap(&mock, config);
        let quota = unlimited();
        let cancel = CancellationToken::new();

        backend.call(&request(), &quota, far_deadline(), &cancel).await.outcome.unwrap();
        let spent = quota.usage().daily_spent;

        // The next minute slot opens exactly at the deadline.
        let deadline = Instant::now() + Duration::from_secs(60);
        let invocation = backend.call(&request(), &quota, deadline, &cancel).await;

        assert_eq!(invocation.outcome.unwrap_err().kind, FailureKind::Timeout);
        assert_eq!(invocation.billed_cost, 0.0);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(quota.usage().daily_spent, spent);
        assert_eq!(backend.circuit_state(), CircuitState::Closed);
        assert_eq!(
            observer.statuses().last(),
            Some(&CallStatus::Rejected(FailureKind::Timeout))
        );
    }
}
