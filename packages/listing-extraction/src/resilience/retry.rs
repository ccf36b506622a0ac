//! Exponential backoff with jitter.

use std::time::Duration;

use crate::types::config::RetryConfig;

/// Delay schedule between attempts.
///
/// Delay before retry `n` (1-based) is `base * 2^(n-1)`, capped, with equal
/// jitter: half the delay is fixed and the other half is random.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }

    /// Upper bound of the delay before retry `retry`, without jitter.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Jittered delay before retry `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        let half = ceiling / 2;
        half + half.mul_f64(fastrand::f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        })
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let backoff = backoff();
        assert_eq!(backoff.ceiling(1), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(400));
        assert_eq!(backoff.ceiling(5), Duration::from_millis(1_000));
        assert_eq!(backoff.ceiling(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let backoff = backoff();
        for retry in 1..6 {
            let ceiling = backoff.ceiling(retry);
            for _ in 0..50 {
                let delay = backoff.delay(retry);
                assert!(delay >= ceiling / 2, "{delay:?} below half of {ceiling:?}");
                assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
            }
        }
    }
}
