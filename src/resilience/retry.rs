//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

/// Jitter percentage applied by [`proportional_jitter`] (±20%).
///
/// Randomized delays keep many callers from retrying in lockstep after a
/// shared dependency recovers.
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Minimum delay between attempts, unless the base delay itself is smaller.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Function applied to the computed backoff delay.
pub type JitterFn = fn(Duration) -> Duration;

/// Retry-with-backoff policy consumed by
/// [`CircuitBreaker::call_with_retry`](super::CircuitBreaker::call_with_retry).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: JitterFn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: proportional_jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: proportional_jitter,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Replace the jitter function.
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay`, jittered, then floored at
    /// 100 ms (or at `base_delay` when that is smaller).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        let floor = MIN_RETRY_DELAY.min(self.base_delay);
        (self.jitter)(backoff).max(floor)
    }
}

/// Generate a random value in `[0.0, 1.0)` from the thread-local RNG.
fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// Shift `delay` by a random amount within ±20%.
pub fn proportional_jitter(delay: Duration) -> Duration {
    let factor = 1.0 + BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0);
    delay.mul_f64(factor)
}

/// Identity jitter for deterministic schedules.
pub fn no_jitter(delay: Duration) -> Duration {
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(base_ms), Duration::from_millis(max_ms))
            .with_jitter(no_jitter)
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let p = policy(200, 10_000);
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy(500, 1_000);
        assert_eq!(p.delay_for(10), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_floor_applies_to_jittered_delay() {
        fn shrink(_: Duration) -> Duration {
            Duration::from_millis(1)
        }
        let p = policy(200, 1_000).with_jitter(shrink);
        assert_eq!(p.delay_for(1), MIN_RETRY_DELAY);
    }

    #[test]
    fn test_small_base_is_not_raised_to_floor() {
        let p = policy(5, 1_000);
        assert_eq!(p.delay_for(1), Duration::from_millis(5));
    }

    #[test]
    fn test_proportional_jitter_stays_in_range() {
        let base = Duration::from_millis(1_000);
        for _ in 0..100 {
            let d = proportional_jitter(base);
            assert!(d >= Duration::from_millis(800), "{d:?} below range");
            assert!(d <= Duration::from_millis(1_200), "{d:?} above range");
        }
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let p = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(p.max_attempts, 1);
    }
}
