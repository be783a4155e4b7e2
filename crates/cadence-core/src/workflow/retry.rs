//! Retry decisions and exponential backoff for action tasks.
//!
//! Stateless: every function takes the `RetryPolicy` as a parameter.
//! Delay for retry `n` (0-based) is `base * 2^n` plus up to
//! `jitter_ratio * base * 2^n` of random jitter, capped at `max_delay_ms`.
//! Because the jitter ratio is clamped to 0.5, successive delays are
//! non-decreasing for any jitter samples.

use std::time::Duration;

use cadence_types::config::RetryPolicy;
use rand::Rng;

/// Stateless retry handler for transient action failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(max_attempts: u32, attempts_made: u32) -> bool {
        attempts_made < max_attempts
    }

    /// Effective attempt limit for a node, honouring a per-node override.
    /// Never less than one.
    pub fn max_attempts(policy: &RetryPolicy, node_override: Option<u32>) -> u32 {
        node_override.unwrap_or(policy.max_attempts).max(1)
    }

    /// Backoff delay for retry `retry` with a jitter sample in `[0, 1)`.
    pub fn delay_with_sample(policy: &RetryPolicy, retry: u32, sample: f64) -> Duration {
        let sample = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let cap = policy.max_delay_ms as f64;
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX).min(1023);
        let unjittered = policy.base_delay_ms as f64 * 2f64.powi(exponent);
        let jitter = unjittered * policy.effective_jitter_ratio() * sample;
        let millis = (unjittered + jitter).min(cap);
        Duration::from_millis(millis as u64)
    }

    /// Backoff delay for retry `retry` with a random jitter sample.
    pub fn delay(policy: &RetryPolicy, retry: u32) -> Duration {
        let sample: f64 = rand::thread_rng().r#gen();
        Self::delay_with_sample(policy, retry, sample)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.5,
        }
    }

    #[test]
    fn test_should_retry_bounds() {
        assert!(RetryHandler::should_retry(3, 1));
        assert!(RetryHandler::should_retry(3, 2));
        assert!(!RetryHandler::should_retry(3, 3));
        assert!(!RetryHandler::should_retry(3, 4));
    }

    #[test]
    fn test_max_attempts_override() {
        let p = policy();
        assert_eq!(RetryHandler::max_attempts(&p, None), 5);
        assert_eq!(RetryHandler::max_attempts(&p, Some(2)), 2);
        assert_eq!(RetryHandler::max_attempts(&p, Some(0)), 1);
    }

    #[test]
    fn test_exponential_without_jitter() {
        let p = policy();
        let delays: Vec<u64> = (0..4)
            .map(|n| RetryHandler::delay_with_sample(&p, n, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_delays_non_decreasing_and_bounded() {
        let p = policy();
        // Worst case for monotonicity: max jitter then zero jitter.
        for n in 0..40 {
            let high = RetryHandler::delay_with_sample(&p, n, 0.999_999);
            let next_low = RetryHandler::delay_with_sample(&p, n + 1, 0.0);
            assert!(next_low >= high, "retry {n}: {next_low:?} < {high:?}");
            assert!(high <= Duration::from_millis(p.max_delay_ms));
        }
        assert_eq!(
            RetryHandler::delay_with_sample(&p, 1000, 0.3),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn test_random_delays_non_decreasing() {
        let p = policy();
        let mut last = Duration::ZERO;
        for n in 0..12 {
            let d = RetryHandler::delay(&p, n);
            assert!(d >= last);
            assert!(d <= Duration::from_millis(p.max_delay_ms));
            last = d;
        }
    }

    #[test]
    fn test_jitter_ratio_clamped() {
        let mut p = policy();
        p.jitter_ratio = 4.0;
        let d = RetryHandler::delay_with_sample(&p, 0, 1.0);
        assert_eq!(d, Duration::from_millis(1500));
    }
}
