//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Exponential backoff with full jitter.
///
/// With base_delay=2s, multiplier=2.0, max_delay=1h the ceilings are:
/// - retry 0: 2s
/// - retry 1: 4s
/// - retry 2: 8s
/// - ...
/// - retry 11 and later: 3600s
///
/// The actual delay is drawn uniformly from `[0, ceiling]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    pub multiplier: f64,

    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Budget used when a task is submitted without `max_retries`.
    pub default_max_retries: u32,

    /// Stricter budget for failures the classifier could not categorize.
    pub unknown_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            default_max_retries: 5,
            unknown_max_retries: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_default_max_retries(mut self, n: u32) -> Self {
        self.default_max_retries = n;
        self
    }

    pub fn with_unknown_max_retries(mut self, n: u32) -> Self {
        self.unknown_max_retries = n;
        self
    }

    /// `min(max_delay, base_delay * multiplier ^ retry_count)`.
    ///
    /// `retry_count` is the count before incrementing: the first retry uses
    /// exponent 0.
    pub fn ceiling(&self, retry_count: u32) -> Duration {
        // 2^64 already exceeds any Duration in seconds
        const MAX_EXP: i32 = 64;
        let exp = i32::try_from(retry_count).map_or(MAX_EXP, |e| e.min(MAX_EXP));
        let max_secs = self.max_delay.as_secs_f64();
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Full-jitter delay in `[0, ceiling(retry_count)]`, millisecond resolution.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(retry_count).as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
        assert!(policy.unknown_max_retries < policy.default_max_retries);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 4)]
    #[case(2, 8)]
    #[case(3, 16)]
    #[case(4, 32)]
    #[case(5, 64)]
    #[case(11, 3600)]
    #[case(500, 3600)]
    fn ceiling_doubles_until_capped(#[case] retry_count: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(retry_count), Duration::from_secs(secs));
    }

    #[test]
    fn jittered_delay_stays_within_ceiling() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for retry_count in 0..=12 {
            let ceiling = policy.ceiling(retry_count);
            for _ in 0..200 {
                let d = policy.jittered_delay(retry_count, &mut rng);
                assert!(d <= ceiling, "{d:?} > {ceiling:?} at retry {retry_count}");
            }
        }
    }

    #[test]
    fn jitter_actually_spreads_delays() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let samples: Vec<Duration> = (0..50).map(|_| policy.jittered_delay(5, &mut rng)).collect();
        let distinct: std::collections::HashSet<_> = samples.iter().collect();
        assert!(distinct.len() > 10);
    }

    #[test]
    fn zero_base_delay_yields_zero() {
        let policy = RetryPolicy::new(Duration::ZERO, 2.0, Duration::from_secs(1));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.jittered_delay(3, &mut rng), Duration::ZERO);
    }
}
