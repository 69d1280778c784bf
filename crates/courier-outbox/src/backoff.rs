//! Retry policy for failed deliveries.
//!
//! `delay = min(max_delay, base_delay * 2^attempts)` plus up to
//! `jitter_ratio * delay` of random jitter. Attempts are the count reported by
//! the caller before this failure, so the first failure (`attempts = 0`) waits
//! one base delay.

use courier_config_and_utils::RetrySettings;
use rand::Rng;
use std::time::Duration;

/// Backoff and dead-letter policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A failure reported with `attempts >= max_retries` dead-letters the item.
    pub max_retries: u32,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_secs(settings.base_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            max_retries: settings.max_retries,
            jitter_ratio: settings.jitter_ratio,
        }
    }

    /// True once the attempt budget is spent.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }

    /// Capped exponential delay, before jitter.
    pub fn base_delay_for(&self, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let multiplier = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay until the next attempt, jitter included.
    pub fn delay_for<R: Rng>(&self, attempts: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_for(attempts);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = delay.mul_f64(rng.gen_range(0.0..self.jitter_ratio));
        delay + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            max_retries: 8,
            jitter_ratio: 0.1,
        }
    }

    #[test]
    fn base_delay_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.base_delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.base_delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.base_delay_for(6), Duration::from_secs(1920));
        assert_eq!(policy.base_delay_for(7), Duration::from_secs(3600));
        assert_eq!(policy.base_delay_for(63), Duration::from_secs(3600));
        assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempts in 0..20u32 {
            let floor = policy.base_delay_for(attempts);
            for _ in 0..50 {
                let delay = policy.delay_for(attempts, &mut rng);
                assert!(delay >= floor);
                assert!(delay <= floor.mul_f64(1.1));
                assert!(delay <= policy.max_delay.mul_f64(1.1));
            }
        }
    }

    #[test]
    fn floor_is_non_decreasing_in_attempts() {
        let policy = policy();
        let floors: Vec<_> = (0..16u32).map(|n| policy.base_delay_for(n)).collect();
        assert!(floors.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter_ratio: 0.0,
            ..policy()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay_for(2, &mut rng), Duration::from_secs(120));
    }

    #[test]
    fn exhaustion_threshold() {
        let policy = policy();
        assert!(!policy.is_exhausted(7));
        assert!(policy.is_exhausted(8));
        assert!(policy.is_exhausted(9));
    }

    #[test]
    fn from_settings_copies_values() {
        let settings = RetrySettings {
            base_delay_secs: 5,
            max_delay_secs: 50,
            max_retries: 3,
            jitter_ratio: 0.2,
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(50));
        assert_eq!(policy.max_retries, 3);
    }
}
