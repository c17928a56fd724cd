//! Bounded exponential backoff.

use std::time::Duration;

use crate::config::{BackendConfig, SchedulerConfig};

/// Exponential backoff with a multiplicative factor and a hard cap.
///
/// `delay(n)` is `base * factor^(n-1)` clamped to `max`, and zero for `n = 0`.
/// With `factor >= 1.0` the sequence is non-decreasing in `n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max }
    }

    /// Policy between synchronous attempts of a backend call.
    pub fn for_attempts(config: &BackendConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_factor, config.backoff_max)
    }

    /// Policy between local retry queue replays. Seeded by the replay delay
    /// and never capped below it.
    pub fn for_replays(config: &BackendConfig) -> Self {
        Self::new(
            config.local_queue_retry_delay,
            config.backoff_factor,
            config.backoff_max.max(config.local_queue_retry_delay),
        )
    }

    /// Policy for a job's retry-after hint while degraded.
    pub fn for_degradation(config: &SchedulerConfig) -> Self {
        Self::new(
            config.degraded_base_delay,
            config.degraded_backoff_factor,
            config.degraded_max_delay,
        )
    }

    /// Delay before retry number `n` (1-based).
    pub fn delay(&self, n: u32) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }

        // Past 64 doublings any sane cap has long been reached.
        let exponent = (n - 1).min(64) as i32;
        let secs = self.base.as_secs_f64() * self.factor.max(1.0).powi(exponent);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }

        Duration::from_secs_f64(secs).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60));

        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 3.0, Duration::from_secs(10));

        assert_eq!(policy.delay(3), Duration::from_secs(9));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(1_000), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_non_decreasing_and_bounded() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(150), 1.7, Duration::from_secs(45));

        let mut previous = Duration::ZERO;
        for n in 0..200 {
            let delay = policy.delay(n);
            assert!(delay >= previous, "delay({}) decreased", n);
            assert!(delay <= policy.max);
            previous = delay;
        }
    }

    #[test]
    fn test_replay_policy_never_below_retry_delay() {
        let config = BackendConfig::default()
            .with_backoff(Duration::from_millis(100), 2.0, Duration::from_millis(500))
            .with_local_queue(5, Duration::from_secs(2));

        let policy = BackoffPolicy::for_replays(&config);
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(2));
    }
}
