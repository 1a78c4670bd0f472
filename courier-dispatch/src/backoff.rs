//! Exponential backoff between dispatch attempts

use std::time::Duration;

use rand::Rng;

/// Maps a 0-based retry index to the wait before the next attempt.
///
/// # Formula
/// `delay = min(base * 2^n, max_delay) * (1 ± jitter_factor)`
///
/// With the defaults (`base = 1s`, no cap, no jitter) the waits are 1s, 2s,
/// 4s, 8s, ...
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: None,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
            jitter_factor: 0.0,
        }
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// The delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        // Saturate rather than overflow for absurd attempt counts
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(multiplier);
        let delay = self.max_delay.map_or(delay, |max| delay.min(max));

        if self.jitter_factor <= 0.0 {
            return delay;
        }

        let jitter = self.jitter_factor.min(1.0);
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default_doubles_from_one_second() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (0..4).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_max_delay_caps() {
        let policy = BackoffPolicy::default().with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(policy.delay(20), Duration::from_secs(5));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert!(policy.delay(64) >= policy.delay(31));
        assert!(policy.delay(u32::MAX) > Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::default().with_jitter(0.25);
        for _ in 0..200 {
            let delay = policy.delay(1).as_millis();
            assert!((1500..=2500).contains(&delay), "{delay}");
        }
    }
}
