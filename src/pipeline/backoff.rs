use std::time::Duration;

use crate::config::RecoveryConfig;

/// Exponential rebuild delay with an optional attempt ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base
            .checked_mul(exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Whether `failures` consecutive failures exceed the ceiling
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures > max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), None);
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_ceiling() {
        let unbounded = Backoff::from_config(&RecoveryConfig::default());
        assert!(!unbounded.exhausted(u32::MAX));

        let bounded = Backoff::new(Duration::from_secs(1), Duration::from_secs(2), Some(3));
        assert!(!bounded.exhausted(3));
        assert!(bounded.exhausted(4));
    }
}
