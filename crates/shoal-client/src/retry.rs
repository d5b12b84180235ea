//! Sleep schedule between attempts.

use std::time::Duration;

use crate::policy::BasePolicy;

/// Backoff between retries: a base sleep multiplied after every retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    interval: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Start at `initial`; multipliers `<= 1` keep the sleep fixed.
    pub fn new(initial: Duration, multiplier: f64) -> Self {
        Self {
            interval: initial,
            multiplier,
        }
    }

    /// Schedule from a policy's sleep settings.
    pub fn from_policy(policy: &BasePolicy) -> Self {
        Self::new(policy.sleep_between_retries(), policy.sleep_multiplier)
    }

    /// True if retries sleep at all.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Sleep for the next retry, without advancing.
    pub fn current(&self) -> Duration {
        self.interval
    }

    /// Move to the following retry's sleep.
    pub fn advance(&mut self) {
        if self.multiplier > 1.0 {
            self.interval = self.interval.mul_f64(self.multiplier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval() {
        let mut b = Backoff::new(Duration::from_millis(10), 1.0);
        for _ in 0..3 {
            assert_eq!(b.current(), Duration::from_millis(10));
            b.advance();
        }
    }

    #[test]
    fn test_exponential_interval() {
        let mut b = Backoff::new(Duration::from_millis(10), 2.0);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(b.current().as_millis());
            b.advance();
        }
        assert_eq!(seen, vec![10, 20, 40, 80]);
    }

    #[test]
    fn test_disabled() {
        let policy = BasePolicy::default();
        let b = Backoff::from_policy(&policy);
        assert!(!b.is_enabled());
    }
}
