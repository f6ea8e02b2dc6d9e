//! Reconnect backoff and adaptive probe cadence.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth factor shared by every backoff in the bridge.
pub const BACKOFF_FACTOR: f64 = 1.5;

// =============================================================================
// Reconnect Policy
// =============================================================================

/// Exponential backoff with a cap and a hard attempt budget.
///
/// For attempt `n` (1-indexed): `delay = min(base × factor^(n−1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base: Duration::from_secs(1),
            factor: BACKOFF_FACTOR,
            cap: Duration::from_secs(15),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.cap)
    }

    /// Reject policies that cannot produce a growing, finite cycle.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.base.is_zero() {
            return Err("reconnect base delay must be positive");
        }
        if !(self.factor.is_finite() && self.factor >= 1.0) {
            return Err("reconnect factor must be at least 1");
        }
        if self.cap < self.base {
            return Err("reconnect cap must not be below the base delay");
        }
        if self.max_attempts == 0 {
            return Err("reconnect needs at least one attempt");
        }
        Ok(())
    }

    /// All delays of one reconnect cycle, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|n| self.delay(n))
    }
}

// =============================================================================
// Adaptive Interval
// =============================================================================

/// Probe interval that slows down while a probe keeps failing.
///
/// Once more than `threshold` consecutive failures were seen, every further
/// failure multiplies the interval by `factor` up to `max`. One success snaps
/// it back to `base`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveInterval {
    base: Duration,
    max: Duration,
    factor: f64,
    threshold: u32,
    current: Duration,
    failures: u32,
}

impl AdaptiveInterval {
    pub fn new(base: Duration, max: Duration) -> Self {
        AdaptiveInterval {
            base,
            max,
            factor: BACKOFF_FACTOR,
            threshold: 0,
            current: base,
            failures: 0,
        }
    }

    /// Tolerate this many consecutive failures before slowing down.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed probe and return the interval until the next one.
    pub fn failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.threshold {
            let next = self.current.as_secs_f64() * self.factor;
            self.current = Duration::from_secs_f64(next.min(self.max.as_secs_f64()));
        }
        self.current
    }

    /// Record a successful probe and return the interval until the next one.
    pub fn success(&mut self) -> Duration {
        self.failures = 0;
        self.current = self.base;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(2250),
                Duration::from_millis(3375),
                Duration::from_micros(5_062_500),
                Duration::from_micros(7_593_750),
                Duration::from_micros(11_390_625),
                Duration::from_secs(15),
                Duration::from_secs(15),
                Duration::from_secs(15),
            ]
        );
    }

    #[test]
    fn test_bad_factor_never_yields_a_negative_delay() {
        let policy = ReconnectPolicy {
            factor: -2.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), policy.cap);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectPolicy::default().validate().is_ok());
        let zero_attempts = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(zero_attempts.validate().is_err());
        let no_base = ReconnectPolicy {
            base: Duration::ZERO,
            ..ReconnectPolicy::default()
        };
        assert!(no_base.validate().is_err());
    }

    #[test]
    fn test_policy_huge_attempt_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(10_000), Duration::from_secs(15));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_process_probe_backs_off_immediately() {
        let mut probe = AdaptiveInterval::new(Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(probe.failure(), Duration::from_secs(3));
        assert_eq!(probe.failure(), Duration::from_millis(4500));
        assert_eq!(probe.failure(), Duration::from_secs(5));
        assert_eq!(probe.failure(), Duration::from_secs(5));
        assert_eq!(probe.success(), Duration::from_secs(2));
    }

    #[test]
    fn test_api_probe_tolerates_threshold() {
        let mut probe = AdaptiveInterval::new(Duration::from_secs(1), Duration::from_secs(5))
            .with_threshold(5);
        for _ in 0..5 {
            assert_eq!(probe.failure(), Duration::from_secs(1));
        }
        assert_eq!(probe.failure(), Duration::from_millis(1500));
        assert_eq!(probe.failures(), 6);
        assert_eq!(probe.success(), Duration::from_secs(1));
        assert_eq!(probe.failures(), 0);
    }
}
