//! Backoff Strategies
//!
//! The gate asks a [`Backoff`] how long to wait after each failed attempt, so
//! the retry policy can be swapped without touching the retry loop. The gate
//! clips every delay to the time left before its deadline.

use rand::Rng;
use std::time::Duration;

/// Decides how long to wait before the next connection attempt.
pub trait Backoff: Send + Sync {
    /// Delay after failed attempt number `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

impl<B: Backoff + ?Sized> Backoff for Box<B> {
    fn delay(&self, attempt: u32) -> Duration {
        (**self).delay(attempt)
    }
}

/// The same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for FixedInterval {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Backoff for FixedInterval {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Exponential growth from `initial_delay`, capped at `max_delay`, with up to
/// `jitter_ratio` of the delay added at random so restarting replicas do not
/// retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    /// At least 1.0
    multiplier: f64,
    /// Upper bound on any delay, jitter included
    max_delay: Duration,
    /// In `0.0..=1.0`; 0.0 disables jitter
    jitter_ratio: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.1,
        }
    }
}

impl ExponentialBackoff {
    /// Starts at `initial_delay` and doubles up to `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Growth factor per failure. Values below 1.0, and NaN, become 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_nan() { 1.0 } else { multiplier.max(1.0) };
        self
    }

    /// Fraction of the delay added as random jitter, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        self
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Delay before jitter is applied.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = base.as_secs_f64() * self.jitter_ratio * rand::thread_rng().gen_range(0.0..1.0);
        (base + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval_ignores_attempt() {
        let backoff = FixedInterval::new(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(40), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.5);
        for attempt in 1..8 {
            let base = backoff.base_delay(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            assert!(delay <= base.mul_f64(1.5) + Duration::from_nanos(1));
            assert!(delay <= backoff.max_delay);
        }
    }

    #[test]
    fn test_out_of_range_settings_are_clamped() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_multiplier(-3.0)
            .with_jitter(7.0);
        assert_eq!(backoff.multiplier(), 1.0);
        assert_eq!(backoff.jitter_ratio(), 1.0);
        for attempt in [1, 2, 3, 64, u32::MAX] {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_millis(100), "attempt {attempt}: {delay:?}");
            assert!(delay <= backoff.max_delay(), "attempt {attempt}: {delay:?}");
        }

        let nan = ExponentialBackoff::default().with_multiplier(f64::NAN).with_jitter(f64::NAN);
        assert_eq!(nan.multiplier(), 1.0);
        assert_eq!(nan.delay(10), nan.initial_delay());
    }

    #[test]
    fn test_boxed_backoff() {
        let backoff: Box<dyn Backoff> = Box::new(FixedInterval::new(Duration::from_secs(2)));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
    }
}
