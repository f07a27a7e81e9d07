//! # Reconnect backoff
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, then
//! spread by up to `jitter` of itself in either direction. The base delay
//! depends only on the attempt number so jitter never compounds.

use rand::Rng;
use std::time::Duration;

/// Backoff between reconnection attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap on any single delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Fraction of the base delay to randomize, between 0.0 and 1.0.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay, no jitter.
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Base delay for `attempt` (0-indexed), without jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay to wait before `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        let secs = (base.as_secs_f64() * (1.0 + spread)).max(0.0);
        Duration::from_secs_f64(secs).min(self.max)
    }
}
