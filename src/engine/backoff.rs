//! Re-arm delay after failed cycles.
//!
//! Connectivity failures back off exponentially from `base` up to `max`
//! with symmetric jitter. A successful cycle resets the streak.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_factor: 0.2,
            failures: 0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.failures.min(16) as i32;
        self.failures = self.failures.saturating_add(1);

        let raw = self.base.as_secs_f64() * 2.0_f64.powi(exp);
        let clamped = raw.min(self.max.as_secs_f64());
        let jitter_range = clamped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((clamped + jitter).clamp(0.0, self.max.as_secs_f64()))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
