//! Exponential backoff with symmetric jitter.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor: factor.max(1.0),
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// `min(max, initial * factor^(attempt-1))` before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        Duration::from_millis(base.min(self.max.as_millis() as f64) as u64)
    }

    /// Delay before retry number `attempt` (1-based), jittered by
    /// `±delay * jitter` and never above `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let clamped = self.base_delay_for(attempt).as_millis() as f64;

        let jittered = if self.jitter > 0.0 {
            let jitter_range = clamped * self.jitter;
            let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (clamped + jitter_offset).clamp(0.0, self.max.as_millis() as f64)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}
