use rand::Rng;
use std::time::Duration;

/// Jitter applied around each base delay (±30%)
pub const JITTER_FRACTION: f64 = 0.3;

/// Exponential reconnect delays: `min(max, initial * 2^attempt)` with jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first attempt
    pub initial: Duration,
    /// Upper bound for the base delay
    pub max: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

impl Backoff {
    /// New policy
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
        }
    }

    /// Base delay for attempt `attempt` (0-based), before jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay for attempt `attempt`, or `None` once attempts are exhausted
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let base = self.base_delay(attempt);
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        Some(base.mul_f64(factor))
    }
}
