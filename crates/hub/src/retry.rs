//! Backoff policy for optimistic-concurrency retries.

use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter.
///
/// Attempt `n` (1-based) that fails waits `initial * factor^(n-1)`, capped at
/// `max_delay`, plus up to `jitter` of that delay at random.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub steps: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay added at random (0.1 = up to +10%).
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 4,
            initial_delay: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_steps(steps: u32) -> Self {
        Self { steps: steps.max(1), ..Default::default() }
    }

    /// Delay before the attempt following failed attempt `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exp);
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64())).unwrap_or(self.max_delay)
    }

    /// Jittered delay, never above `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !(self.jitter.is_finite() && self.jitter > 0.0) {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter.min(1.0));
        let jittered = Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + extra)).unwrap_or(self.max_delay);
        jittered.min(self.max_delay)
    }
}
