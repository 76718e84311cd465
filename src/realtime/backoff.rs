//! # Reconnect Backoff
//!
//! Exponential backoff with a hard cap and additive jitter.
//!
//! The delay computation is pure so it can be checked without timers;
//! jitter takes the RNG as a parameter for the same reason.

use std::time::Duration;

use rand::Rng;

/// Delay before the reconnect that follows `attempt` prior consecutive failures:
/// `min(base * 2^attempt, max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Adds a uniformly drawn `0..=ratio` fraction of `delay` on top of it.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, ratio: f64, rng: &mut R) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = rng.gen_range(0.0..=ratio);
    delay + delay.mul_f64(fraction)
}

/// Reconnect policy
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Consecutive failures after which auto-retry stops
    pub max_attempts: u32,
    /// Upper bound of the jitter fraction (0.3 = up to 30% extra)
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter_ratio: 0.3,
        }
    }
}

impl BackoffPolicy {
    /// Jittered delay for the given number of prior consecutive failures
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = backoff_delay(attempt, self.base_delay, self.max_delay);
        apply_jitter(delay, self.jitter_ratio, rng)
    }

    /// Whether `attempts` failures already used up the retry budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
