//! Backoff timing for failed delivery attempts.
//!
//! The attempt bound itself is enforced by the queue (a failure at the
//! bound dead-letters the item); this module only answers "how long until
//! the next attempt". Jitter spreads retries out so a burst of failures
//! does not come back as a thundering herd.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for retrying failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts per item (including the first).
    pub max_attempts: u32,

    /// Base delay for the backoff calculation.
    pub base_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to the computed delay.
    pub jitter_factor: f64,

    /// Strategy for growing the delay across attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 2s, 4s, 8s, 16s between the five attempts, +-10%
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay between every attempt.
    Fixed,
    /// Delay doubles with each attempt.
    Exponential,
    /// Delay grows by the base amount with each attempt.
    Linear,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based), jittered and
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_number: u32) -> Duration {
        let base = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * attempt_number,
            BackoffStrategy::Exponential => {
                let exponent = attempt_number.saturating_sub(1).min(20);
                self.base_delay * 2_u32.saturating_pow(exponent)
            },
        };

        let capped = std::cmp::min(base, self.max_delay);
        std::cmp::min(apply_jitter(capped, self.jitter_factor), self.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor`. With 0.1, a 10s delay lands
/// between 9s and 11s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
