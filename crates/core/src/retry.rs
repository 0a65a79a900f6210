use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Per-task retry budget and backoff shape.
///
/// `max_attempts` counts every attempt, including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub auth_retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            auth_retry_limit: 1,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            auth_retry_limit: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("MAX_RETRIES must be >= 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::invalid_config(
                "RETRY_BASE_DELAY_MS must be <= RETRY_MAX_DELAY_MS",
            ));
        }
        Ok(())
    }

    /// Un-jittered delay after the `attempt`-th failed attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Backoff with +/-25% jitter, clamped to `[1ms, max_delay_ms]`.
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }

        let upper_cap = self.max_delay_ms.max(1);
        let capped = base.min(upper_cap);
        let spread = (capped as f64 * 0.25).max(1.0);
        let lower = (capped as f64 - spread).max(1.0);
        let upper = (capped as f64 + spread).min(upper_cap as f64).max(lower);

        Duration::from_millis(rng.random_range(lower..=upper).round() as u64)
    }
}
