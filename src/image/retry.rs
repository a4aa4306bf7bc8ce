//! Bounded retry with exponential backoff.
//!
//! The policy is a plain value and the sleep is injected through
//! [`Sleeper`], so the whole schedule can be exercised in tests without
//! waiting on the wall clock.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Something that can pause the current task.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub min_interval_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            min_interval_ms: 500,
            max_interval_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            min_interval_ms: min_interval.as_millis() as u64,
            max_interval_ms: max_interval.as_millis() as u64,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Doubles from `min_interval_ms` and saturates at `max_interval_ms`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .min_interval_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_interval_ms);
        Duration::from_millis(delay)
    }

    /// Runs `operation` until it succeeds or the attempts are exhausted.
    ///
    /// The operation receives the 1-based attempt number. The last error is
    /// returned when every attempt fails.
    pub async fn retry<T, E, F, Fut>(&self, sleeper: &dyn Sleeper, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after failure");
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
