//! Retry policy with exponential backoff.
//!
//! The policy doubles the delay on each failed attempt, caps it at a
//! configured maximum, and optionally jitters it to avoid thundering
//! herds when several pipelines retry at once. Rate-limited errors
//! override the computed delay with whatever the remote authority
//! asked for.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use certpilot_config::BackoffConfig;

use crate::errors::{Classify, ErrorClass};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to sleep after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        if self.jitter {
            // Keep at least half the computed delay so retries still back off.
            let factor = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
            raw.mul_f64(factor)
        } else {
            raw
        }
    }

    /// Run `op` until it succeeds, its error stops being retryable, or the
    /// attempt budget runs out. Rate-limited errors sleep for the delay the
    /// authority specified instead of the exponential schedule.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Classify + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = err.class();
                    if !class.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = match class {
                        ErrorClass::RateLimited(after) => {
                            warn!(
                                attempt,
                                retry_after_secs = after.as_secs(),
                                error = %err,
                                "{what} rate limited, honoring requested delay"
                            );
                            after
                        }
                        _ => {
                            let delay = self.delay_for(attempt);
                            debug!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "{what} failed, retrying"
                            );
                            delay
                        }
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
