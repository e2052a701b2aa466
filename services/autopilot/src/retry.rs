//! Retry policy for collaborator calls
//!
//! A single policy object is injected into every call site. Only transient
//! errors are retried; anything else is returned on the first failure.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Spread delays by up to ±25%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: true,
        }
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let delay = base
            .saturating_mul(1_u64 << attempt.min(16))
            .min(self.max_backoff.as_millis() as u64);

        let delay = if self.jitter && delay >= 4 {
            let jitter_range = delay / 4;
            let jitter = rand::random::<u64>() % (jitter_range * 2 + 1);
            delay.saturating_sub(jitter_range) + jitter
        } else {
            delay
        };

        Duration::from_millis(delay)
    }

    /// Run `operation` until it succeeds, fails non-transiently, or attempts run out
    pub async fn run<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        name, attempt, self.max_attempts, e
                    );
                    if attempt >= self.max_attempts {
                        return Err(PipelineError::RetriesExhausted {
                            operation: name.to_string(),
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = self.backoff(attempt - 1);
                    debug!("Retrying {} after {:?}", name, delay);
                    sleep(delay).await;
                }
            }
        }
    }
}
