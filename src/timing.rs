//! Retry and pacing control for probe attempts
//!
//! Transient failures are retried a small fixed number of times with a
//! fixed backoff inside a single (probe, target) attempt.

use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::error::{ReconError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// `attempt` is 1-based
    pub fn should_retry(&self, error: &ReconError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempts
    /// run out. Each call is bounded by `per_call_timeout`.
    pub async fn run<T, F, Fut>(&self, per_call_timeout: Duration, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(per_call_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(ReconError::timeout(
                    "probe call",
                    per_call_timeout.as_millis() as u64,
                )),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(&error, attempt) => {
                    tracing::debug!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Retrying after transient error"
                    );
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}
