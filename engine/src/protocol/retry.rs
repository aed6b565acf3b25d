use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::{error, warn};

use crate::error::{CoordinatorError, Result};

/// Fixed-backoff retry of a whole round, optionally bounded by an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub overall_deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_millis(50))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
            overall_deadline: None,
        }
    }

    pub fn with_overall_deadline(mut self, deadline: Duration) -> Self {
        self.overall_deadline = Some(deadline);
        self
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts or exceeds the overall deadline. `op` receives the 1-based
    /// attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut last = None;

        for attempt in 1..=self.max_attempts {
            let outcome = match self.overall_deadline {
                Some(total) => {
                    let remaining = total.saturating_sub(started.elapsed());
                    match timeout(remaining, op(attempt)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            error!(label, attempt, "overall deadline exceeded");
                            return Err(CoordinatorError::Timeout(format!(
                                "{label} exceeded overall deadline of {total:?}"
                            )));
                        }
                    }
                }
                None => op(attempt).await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    error!(label, attempt, error = %e, "non-retryable failure");
                    return Err(e);
                }
                Err(e) => {
                    warn!(label, attempt, max_attempts = self.max_attempts, error = %e, "attempt failed");
                    last = Some(e);
                }
            }

            if attempt < self.max_attempts {
                sleep(self.backoff).await;
            }
        }

        let last = last.unwrap_or_else(|| CoordinatorError::Engine("no attempt was made".into()));
        Err(CoordinatorError::RetriesExhausted {
            label: label.to_string(),
            attempts: self.max_attempts,
            last: Box::new(last),
        })
    }
}
