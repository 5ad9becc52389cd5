use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{Result, SandboxError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Bounded, fixed-delay retry for transient filesystem contention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(SandboxError::InvalidOperation(
                "retry max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt ceiling is reached. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancellation: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancellation.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            debug!(operation = label, attempt, max = self.max_attempts, "attempting");
            match operation().await {
                Ok(value) => {
                    info!(operation = label, attempt, "operation succeeded");
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    warn!(operation = label, attempt, %err, "operation failed, not retrying");
                    return Err(err);
                }
                Err(err) if attempt >= self.max_attempts => {
                    error!(operation = label, attempts = attempt, %err, "all attempts failed");
                    return Err(err);
                }
                Err(err) => {
                    warn!(operation = label, attempt, %err, delay = ?self.delay, "attempt failed");
                }
            }
            tokio::select! {
                _ = cancellation.cancelled() => return Err(SandboxError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            attempt += 1;
        }
    }
}
