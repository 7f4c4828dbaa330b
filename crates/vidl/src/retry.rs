// Outer retry: restarts a whole batch after it failed.
//
// The worker pool already retries single items against a shared budget; this
// layer is for failures that need a fresh plan (expired session, revoked
// keys, a pool that ran out of budget).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DownloadError, Result};

/// Handed to the batch function on every attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 0 on the first call.
    pub attempt: u32,
    pub last_error: Option<Arc<DownloadError>>,
}

#[derive(Debug, Clone)]
pub struct RetryTask {
    pub delay: Duration,
    /// Restarts allowed after the first attempt.
    pub max_retries: u32,
}

impl RetryTask {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    /// Call `batch` until it succeeds, fails with a non-retryable error, or
    /// the restart budget is spent. Exhaustion returns the last error.
    pub async fn run<F, Fut, T>(&self, mut batch: F, token: &CancellationToken) -> Result<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut last_error: Option<Arc<DownloadError>> = None;

        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let context = RetryContext {
                attempt,
                last_error: last_error.take(),
            };
            let err = match batch(context).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt, "Batch succeeded after restart");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if token.is_cancelled() || err.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if !err.is_retryable() || attempt >= self.max_retries {
                return Err(err);
            }

            attempt += 1;
            warn!(
                attempt,
                max = self.max_retries,
                delay_ms = self.delay.as_millis() as u64,
                error = %err,
                "Restarting batch after failure"
            );
            last_error = Some(Arc::new(err));

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}
