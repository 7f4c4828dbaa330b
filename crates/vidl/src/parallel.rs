//! Bounded worker pool with a shared, batch-wide retry budget.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{DownloadError, Result};
use crate::state::RetryCounter;

/// Runs items with at most `concurrency` in flight.
///
/// A failed item is retried in place by the task that ran it. Every retry in
/// the batch draws from one shared budget of `max_retries`; the failure that
/// finds the budget empty cancels the remaining work and ends the batch with
/// [`DownloadError::OverRetry`].
#[derive(Debug, Clone)]
pub struct ParallelTask {
    pub concurrency: usize,
    /// Pause after each dispatch and before each retry.
    pub delay: Duration,
    pub max_retries: u32,
}

impl ParallelTask {
    pub fn new(concurrency: usize, delay: Duration, max_retries: u32) -> Self {
        Self {
            concurrency: concurrency.max(1),
            delay,
            max_retries,
        }
    }

    /// Run `worker` over `items`.
    ///
    /// Returns `Cancelled` when `token` fires, independent of any failure the
    /// cancellation caused in flight.
    pub async fn run<T, I, F, Fut>(
        &self,
        items: I,
        worker: F,
        retries: RetryCounter,
        token: &CancellationToken,
    ) -> Result<()>
    where
        T: Clone + Send + 'static,
        I: IntoIterator<Item = T>,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let worker = Arc::new(worker);
        let child = token.child_token();
        let mut queue: VecDeque<T> = items.into_iter().collect();
        let mut tasks = JoinSet::new();
        let mut failure: Option<DownloadError> = None;

        debug!(
            items = queue.len(),
            concurrency = self.concurrency,
            max_retries = self.max_retries,
            "Starting worker pool"
        );

        loop {
            if failure.is_none()
                && !child.is_cancelled()
                && tasks.len() < self.concurrency
                && let Some(item) = queue.pop_front()
            {
                tasks.spawn(run_item(
                    item,
                    Arc::clone(&worker),
                    Arc::clone(&retries),
                    self.max_retries,
                    self.delay,
                    child.clone(),
                ));
                pause(self.delay, &child).await;
                continue;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => DownloadError::internal(format!("worker task failed: {join_err}")),
            };
            if err.is_cancelled() || failure.is_some() {
                continue;
            }
            error!(error = %err, "Worker pool failing, cancelling remaining work");
            child.cancel();
            failure = Some(err);
        }

        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_item<T, F, Fut>(
    item: T,
    worker: Arc<F>,
    retries: RetryCounter,
    max_retries: u32,
    delay: Duration,
    token: CancellationToken,
) -> Result<()>
where
    T: Clone,
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let err = match worker(item.clone(), token.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if token.is_cancelled() || err.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if !err.is_retryable() {
            token.cancel();
            return Err(err);
        }

        let granted = retries.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
            (used < max_retries).then_some(used + 1)
        });
        match granted {
            Ok(used) => {
                warn!(
                    retry = used + 1,
                    max = max_retries,
                    error = %err,
                    "Retrying item after failure"
                );
            }
            Err(_) => {
                token.cancel();
                return Err(DownloadError::over_retry(max_retries + 1, err));
            }
        }
        pause(delay, &token).await;
    }
}

async fn pause(delay: Duration, token: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
