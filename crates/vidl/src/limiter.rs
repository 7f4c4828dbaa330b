use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, Result};
use crate::state::BatchCounters;

/// Largest read slice handled per limiter check.
pub const BLOCK_SIZE: usize = 4096;
const SPIN_DELAY: Duration = Duration::from_millis(1);

/// Aggregate speed cap shared by every worker of a batch.
///
/// Approximates a token bucket refilled once per reporting interval: workers
/// stall while the interval's byte count is at the limit, and the progress
/// timer resets that count every interval. Each worker may overshoot by at
/// most one slice per interval, which the limit subtracts up front. Slices
/// shrink for small budgets so that `limit + concurrency * slice` never
/// exceeds `interval * rate`.
#[derive(Debug, Clone, Copy)]
pub struct SpeedLimiter {
    limit: Option<u64>,
    slice: usize,
}

impl SpeedLimiter {
    pub fn new(max_speed: Option<u64>, interval: Duration, concurrency: usize) -> Self {
        let Some(rate) = max_speed else {
            return Self::unlimited();
        };
        let workers = concurrency.max(1) as u64;
        let budget = interval_budget(rate, interval);
        let slice = (budget / (workers + 1)).clamp(1, BLOCK_SIZE as u64);
        // Budgets of `concurrency` bytes or less are rejected by config
        // validation; the floor keeps a direct caller from deadlocking.
        let limit = budget.saturating_sub(workers * slice).max(1);
        Self {
            limit: Some(limit),
            slice: slice as usize,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: None,
            slice: BLOCK_SIZE,
        }
    }

    /// Byte budget per interval, `None` when unlimited.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Largest number of bytes a worker may move after one successful wait.
    pub fn slice(&self) -> usize {
        self.slice
    }

    /// Wait until the current interval has room for another block.
    pub async fn wait(&self, counters: &BatchCounters, token: &CancellationToken) -> Result<()> {
        let Some(limit) = self.limit else {
            return Ok(());
        };
        while counters.interval_bytes() >= limit {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(SPIN_DELAY) => {}
            }
        }
        Ok(())
    }
}

/// Bytes the cap allows per interval.
pub fn interval_budget(rate: u64, interval: Duration) -> u64 {
    (interval.as_secs_f64() * rate as f64) as u64
}
