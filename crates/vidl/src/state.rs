use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Shared retry budget counter, handed to the worker pool.
pub type RetryCounter = Arc<AtomicU32>;

/// Per-batch counters shared by workers, the speed governor and the progress
/// timer. All mutation goes through these methods.
#[derive(Debug, Default)]
pub struct BatchCounters {
    total: AtomicU64,
    finished: AtomicU64,
    downloaded_bytes: AtomicU64,
    interval_bytes: AtomicU64,
    retries: RetryCounter,
    max_retries: AtomicU32,
}

impl BatchCounters {
    pub fn new(total: u64, max_retries: u32) -> Self {
        let counters = Self::default();
        counters.total.store(total, Ordering::Relaxed);
        counters.max_retries.store(max_retries, Ordering::Relaxed);
        counters
    }

    /// Give a restarted batch a fresh retry budget. Progress counters carry
    /// over so they never move backwards.
    pub fn reset_retries(&self) {
        self.retries.store(0, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Record bytes received in the current sampling interval. Feeds the
    /// speed figure and the limiter; failed attempts count here too.
    pub fn record_interval(&self, n: u64) {
        self.interval_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Mark one item finished with `bytes` on disk. Called once the final
    /// file exists, whether written now or by an earlier run. The finished
    /// count never exceeds `total`.
    pub fn finish_item(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let _ = self
            .finished
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < total).then_some(n + 1)
            });
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn interval_bytes(&self) -> u64 {
        self.interval_bytes.load(Ordering::Relaxed)
    }

    /// Reset the sampling window, returning the bytes it held.
    pub fn take_interval(&self) -> u64 {
        self.interval_bytes.swap(0, Ordering::Relaxed)
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn retry_counter(&self) -> RetryCounter {
        Arc::clone(&self.retries)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, interval: Duration) -> ProgressSnapshot {
        ProgressSnapshot::compute(
            self.total(),
            self.finished(),
            self.downloaded_bytes(),
            self.interval_bytes(),
            interval,
            self.retries(),
            self.max_retries(),
        )
    }
}

/// Point-in-time view of a VOD batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub finished: u64,
    pub percentage: f64,
    pub downloaded_bytes: u64,
    pub total_bytes_estimate: u64,
    pub speed_bytes_per_sec: u64,
    pub eta_secs: Option<u64>,
    pub retry_count: u32,
    pub max_retry: u32,
}

impl ProgressSnapshot {
    pub fn compute(
        total: u64,
        finished: u64,
        downloaded_bytes: u64,
        interval_bytes: u64,
        interval: Duration,
        retry_count: u32,
        max_retry: u32,
    ) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            finished as f64 / total as f64
        };
        // Extrapolate from the average size of finished items.
        let total_bytes_estimate = if finished == 0 {
            0
        } else {
            (downloaded_bytes as u128 * total as u128 / finished as u128) as u64
        };
        let secs = interval.as_secs_f64();
        let speed_bytes_per_sec = if secs > 0.0 {
            (interval_bytes as f64 / secs) as u64
        } else {
            0
        };
        let eta_secs = (speed_bytes_per_sec > 0 && total_bytes_estimate > 0)
            .then(|| total_bytes_estimate.saturating_sub(downloaded_bytes) / speed_bytes_per_sec);

        Self {
            total,
            finished,
            percentage,
            downloaded_bytes,
            total_bytes_estimate,
            speed_bytes_per_sec,
            eta_secs,
            retry_count,
            max_retry,
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Progress: {}/{} ({:.2}%) -- {}/{} ({}/s @ {}) -- Retry ({}/{})",
            self.finished,
            self.total,
            self.percentage * 100.0,
            format_bytes(self.downloaded_bytes),
            format_bytes(self.total_bytes_estimate),
            format_bytes(self.speed_bytes_per_sec),
            format_eta(self.eta_secs),
            self.retry_count,
            self.max_retry,
        )
    }
}

/// Point-in-time view of a live recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecProgress {
    pub recorded_secs: f64,
    pub finished: u64,
    pub downloaded_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub retry_count: u32,
    pub max_retry: u32,
    pub lost: u64,
}

impl fmt::Display for RecProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rec: {} -- {} segments, {} ({}/s) -- Lost {} -- Retry ({}/{})",
            format_eta(Some(self.recorded_secs as u64)),
            self.finished,
            format_bytes(self.downloaded_bytes),
            format_bytes(self.speed_bytes_per_sec),
            self.lost,
            self.retry_count,
            self.max_retry,
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn format_eta(secs: Option<u64>) -> String {
    match secs {
        Some(secs) => format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60),
        None => "--:--:--".to_owned(),
    }
}
