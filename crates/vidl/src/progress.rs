use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::state::{BatchCounters, ProgressSnapshot};

pub type ProgressCallback<S> = Arc<dyn Fn(S) + Send + Sync>;

type Tick = Arc<dyn Fn() + Send + Sync>;

/// Fixed-interval progress timer.
///
/// Each tick samples the counters, resets the speed window and hands the
/// snapshot to the callback. A panicking callback is logged and ignored.
/// [`stop`](Self::stop) halts the timer and emits exactly one final tick.
pub struct ProgressReporter {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    tick: Tick,
}

impl ProgressReporter {
    pub fn start<F>(interval: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let tick: Tick = Arc::new(tick);
        let token = CancellationToken::new();

        let handle = {
            let tick = Arc::clone(&tick);
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => run_tick(&tick),
                    }
                }
                trace!("Progress timer stopped");
            })
        };

        Self {
            token,
            handle: Some(handle),
            tick,
        }
    }

    /// Reporter for a VOD batch.
    pub fn for_batch(
        counters: Arc<BatchCounters>,
        interval: Duration,
        callback: Option<ProgressCallback<ProgressSnapshot>>,
    ) -> Self {
        Self::start(interval, move || {
            let snapshot = counters.snapshot(interval);
            counters.take_interval();
            if let Some(callback) = &callback {
                callback(snapshot);
            }
        })
    }

    /// Stop the timer and emit the final snapshot.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Progress timer task failed");
        }
        run_tick(&self.tick);
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn run_tick(tick: &Tick) {
    if catch_unwind(AssertUnwindSafe(|| tick())).is_err() {
        warn!("Progress callback panicked, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn ticks_then_emits_one_final_snapshot() {
        let ticks = Arc::new(AtomicU32::new(0));
        let reporter = {
            let ticks = Arc::clone(&ticks);
            ProgressReporter::start(Duration::from_millis(20), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(110)).await;
        reporter.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 3, "expected periodic ticks, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn stop_before_first_interval_still_reports_once() {
        let ticks = Arc::new(AtomicU32::new(0));
        let reporter = {
            let ticks = Arc::clone(&ticks);
            ProgressReporter::start(Duration::from_secs(60), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
        };
        reporter.stop().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_callback_is_isolated() {
        let ticks = Arc::new(AtomicU32::new(0));
        let reporter = {
            let ticks = Arc::clone(&ticks);
            ProgressReporter::start(Duration::from_millis(10), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                panic!("callback failure");
            })
        };
        tokio::time::sleep(Duration::from_millis(55)).await;
        reporter.stop().await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn batch_reporter_resets_speed_window() {
        let counters = Arc::new(BatchCounters::new(2, 0));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let callback: ProgressCallback<ProgressSnapshot> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |snapshot: ProgressSnapshot| seen.lock().push(snapshot))
        };

        let reporter = ProgressReporter::for_batch(
            Arc::clone(&counters),
            Duration::from_secs(60),
            Some(callback),
        );
        counters.record_interval(2048);
        counters.finish_item(2048);
        reporter.stop().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].finished, 1);
        assert_eq!(seen[0].downloaded_bytes, 2048);
        assert_eq!(counters.interval_bytes(), 0);
    }
}
