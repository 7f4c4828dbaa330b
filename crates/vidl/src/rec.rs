//! Live recording: poll a growing playlist and fetch whatever is new.
//!
//! Each round fetches the manifest, diffs it against the set of finished
//! segment indices, downloads the difference one segment at a time and then
//! sleeps until the next segment is expected. A round that fails is restarted
//! by the outer [`RetryTask`]; finished segments survive the restart.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RecConfig};
use crate::download::{SegmentContext, download_item};
use crate::error::{DownloadError, RecOutcome, Result, StopReason};
use crate::keys::KeyCache;
use crate::limiter::SpeedLimiter;
use crate::model::{ByteRange, Manifest, Part};
use crate::parallel::ParallelTask;
use crate::pipeline::{ForeignHeaderStripper, StageFactory};
use crate::planner::{EXT_FRAGMENT, EXT_MAP, EXT_TS, MAP_NAME, WorkItem};
use crate::progress::{ProgressCallback, ProgressReporter};
use crate::retry::RetryTask;
use crate::state::{BatchCounters, RecProgress};
use crate::transport::Transport;

/// Produces the current state of a (possibly live) playlist.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, token: &CancellationToken) -> Result<Manifest>;
}

#[derive(Debug, Clone)]
enum Mark {
    Segment {
        discontinuity: u64,
        index: u64,
        duration: f32,
    },
    Map {
        dir_id: u64,
    },
}

#[derive(Debug, Clone)]
struct RecItem {
    work: WorkItem,
    mark: Mark,
}

/// Identity of a Part across refreshes: its discontinuity sequence and the
/// init map its segments share.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartKey {
    discontinuity: u64,
    map: Option<(String, Option<ByteRange>)>,
}

impl PartKey {
    fn of(part: &Part) -> Self {
        Self {
            discontinuity: part.discontinuity_sequence,
            map: part.map.as_ref().map(|m| (m.uri.clone(), m.byte_range)),
        }
    }
}

/// Session state, kept across restarts of a failed round.
#[derive(Debug, Default)]
struct RecState {
    finished: HashSet<u64>,
    maps: HashSet<u64>,
    dir_ids: HashMap<PartKey, u64>,
    next_dir_id: Option<u64>,
    keys: Arc<KeyCache>,
    high_water_discontinuity: Option<u64>,
    high_water_segment: Option<u64>,
    no_segment_elapsed: Duration,
    recorded: Duration,
    lost: u64,
    restarts: u32,
}

enum Diff {
    Items(Vec<RecItem>),
    Reset { index: u64, high_water: u64 },
}

impl RecState {
    /// Directory number of `part`, fixed the first time the part is seen so
    /// that window shifts never rename or reorder directories.
    fn dir_id(&mut self, part: &Part) -> u64 {
        let key = PartKey::of(part);
        if let Some(&id) = self.dir_ids.get(&key) {
            return id;
        }
        let id = self
            .next_dir_id
            .map_or(part.sequence, |next| next.max(part.sequence));
        self.next_dir_id = Some(id + 1);
        self.dir_ids.insert(key, id);
        id
    }

    /// Unfinished segments of `manifest`, or the reset that invalidates it.
    fn diff(&mut self, manifest: &Manifest, batch_dir: &Path) -> Diff {
        let mut items = Vec::new();

        for part in &manifest.parts {
            let extension = if part.map.is_some() {
                EXT_FRAGMENT
            } else {
                EXT_TS
            };
            let mut placed: Option<(u64, PathBuf)> = None;

            for segment in &part.segments {
                if self.finished.contains(&segment.index) {
                    continue;
                }
                if let Some(high_water) = self.high_water_segment
                    && segment.index < high_water
                {
                    return Diff::Reset {
                        index: segment.index,
                        high_water,
                    };
                }
                if let Some(high_water) = self.high_water_discontinuity
                    && part.discontinuity_sequence < high_water
                {
                    return Diff::Reset {
                        index: part.discontinuity_sequence,
                        high_water,
                    };
                }

                let (dir_id, dir) = match placed.clone() {
                    Some(placed) => placed,
                    None => {
                        let dir_id = self.dir_id(part);
                        let dir = batch_dir.join(format!("Part_{dir_id:06}"));
                        let map = part.map.as_ref().filter(|_| !self.maps.contains(&dir_id));
                        if let Some(map) = map {
                            items.push(RecItem {
                                work: WorkItem {
                                    order: (dir_id as usize, 0),
                                    dir: dir.clone(),
                                    name: MAP_NAME.to_owned(),
                                    extension: EXT_MAP,
                                    uri: map.uri.clone(),
                                    byte_range: map.byte_range,
                                    key: map.key.clone(),
                                    media_sequence: segment.index,
                                },
                                mark: Mark::Map { dir_id },
                            });
                        }
                        placed = Some((dir_id, dir.clone()));
                        (dir_id, dir)
                    }
                };

                items.push(RecItem {
                    work: WorkItem {
                        order: (dir_id as usize, items.len() + 1),
                        dir,
                        name: format!("{:010}", segment.index),
                        extension,
                        uri: segment.uri.clone(),
                        byte_range: segment.byte_range,
                        key: segment.key.clone(),
                        media_sequence: segment.index,
                    },
                    mark: Mark::Segment {
                        discontinuity: part.discontinuity_sequence,
                        index: segment.index,
                        duration: segment.duration,
                    },
                });
            }
        }

        Diff::Items(items)
    }

    /// Commit a downloaded item. Segments that left the live window between
    /// the previous high-water mark and this one are counted as lost here,
    /// once, regardless of how many rounds listed the gap.
    fn mark(&mut self, mark: &Mark) {
        match *mark {
            Mark::Segment {
                discontinuity,
                index,
                duration,
            } => {
                if let Some(high_water) = self.high_water_segment
                    && index > high_water + 1
                {
                    let gap = index - high_water - 1;
                    warn!(lost = gap, high_water, index, "Segments expired before download");
                    self.lost += gap;
                }
                self.finished.insert(index);
                self.high_water_segment = Some(self.high_water_segment.map_or(index, |hw| hw.max(index)));
                self.high_water_discontinuity = Some(
                    self.high_water_discontinuity
                        .map_or(discontinuity, |hw| hw.max(discontinuity)),
                );
                self.recorded += Duration::from_secs_f64(f64::from(duration.max(0.0)));
            }
            Mark::Map { dir_id } => {
                self.maps.insert(dir_id);
            }
        }
    }
}

pub struct LiveRecorder {
    transport: Arc<dyn Transport>,
    source: Arc<dyn ManifestSource>,
    engine: EngineConfig,
    config: RecConfig,
    post: Vec<StageFactory>,
    progress: Option<ProgressCallback<RecProgress>>,
    state: Arc<Mutex<RecState>>,
}

impl LiveRecorder {
    pub fn new(
        transport: Arc<dyn Transport>,
        source: Arc<dyn ManifestSource>,
        engine: EngineConfig,
        config: RecConfig,
    ) -> Self {
        let mut post = Vec::new();
        if engine.strip_foreign_header {
            post.push(ForeignHeaderStripper::factory());
        }
        Self {
            transport,
            source,
            engine,
            config,
            post,
            progress: None,
            state: Arc::default(),
        }
    }

    pub fn with_stage(mut self, factory: StageFactory) -> Self {
        self.post.push(factory);
        self
    }

    /// Use `key` for `uri` instead of fetching it.
    pub fn with_key(self, uri: impl Into<String>, key: Bytes) -> Self {
        {
            let mut state = self.state.lock();
            let mut keys = (*state.keys).clone();
            keys.insert(uri, key);
            state.keys = Arc::new(keys);
        }
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback<RecProgress>) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn batch_dir(&self) -> PathBuf {
        self.engine.batch_dir()
    }

    /// Indices finished so far in this session.
    pub fn finished_indices(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.state.lock().finished.iter().copied().collect();
        indices.sort_unstable();
        indices
    }

    pub fn lost(&self) -> u64 {
        self.state.lock().lost
    }

    /// Record until the stream ends or stops.
    ///
    /// Only configuration errors are returned as `Err`; every other way the
    /// session terminates is reported through [`RecOutcome`] so the caller can
    /// still merge what was captured.
    pub async fn record(&self, token: &CancellationToken) -> Result<RecOutcome> {
        self.engine.validate()?;
        let batch_dir = self.batch_dir();
        tokio::fs::create_dir_all(&batch_dir).await?;

        let counters = Arc::new(BatchCounters::new(0, 0));
        let reporter = self.start_reporter(&counters);
        let supervisor = RetryTask::new(self.config.outer_delay, self.config.outer_retries);

        info!(batch_dir = %batch_dir.display(), "Starting live recording");
        let result = supervisor
            .run(
                |ctx| {
                    let batch_dir = &batch_dir;
                    let counters = &counters;
                    async move {
                        self.state.lock().restarts = ctx.attempt;
                        if let Some(err) = &ctx.last_error {
                            info!(attempt = ctx.attempt, error = %err, "Resuming live recording");
                        }
                        self.run_rounds(batch_dir, counters, token).await
                    }
                },
                token,
            )
            .await;
        reporter.stop().await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(DownloadError::Cancelled) => RecOutcome::Stopped(StopReason::Cancelled),
            Err(err @ DownloadError::Configuration { .. }) => return Err(err),
            Err(err) => {
                warn!(error = %err, "Live recording gave up, keeping captured segments");
                RecOutcome::Stopped(StopReason::RetryExhausted(err))
            }
        };
        match &outcome {
            RecOutcome::Ended => info!("Live stream ended"),
            RecOutcome::Stopped(reason) => info!(%reason, "Live recording stopped"),
        }
        Ok(outcome)
    }

    fn start_reporter(&self, counters: &Arc<BatchCounters>) -> ProgressReporter {
        let counters = Arc::clone(counters);
        let state = Arc::clone(&self.state);
        let callback = self.progress.clone();
        let interval = self.engine.report_interval;
        let max_retry = self.config.outer_retries;

        ProgressReporter::start(interval, move || {
            let speed = counters.take_interval() as f64 / interval.as_secs_f64();
            let (recorded, lost, restarts) = {
                let state = state.lock();
                (state.recorded, state.lost, state.restarts)
            };
            if let Some(callback) = &callback {
                callback(RecProgress {
                    recorded_secs: recorded.as_secs_f64(),
                    finished: counters.finished(),
                    downloaded_bytes: counters.downloaded_bytes(),
                    speed_bytes_per_sec: speed as u64,
                    retry_count: restarts,
                    max_retry,
                    lost,
                });
            }
        })
    }

    async fn run_rounds(
        &self,
        batch_dir: &Path,
        counters: &Arc<BatchCounters>,
        token: &CancellationToken,
    ) -> Result<RecOutcome> {
        let limiter = SpeedLimiter::new(self.engine.max_speed, self.engine.report_interval, 1);
        let pool = ParallelTask::new(1, Duration::ZERO, 0);

        loop {
            let round_started = Instant::now();

            // Fetch
            let manifest = self.source.fetch(token).await?;
            let target = if manifest.target_duration.is_zero() {
                self.config.default_target_duration
            } else {
                manifest.target_duration
            };
            self.refresh_keys(&manifest, token).await?;

            // Diff
            let diff = self.state.lock().diff(&manifest, batch_dir);
            let items = match diff {
                Diff::Items(items) => items,
                Diff::Reset { index, high_water } => {
                    warn!(index, high_water, "Playlist reset detected");
                    return Ok(RecOutcome::Stopped(StopReason::ResetDetected {
                        index,
                        high_water,
                    }));
                }
            };
            let new_segments = items
                .iter()
                .filter(|item| matches!(item.mark, Mark::Segment { .. }))
                .count();

            // Download
            if !items.is_empty() {
                debug!(items = items.len(), "Downloading new live segments");
                counters.add_total(items.len() as u64);
                self.download(items, &pool, limiter, counters, token).await?;
            }

            if manifest.end_list {
                return Ok(RecOutcome::Ended);
            }
            if let Some(max) = self.config.max_duration {
                let recorded = self.state.lock().recorded;
                if recorded >= max {
                    return Ok(RecOutcome::Stopped(StopReason::DurationReached(recorded)));
                }
            }

            // Wait
            let pause = if new_segments > 0 {
                self.state.lock().no_segment_elapsed = Duration::ZERO;
                target.saturating_sub(round_started.elapsed())
            } else {
                let half = target / 2;
                let idle = {
                    let mut state = self.state.lock();
                    state.no_segment_elapsed += round_started.elapsed() + half;
                    state.no_segment_elapsed
                };
                if idle > self.config.no_segment_timeout {
                    return Ok(RecOutcome::Stopped(StopReason::NoSegmentTimeout(idle)));
                }
                half
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn refresh_keys(&self, manifest: &Manifest, token: &CancellationToken) -> Result<()> {
        let current = Arc::clone(&self.state.lock().keys);
        let missing: Vec<&str> = manifest
            .key_uris()
            .filter(|uri| !current.contains(uri))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut keys = (*current).clone();
        keys.populate(missing, self.transport.as_ref(), token).await?;
        self.state.lock().keys = Arc::new(keys);
        Ok(())
    }

    async fn download(
        &self,
        items: Vec<RecItem>,
        pool: &ParallelTask,
        limiter: SpeedLimiter,
        counters: &Arc<BatchCounters>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut dirs: Vec<&Path> = items.iter().map(|item| item.work.dir.as_path()).collect();
        dirs.dedup();
        for dir in dirs {
            tokio::fs::create_dir_all(dir).await?;
        }

        let ctx = Arc::new(SegmentContext {
            transport: Arc::clone(&self.transport),
            keys: Arc::clone(&self.state.lock().keys),
            counters: Arc::clone(counters),
            limiter,
            post: self.post.clone(),
        });
        let state = Arc::clone(&self.state);

        pool.run(
            items,
            move |item: RecItem, token| {
                let ctx = Arc::clone(&ctx);
                let state = Arc::clone(&state);
                async move {
                    download_item(ctx, item.work, token).await?;
                    state.lock().mark(&item.mark);
                    Ok(())
                }
            },
            counters.retry_counter(),
            token,
        )
        .await
    }
}
