//! Segment worker and VOD batch orchestration.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::keys::KeyCache;
use crate::limiter::SpeedLimiter;
use crate::model::{KeyMethod, Part};
use crate::parallel::ParallelTask;
use crate::pipeline::{ForeignHeaderStripper, SegmentPipeline, StageFactory};
use crate::planner::{Plan, WorkItem, WorkPlanner, completed_size};
use crate::progress::{ProgressCallback, ProgressReporter};
use crate::retry::RetryTask;
use crate::state::{BatchCounters, ProgressSnapshot};
use crate::transport::{FetchRequest, Transport};

/// Everything a worker needs to fetch one item.
pub struct SegmentContext {
    pub transport: Arc<dyn Transport>,
    pub keys: Arc<KeyCache>,
    pub counters: Arc<BatchCounters>,
    pub limiter: SpeedLimiter,
    pub post: Vec<StageFactory>,
}

/// Fetch one work item into its temp file and rename it into place.
///
/// The final name only appears after the body was fully received, matched the
/// announced length and went through every pipeline stage. On cancellation or
/// failure the temp file is left behind and overwritten by the next attempt.
#[instrument(skip(ctx, item, token), fields(file = %item.final_path().display()))]
pub async fn download_item(
    ctx: Arc<SegmentContext>,
    item: WorkItem,
    token: CancellationToken,
) -> Result<()> {
    let final_path = item.final_path();
    if let Some(size) = completed_size(&final_path).await? {
        ctx.counters.finish_item(size);
        return Ok(());
    }

    // Maps are decrypted with their own key but skip the post stages.
    let post: &[StageFactory] = if item.is_map() { &[] } else { &ctx.post };
    let mut pipeline = SegmentPipeline::for_segment(&item.key, item.media_sequence, &ctx.keys, post)?;

    let request = FetchRequest::get(&item.uri).with_range(item.byte_range);
    let response = ctx.transport.fetch(request, &token).await?;
    let expected = response.content_length;
    let mut body = response.body;

    let temp_path = item.temp_path();
    let mut file = BufWriter::new(tokio::fs::File::create(&temp_path).await?);
    let mut received: u64 = 0;
    let mut written: u64 = 0;
    let mut ready: Vec<Bytes> = Vec::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let mut chunk = chunk?;

        while !chunk.is_empty() {
            ctx.limiter.wait(&ctx.counters, &token).await?;
            let block = chunk.split_to(chunk.len().min(ctx.limiter.slice()));
            received += block.len() as u64;
            ctx.counters.record_interval(block.len() as u64);

            pipeline.process(block, &mut |data| {
                ready.push(data);
                Ok(())
            })?;
            for data in ready.drain(..) {
                written += data.len() as u64;
                file.write_all(&data).await?;
            }
        }
    }

    if let Some(expected) = expected
        && expected != received
    {
        return Err(DownloadError::ContentLengthMismatch {
            url: item.uri.clone(),
            expected,
            received,
        });
    }

    pipeline.finish(&mut |data| {
        ready.push(data);
        Ok(())
    })?;
    for data in ready.drain(..) {
        written += data.len() as u64;
        file.write_all(&data).await?;
    }
    file.flush().await?;
    file.into_inner().sync_all().await?;

    tokio::fs::rename(&temp_path, &final_path).await?;
    ctx.counters.finish_item(written);
    debug!(received, written, "Segment finished");
    Ok(())
}

/// Downloads a complete (VOD) manifest into the batch directory.
pub struct BatchDownloader {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    post: Vec<StageFactory>,
    preset_keys: KeyCache,
    progress: Option<ProgressCallback<ProgressSnapshot>>,
}

impl BatchDownloader {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let mut post = Vec::new();
        if config.strip_foreign_header {
            post.push(ForeignHeaderStripper::factory());
        }
        Self {
            transport,
            config,
            post,
            preset_keys: KeyCache::new(),
            progress: None,
        }
    }

    /// Use `key` for `uri` instead of fetching it.
    pub fn with_key(mut self, uri: impl Into<String>, key: Bytes) -> Self {
        self.preset_keys.insert(uri, key);
        self
    }

    /// Append a post-processing stage applied to every media segment.
    pub fn with_stage(mut self, factory: StageFactory) -> Self {
        self.post.push(factory);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback<ProgressSnapshot>) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan, download and verify every segment of `parts`.
    ///
    /// Segments already on disk are skipped, so calling this again after a
    /// failure or crash resumes the batch.
    pub async fn download(&self, parts: &[Part], token: &CancellationToken) -> Result<Plan> {
        let planner = WorkPlanner::new(&self.config)?;
        let plan = planner.plan(parts).await?;
        let counters = Arc::new(BatchCounters::new(
            plan.len() as u64,
            self.config.max_retries,
        ));

        info!(
            batch_dir = %plan.batch_dir.display(),
            items = plan.len(),
            concurrency = self.config.concurrency,
            "Starting batch download"
        );

        let reporter = ProgressReporter::for_batch(
            Arc::clone(&counters),
            self.config.report_interval,
            self.progress.clone(),
        );
        let result = self.run_plan(&plan, &counters, token).await;
        reporter.stop().await;
        result?;

        plan.check_complete().await?;
        info!(items = plan.len(), "Batch download complete");
        Ok(plan)
    }

    async fn run_plan(
        &self,
        plan: &Plan,
        counters: &Arc<BatchCounters>,
        token: &CancellationToken,
    ) -> Result<()> {
        let supervisor = RetryTask::new(self.config.outer_delay, self.config.outer_retries);
        let pool = ParallelTask::new(
            self.config.concurrency,
            self.config.delay,
            self.config.max_retries,
        );
        let limiter = SpeedLimiter::new(
            self.config.max_speed,
            self.config.report_interval,
            self.config.concurrency,
        );

        supervisor
            .run(
                |ctx| {
                    let pool = &pool;
                    async move {
                        if let Some(err) = &ctx.last_error {
                            debug!(attempt = ctx.attempt, error = %err, "Rescanning batch");
                        }
                        counters.reset_retries();
                        // Files found on disk were counted on the first scan.
                        let record = (ctx.attempt == 0).then_some(&**counters);
                        let pending = plan.pending(record).await?;
                        if pending.is_empty() {
                            return Ok(());
                        }

                        let mut keys = self.preset_keys.clone();
                        let uris = pending
                            .iter()
                            .filter(|item| item.key.method == KeyMethod::Aes128)
                            .filter_map(|item| item.key.uri.as_deref());
                        keys.populate(uris, self.transport.as_ref(), token).await?;

                        let segment_ctx = Arc::new(SegmentContext {
                            transport: Arc::clone(&self.transport),
                            keys: Arc::new(keys),
                            counters: Arc::clone(counters),
                            limiter,
                            post: self.post.clone(),
                        });
                        pool.run(
                            pending,
                            move |item, token| download_item(Arc::clone(&segment_ctx), item, token),
                            counters.retry_counter(),
                            token,
                        )
                        .await
                    }
                },
                token,
            )
            .await
    }
}
