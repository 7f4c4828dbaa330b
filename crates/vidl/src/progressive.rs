//! Progressive (single file) download split into ranged chunks.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::download::BatchDownloader;
use crate::error::{DownloadError, Result};
use crate::merge::concat_files;
use crate::model::{ByteRange, Part, Segment};
use crate::planner::sanitize_filename;
use crate::progress::ProgressCallback;
use crate::state::ProgressSnapshot;
use crate::transport::{FetchRequest, Transport};

pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
const KNOWN_EXTENSIONS: &[&str] = &["mp4", "m4a", "m4v", "mkv", "webm", "flv", "ts", "mp3", "mov"];

pub struct ProgressiveDownloader {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    chunk_size: u64,
    progress: Option<ProgressCallback<ProgressSnapshot>>,
}

impl ProgressiveDownloader {
    pub fn new(transport: Arc<dyn Transport>, mut config: EngineConfig) -> Self {
        // Chunks are slices of one file; a header check would break them.
        config.strip_foreign_header = false;
        Self {
            transport,
            config,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback<ProgressSnapshot>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Total size of the resource, if the server honours range requests.
    pub async fn probe(&self, url: &str, token: &CancellationToken) -> Result<Option<u64>> {
        let request = FetchRequest::get(url).with_range(Some(ByteRange::new(0, 1)));
        match self.transport.fetch(request, token).await {
            Ok(response) => {
                debug!(total = ?response.total_length, "Probed resource length");
                Ok(response.total_length)
            }
            Err(DownloadError::Cancelled) => Err(DownloadError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Range probe failed, downloading as a single file");
                Ok(None)
            }
        }
    }

    /// Download `url` into the batch directory and join the chunks.
    ///
    /// Returns the path of the joined file, still inside the batch directory.
    pub async fn download(&self, url: &str, token: &CancellationToken) -> Result<PathBuf> {
        let total = self.probe(url, token).await?;
        let part = chunk_part(url, total, self.chunk_size);
        info!(
            url,
            total = ?total,
            chunks = part.segments.len(),
            "Starting progressive download"
        );

        let mut downloader = BatchDownloader::new(Arc::clone(&self.transport), self.config.clone());
        if let Some(progress) = &self.progress {
            downloader = downloader.with_progress(Arc::clone(progress));
        }
        let plan = downloader.download(&[part], token).await?;

        let output = plan.batch_dir.join(format!(
            "{}.{}",
            sanitize_filename(&self.config.save_name),
            guess_extension(url)
        ));
        let chunks: Vec<PathBuf> = plan.items.iter().map(|item| item.final_path()).collect();
        let bytes = concat_files(&chunks, &output).await?;

        if let Some(total) = total
            && bytes != total
        {
            return Err(DownloadError::ContentLengthMismatch {
                url: url.to_owned(),
                expected: total,
                received: bytes,
            });
        }
        info!(output = %output.display(), bytes, "Progressive download complete");
        Ok(output)
    }
}

/// One Part whose segments are consecutive byte ranges of `url`, or a single
/// unranged segment when the length is unknown.
pub fn chunk_part(url: &str, total: Option<u64>, chunk_size: u64) -> Part {
    let segments = match total {
        Some(total) if total > 0 => (0..total.div_ceil(chunk_size))
            .map(|index| {
                let offset = index * chunk_size;
                let mut segment = Segment::new(index, url);
                segment.byte_range = Some(ByteRange::new(offset, chunk_size.min(total - offset)));
                segment
            })
            .collect(),
        _ => vec![Segment::new(0, url)],
    };
    Part::new(0, segments)
}

fn guess_extension(url: &str) -> &'static str {
    let ext = Url::parse(url)
        .ok()
        .and_then(|u| {
            let path = u.path();
            let name = path.rsplit('/').next().unwrap_or(path);
            name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
        });
    ext.and_then(|ext| KNOWN_EXTENSIONS.iter().copied().find(|known| *known == ext))
        .unwrap_or("mp4")
}
