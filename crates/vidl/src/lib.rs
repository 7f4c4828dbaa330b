// Segmented HLS and progressive video download engine
pub mod config;
pub mod download;
pub mod error;
pub mod hls;
pub mod keys;
pub mod limiter;
pub mod merge;
pub mod model;
pub mod parallel;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod progressive;
pub mod rec;
pub mod retry;
pub mod state;
pub mod transport;

// Export common types for ease of use
pub use config::{EngineConfig, HttpConfig, MergeConfig, OutputFormat, RecConfig};
pub use download::BatchDownloader;
pub use error::{DownloadError, RecOutcome, Result, StopReason};
pub use hls::HlsManifestSource;
pub use merge::{Ffmpeg, binary_merge, clear_temp, finalize, merge_parts};
pub use model::{ByteRange, KeyMethod, Manifest, Part, Segment, SegmentKey, SegmentMap};
pub use parallel::ParallelTask;
pub use pipeline::{SegmentPipeline, SegmentStage, StageFactory};
pub use progress::ProgressCallback;
pub use progressive::ProgressiveDownloader;
pub use rec::{LiveRecorder, ManifestSource};
pub use retry::RetryTask;
pub use state::{ProgressSnapshot, RecProgress};
pub use transport::{HttpTransport, Transport, install_rustls_provider};
