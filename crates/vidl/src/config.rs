use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{DownloadError, Result};
use crate::limiter::interval_budget;
use crate::planner::sanitize_filename;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Lowest aggregate rate accepted for the speed cap, in bytes per second.
pub const MIN_SPEED_LIMIT: u64 = 1024;

/// HTTP client options shared by every request of a download.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a request, zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy URL (`http://`, `https://` or `socks5://`)
    pub proxy: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            proxy: None,
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }

    /// Parse a `name:value|name:value` header string.
    ///
    /// Only the first `:` splits a pair, so values may contain colons (URLs).
    /// Empty pairs are skipped.
    pub fn parse_header_string(input: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for pair in input.split('|') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once(':').ok_or_else(|| {
                DownloadError::configuration(format!("header `{pair}` is not `name:value`"))
            })?;
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                DownloadError::configuration(format!("invalid header name `{name}`: {e}"))
            })?;
            let value = HeaderValue::from_str(value.trim()).map_err(|e| {
                DownloadError::configuration(format!("invalid header value for `{name}`: {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Merge custom headers over the defaults, custom values winning.
    pub fn with_headers(mut self, custom: HeaderMap) -> Self {
        for (name, value) in custom.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }
}

/// Options for a segmented (VOD) download batch.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory that receives the batch directory and the final file
    pub work_dir: PathBuf,

    /// Batch name, used for the temp directory and the output file
    pub save_name: String,

    /// Maximum number of segments in flight
    pub concurrency: usize,

    /// Pause after each dispatch and before each in-place retry
    pub delay: Duration,

    /// Shared retry budget across every item of one attempt
    pub max_retries: u32,

    /// Number of whole-batch restarts
    pub outer_retries: u32,

    /// Pause between whole-batch restarts
    pub outer_delay: Duration,

    /// Aggregate speed cap in bytes per second
    pub max_speed: Option<u64>,

    /// Progress reporting and speed sampling interval
    pub report_interval: Duration,

    /// Strip a foreign image header prepended to MPEG-TS segments
    pub strip_foreign_header: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            save_name: String::new(),
            concurrency: 1,
            delay: Duration::from_millis(200),
            max_retries: 20,
            outer_retries: 5,
            outer_delay: Duration::from_millis(10 * 1024),
            max_speed: None,
            report_interval: Duration::from_secs(1),
            strip_foreign_header: false,
        }
    }
}

impl EngineConfig {
    /// `{work_dir}/{save_name}` with the name made safe for the filesystem.
    pub fn batch_dir(&self) -> PathBuf {
        self.work_dir.join(sanitize_filename(&self.save_name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(DownloadError::configuration("work directory is empty"));
        }
        if self.save_name.trim().is_empty() {
            return Err(DownloadError::configuration("save name is empty"));
        }
        if self.concurrency == 0 {
            return Err(DownloadError::configuration("concurrency must be at least 1"));
        }
        if self.report_interval.is_zero() {
            return Err(DownloadError::configuration("report interval must be positive"));
        }
        if let Some(speed) = self.max_speed
            && speed < MIN_SPEED_LIMIT
        {
            return Err(DownloadError::configuration(format!(
                "speed limit {speed} B/s is below the minimum of {MIN_SPEED_LIMIT} B/s"
            )));
        }
        if let Some(speed) = self.max_speed
            && interval_budget(speed, self.report_interval) <= self.concurrency as u64
        {
            return Err(DownloadError::configuration(format!(
                "speed limit {speed} B/s leaves no room per {:?} interval for {} workers",
                self.report_interval, self.concurrency
            )));
        }
        Ok(())
    }
}

/// Options for a live recording session.
#[derive(Debug, Clone)]
pub struct RecConfig {
    /// Stop once no new segment has appeared for this long
    pub no_segment_timeout: Duration,

    /// Stop once this much media has been recorded
    pub max_duration: Option<Duration>,

    /// Number of session restarts after a failed round
    pub outer_retries: u32,

    /// Pause between session restarts
    pub outer_delay: Duration,

    /// Fallback polling period when the playlist carries no target duration
    pub default_target_duration: Duration,
}

impl Default for RecConfig {
    fn default() -> Self {
        Self {
            no_segment_timeout: Duration::from_secs(60),
            max_duration: None,
            outer_retries: 20,
            outer_delay: Duration::from_secs(1),
            default_target_duration: Duration::from_secs(6),
        }
    }
}

/// Container written by the ffmpeg merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OutputFormat {
    #[default]
    Mp4,
    Ts,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Ts => "ts",
        }
    }

    /// ffmpeg muxer name.
    pub fn muxer(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Ts => "mpegts",
        }
    }
}

/// Options for the final concat/remux step.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// ffmpeg executable, looked up on `PATH` when not absolute
    pub ffmpeg_path: PathBuf,

    /// Remove the batch directory after a successful merge
    pub clear_temp: bool,

    /// Run the merge through ffmpeg instead of plain concatenation
    pub use_ffmpeg: bool,

    /// Add `-bsf:a aac_adtstoasc` when remuxing MPEG-TS audio into mp4
    pub bitstream_filter: bool,

    /// Container of the merged file
    pub output_format: OutputFormat,

    /// Write fragmented mp4 (`-movflags frag_keyframe+empty_moov`)
    pub keep_fragmented: bool,

    /// Drop corrupted packets (`-fflags +discardcorrupt`)
    pub discard_corrupt: bool,

    /// Generate missing PTS from DTS (`-fflags +genpts`)
    pub gen_pts: bool,

    /// Ignore DTS when PTS is set (`-fflags +igndts`)
    pub ign_dts: bool,

    /// Ignore the input index (`-fflags +ignidx`)
    pub ign_idx: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            clear_temp: true,
            use_ffmpeg: true,
            bitstream_filter: true,
            output_format: OutputFormat::Mp4,
            keep_fragmented: false,
            discard_corrupt: false,
            gen_pts: false,
            ign_dts: false,
            ign_idx: false,
        }
    }
}

impl MergeConfig {
    /// Combined `-fflags` value, `None` when no flag is set.
    pub fn fflags(&self) -> Option<String> {
        let flags: String = [
            (self.discard_corrupt, "+discardcorrupt"),
            (self.gen_pts, "+genpts"),
            (self.ign_dts, "+igndts"),
            (self.ign_idx, "+ignidx"),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, flag)| flag)
        .collect();
        (!flags.is_empty()).then_some(flags)
    }
}
