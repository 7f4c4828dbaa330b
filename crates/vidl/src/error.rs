use reqwest::StatusCode;
use std::time::Duration;

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("content length mismatch for {url}: expected {expected} bytes, received {received}")]
    ContentLengthMismatch {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("crypto error: {reason}")]
    Crypto { reason: String },

    #[error("format error: {reason}")]
    Format { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("retry budget exhausted after {attempts} failed attempts: {source}")]
    OverRetry {
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("download incomplete: {finished}/{total} items on disk")]
    Incomplete { finished: usize, total: usize },

    #[error("mux error: {reason}")]
    Mux { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn crypto(reason: impl Into<String>) -> Self {
        Self::Crypto {
            reason: reason.into(),
        }
    }

    pub fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn mux(reason: impl Into<String>) -> Self {
        Self::Mux {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn over_retry(attempts: u32, last: DownloadError) -> Self {
        Self::OverRetry {
            attempts,
            source: Box::new(last),
        }
    }

    /// Whether a failed attempt may succeed if repeated.
    ///
    /// Crypto failures count as transient since an outer restart re-fetches keys.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::Configuration { .. }
            | Self::InvalidUrl { .. }
            | Self::Format { .. } => false,
            // A batch that ran out of per-item retries may still succeed on restart.
            Self::OverRetry { source, .. } => source.is_retryable(),
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::ContentLengthMismatch { .. }
            | Self::Io { .. }
            | Self::Crypto { .. }
            | Self::Playlist { .. }
            | Self::Incomplete { .. }
            | Self::Mux { .. }
            | Self::Internal { .. } => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Why a live session stopped before the manifest declared its end.
#[derive(Debug)]
pub enum StopReason {
    /// The remote playlist restarted its numbering.
    ResetDetected { index: u64, high_water: u64 },
    /// No new segment appeared within the configured ceiling.
    NoSegmentTimeout(Duration),
    /// Recorded duration reached the configured maximum.
    DurationReached(Duration),
    /// The outer retry budget was spent; the last error is kept for reporting.
    RetryExhausted(DownloadError),
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResetDetected { index, high_water } => {
                write!(f, "playlist reset (segment {index} below high-water {high_water})")
            }
            Self::NoSegmentTimeout(elapsed) => {
                write!(f, "no new segment for {:.1}s", elapsed.as_secs_f64())
            }
            Self::DurationReached(duration) => {
                write!(f, "recorded {:.1}s", duration.as_secs_f64())
            }
            Self::RetryExhausted(err) => write!(f, "retries exhausted: {err}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal state of a live recording.
#[derive(Debug)]
pub enum RecOutcome {
    /// The playlist carried an end-of-list marker and everything was fetched.
    Ended,
    Stopped(StopReason),
}

impl RecOutcome {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_and_format_are_fatal() {
        assert!(!DownloadError::configuration("empty").is_retryable());
        assert!(!DownloadError::format("no sync").is_retryable());
        assert!(!DownloadError::Cancelled.is_retryable());
    }

    #[test]
    fn transport_failures_are_transient() {
        let err = DownloadError::ContentLengthMismatch {
            url: "http://a/b.ts".into(),
            expected: 10,
            received: 4,
        };
        assert!(err.is_retryable());
        assert!(DownloadError::crypto("missing key").is_retryable());
        assert!(
            DownloadError::http_status(StatusCode::BAD_GATEWAY, "http://a", "segment").is_retryable()
        );
    }

    #[test]
    fn over_retry_keeps_last_failure() {
        let err = DownloadError::over_retry(4, DownloadError::crypto("bad key"));
        assert!(err.is_retryable());
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("crypto error: bad key"));
    }
}
