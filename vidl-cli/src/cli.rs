use std::path::PathBuf;

use clap::Parser;
use vidl_engine::{KeyMethod, OutputFormat};

use crate::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "vidl",
    author,
    version,
    about = "Download HLS playlists and progressive video files",
    long_about = None
)]
pub struct Args {
    /// Playlist or media URL
    pub url: String,

    /// Directory for temporary segment files
    #[arg(short = 'w', long, default_value = ".")]
    pub work_dir: PathBuf,

    /// Directory for the final file (defaults to the work directory)
    #[arg(short = 'o', long)]
    pub save_dir: Option<PathBuf>,

    /// Output name without extension
    #[arg(short = 'n', long)]
    pub save_name: Option<String>,

    /// Number of segments downloaded in parallel
    #[arg(short = 't', long, default_value_t = 4)]
    pub threads: usize,

    /// Shared retry budget for one batch
    #[arg(long, default_value_t = 20)]
    pub max_retries: u32,

    /// Speed limit, e.g. `800K` or `2M` (bytes per second)
    #[arg(long, value_parser = parse_speed)]
    pub max_speed: Option<u64>,

    /// Extra request headers: `Name:Value|Name2:Value2`
    #[arg(short = 'H', long)]
    pub headers: Option<String>,

    /// HTTP/SOCKS proxy URL
    #[arg(long)]
    pub proxy: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Treat the URL as HLS even without an `.m3u8` path
    #[arg(long)]
    pub hls: bool,

    /// Record as a live stream even when the playlist is complete
    #[arg(long)]
    pub live: bool,

    /// Stop a live recording after this many seconds without new segments
    #[arg(long, default_value_t = 60)]
    pub no_segment_timeout: u64,

    /// Stop a live recording after this many seconds of media
    #[arg(long)]
    pub max_duration: Option<u64>,

    /// Remove a PNG header injected in front of MPEG-TS segments
    #[arg(long)]
    pub strip_header: bool,

    /// Override the encryption method of every segment
    #[arg(long, value_enum)]
    pub key_method: Option<KeyMethod>,

    /// Decryption key as 32 hex digits, used instead of fetching key URIs
    #[arg(long, value_parser = parse_hex_16)]
    pub key: Option<[u8; 16]>,

    /// IV as 32 hex digits, overrides the playlist IV
    #[arg(long, value_parser = parse_hex_16)]
    pub iv: Option<[u8; 16]>,

    /// Path of the ffmpeg executable
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Join segments byte by byte instead of remuxing with ffmpeg
    #[arg(long)]
    pub binary_merge: bool,

    /// Container of the merged file
    #[arg(long, value_enum, default_value = "mp4")]
    pub format: OutputFormat,

    /// Write fragmented mp4 when merging with ffmpeg
    #[arg(long)]
    pub keep_fragmented: bool,

    /// Let ffmpeg drop corrupted packets
    #[arg(long)]
    pub discard_corrupt: bool,

    /// Let ffmpeg generate missing PTS from DTS
    #[arg(long)]
    pub genpts: bool,

    /// Let ffmpeg ignore DTS when PTS is set
    #[arg(long)]
    pub igndts: bool,

    /// Let ffmpeg ignore the input index
    #[arg(long)]
    pub ignidx: bool,

    /// Keep the segment directory after merging
    #[arg(long)]
    pub keep_temp: bool,

    /// Print progress as JSON lines instead of a progress bar
    #[arg(long)]
    pub json: bool,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Parse a byte rate with an optional `K`/`M`/`G` suffix (powers of 1024).
pub fn parse_speed(input: &str) -> Result<u64, AppError> {
    let trimmed = input.trim();
    let (number, multiplier) = match trimmed.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| AppError::InvalidInput(format!("invalid speed: {input}")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::InvalidInput(format!("invalid speed: {input}")));
    }
    Ok((value * multiplier as f64) as u64)
}

pub fn parse_hex_16(input: &str) -> Result<[u8; 16], AppError> {
    let digits = input.trim().trim_start_matches("0x").trim_start_matches("0X");
    let mut out = [0u8; 16];
    hex::decode_to_slice(digits, &mut out)
        .map_err(|e| AppError::InvalidInput(format!("expected 32 hex digits in '{input}': {e}")))?;
    Ok(out)
}
