mod cli;
mod error;
mod keys;
mod progress;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;
use vidl_engine::merge::concat_files;
use vidl_engine::planner::sanitize_filename;
use vidl_engine::{
    BatchDownloader, DownloadError, EngineConfig, Ffmpeg, HlsManifestSource, HttpConfig,
    HttpTransport, LiveRecorder, Manifest, ManifestSource, MergeConfig, ProgressiveDownloader,
    RecConfig, RecOutcome, Transport, clear_temp, finalize, install_rustls_provider, merge_parts,
};

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::keys::{CUSTOM_KEY_URI, KeyOverride, OverrideSource};
use crate::progress::ProgressView;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Playlist names that make poor output names.
const GENERIC_NAMES: &[&str] = &["index", "playlist", "master", "chunklist", "prog_index"];

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let json_output = args.json;

    if let Err(e) = run(args).await {
        let cancelled = matches!(e, AppError::Download(DownloadError::Cancelled));
        if json_output {
            let status = if cancelled { "cancelled" } else { "error" };
            println!(
                "{}",
                serde_json::json!({ "status": status, "message": e.to_string() })
            );
        } else if cancelled {
            eprintln!("Interrupted. Run the same command again to resume.");
        } else {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
        }
        process::exit(if cancelled { 130 } else { 1 });
    }
}

async fn run(args: Args) -> Result<()> {
    let _log_guard = init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;
    install_rustls_provider();

    let save_name = args
        .save_name
        .clone()
        .unwrap_or_else(|| default_save_name(&args.url));
    let save_dir = args.save_dir.clone().unwrap_or_else(|| args.work_dir.clone());

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&http_config(&args)?)?);
    let engine = EngineConfig {
        work_dir: args.work_dir.clone(),
        save_name: save_name.clone(),
        concurrency: args.threads,
        max_retries: args.max_retries,
        max_speed: args.max_speed,
        strip_foreign_header: args.strip_header,
        ..Default::default()
    };
    engine.validate()?;
    let merge = MergeConfig {
        ffmpeg_path: args.ffmpeg.clone(),
        clear_temp: !args.keep_temp,
        use_ffmpeg: !args.binary_merge,
        output_format: args.format,
        keep_fragmented: args.keep_fragmented,
        discard_corrupt: args.discard_corrupt,
        gen_pts: args.genpts,
        ign_dts: args.igndts,
        ign_idx: args.ignidx,
        ..Default::default()
    };
    let batch_dir = engine.batch_dir();
    let token = cancel_on_ctrl_c();

    let output = if args.hls || is_hls_url(&args.url) {
        download_hls(&args, transport, engine, &merge, &token).await?
    } else {
        let (view, callback) = ProgressView::batch(args.json);
        let result = ProgressiveDownloader::new(transport, engine)
            .with_progress(callback)
            .download(&args.url, &token)
            .await;
        view.finish("download finished");
        Some(result?)
    };

    let Some(output) = output else {
        warn!("Nothing was downloaded");
        return Ok(());
    };
    let path = finalize(&output, &save_dir, &sanitize_filename(&save_name)).await?;
    if merge.clear_temp {
        clear_temp(&batch_dir).await?;
    }

    if args.json {
        println!(
            "{}",
            serde_json::json!({ "status": "done", "path": path.display().to_string() })
        );
    } else {
        info!(path = %path.display(), "Saved");
    }
    Ok(())
}

async fn download_hls(
    args: &Args,
    transport: Arc<dyn Transport>,
    engine: EngineConfig,
    merge: &MergeConfig,
    token: &CancellationToken,
) -> Result<Option<PathBuf>> {
    let overrides = KeyOverride {
        method: args.key_method,
        key: args.key,
        iv: args.iv,
    };
    let hls = Arc::new(HlsManifestSource::new(Arc::clone(&transport), &args.url));
    let inner: Arc<dyn ManifestSource> = hls.clone();
    let source = OverrideSource::wrap(inner, overrides.clone());
    let save_name = sanitize_filename(&engine.save_name);
    let manifest = source.fetch(token).await?;

    if manifest.end_list && !args.live {
        let video_dir = download_vod(args, &transport, engine.clone(), &manifest, token).await?;
        let video = merge_batch(&video_dir, &save_name, merge).await?;

        let Some(audio_source) = hls.audio_source() else {
            return Ok(Some(video));
        };
        if !merge.use_ffmpeg {
            warn!("Binary merge cannot mux the separate audio rendition, keeping video only");
            return Ok(Some(video));
        }
        let audio_manifest = OverrideSource::wrap(Arc::new(audio_source), overrides)
            .fetch(token)
            .await?;
        let audio_engine = EngineConfig {
            save_name: format!("{}_audio", engine.save_name),
            ..engine
        };
        let audio_dir = download_vod(args, &transport, audio_engine, &audio_manifest, token).await?;
        let audio = merge_batch(&audio_dir, &format!("{save_name}_audio"), merge).await?;

        let ffmpeg = Ffmpeg::from_config(merge);
        let output = video_dir.join(format!("muxed.{}", ffmpeg.extension()));
        ffmpeg
            .mux(&video, &audio, &output, &|line| debug!(line, "ffmpeg warning"))
            .await?;
        if merge.clear_temp {
            clear_temp(&audio_dir).await?;
        }
        return Ok(Some(output));
    }

    if hls.audio_url().is_some() {
        warn!("Live recording keeps the variant only, the separate audio rendition is skipped");
    }
    info!("Recording live playlist");
    let rec = RecConfig {
        no_segment_timeout: Duration::from_secs(args.no_segment_timeout),
        max_duration: args.max_duration.map(Duration::from_secs),
        ..Default::default()
    };
    let (view, callback) = ProgressView::live(args.json);
    let mut recorder = LiveRecorder::new(transport, source, engine, rec).with_progress(callback);
    if let Some(key) = args.key {
        recorder = recorder.with_key(CUSTOM_KEY_URI, Bytes::copy_from_slice(&key));
    }
    let outcome = recorder.record(token).await;
    view.finish("recording stopped");

    match outcome? {
        RecOutcome::Ended => info!("Stream ended"),
        RecOutcome::Stopped(reason) => info!(%reason, "Recording stopped"),
    }
    if recorder.finished_indices().is_empty() {
        return Ok(None);
    }
    if recorder.lost() > 0 {
        warn!(lost = recorder.lost(), "Some segments expired before they could be fetched");
    }
    merge_batch(&recorder.batch_dir(), &save_name, merge)
        .await
        .map(Some)
}

/// Download one complete playlist into its batch directory.
async fn download_vod(
    args: &Args,
    transport: &Arc<dyn Transport>,
    engine: EngineConfig,
    manifest: &Manifest,
    token: &CancellationToken,
) -> Result<PathBuf> {
    info!(
        batch = %engine.save_name,
        parts = manifest.parts.len(),
        segments = manifest.segment_count(),
        "Downloading playlist"
    );
    let (view, callback) = ProgressView::batch(args.json);
    let mut downloader =
        BatchDownloader::new(Arc::clone(transport), engine).with_progress(callback);
    if let Some(key) = args.key {
        downloader = downloader.with_key(CUSTOM_KEY_URI, Bytes::copy_from_slice(&key));
    }
    let result = downloader.download(&manifest.parts, token).await;
    view.finish("download finished");
    Ok(result?.batch_dir)
}

/// Join the batch with ffmpeg, falling back to plain concatenation.
async fn merge_batch(batch_dir: &Path, name: &str, merge: &MergeConfig) -> Result<PathBuf> {
    let parts = merge_parts(batch_dir).await?;

    if merge.use_ffmpeg {
        let ffmpeg = Ffmpeg::from_config(merge);
        let output = batch_dir.join(format!("{name}.{}", ffmpeg.extension()));
        match ffmpeg
            .concat(&parts, &output, &|line| debug!(line, "ffmpeg warning"))
            .await
        {
            Ok(()) => return Ok(output),
            Err(e) => warn!(error = %e, "ffmpeg merge failed, joining segments directly"),
        }
    }

    let ext = parts
        .first()
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("ts");
    let output = batch_dir.join(format!("{name}.{ext}"));
    concat_files(&parts, &output).await?;
    Ok(output)
}

fn http_config(args: &Args) -> Result<HttpConfig> {
    let mut config = HttpConfig {
        timeout: Duration::from_secs(args.timeout),
        proxy: args.proxy.clone(),
        ..Default::default()
    };
    if let Some(headers) = &args.headers {
        config = config.with_headers(HttpConfig::parse_header_string(headers)?);
    }
    Ok(config)
}

fn is_hls_url(input: &str) -> bool {
    Url::parse(input)
        .map(|u| u.path().to_ascii_lowercase().ends_with(".m3u8"))
        .unwrap_or_else(|_| input.to_ascii_lowercase().contains(".m3u8"))
}

fn default_save_name(input: &str) -> String {
    let stem = Url::parse(input).ok().and_then(|u| {
        let name = u.path().rsplit('/').next().unwrap_or_default().to_owned();
        let stem = name.rsplit_once('.').map_or(name.as_str(), |(s, _)| s).to_owned();
        (!stem.is_empty()).then_some(stem)
    });
    match stem {
        Some(stem) if !GENERIC_NAMES.contains(&stem.to_ascii_lowercase().as_str()) => stem,
        _ => format!("vidl_{}", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            child.cancel();
        }
    });
    token
}

fn init_logging(verbose: bool, quiet: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| AppError::InvalidInput(format!("invalid log file {}", path.display())))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;
    Ok(guard)
}
