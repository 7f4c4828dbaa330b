//! Reassembly of a finished batch: binary concatenation, ffmpeg remux and
//! moving the result to its destination.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{MergeConfig, OutputFormat};
use crate::error::{DownloadError, Result};
use crate::planner::{MAP_NAME, TEMP_SUFFIX};

const PART_PREFIX: &str = "Part_";
const CONCAT_LIST: &str = "concat.txt";
const DEFAULT_EXTENSION: &str = "mp4";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// `Part_*` directories of a batch in playback order.
pub async fn part_dirs(batch_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(batch_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_part = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(PART_PREFIX));
        if is_part && entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    // Part names are zero-padded to a common width.
    dirs.sort();
    Ok(dirs)
}

/// Finished files of one Part directory sorted by name, which puts the
/// initialization map first.
async fn part_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let finished = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.ends_with(TEMP_SUFFIX));
        if finished && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Extension of the media files in a Part, ignoring the map.
fn media_extension(files: &[PathBuf]) -> Option<String> {
    files
        .iter()
        .filter(|f| f.file_stem().and_then(|s| s.to_str()) != Some(MAP_NAME))
        .find_map(|f| f.extension().and_then(|e| e.to_str()).map(str::to_owned))
}

/// Append `inputs` to a fresh file at `output`. Returns the bytes written.
pub async fn concat_files(inputs: &[PathBuf], output: &Path) -> Result<u64> {
    let mut writer = BufWriter::new(tokio::fs::File::create(output).await?);
    let mut written = 0;
    for input in inputs {
        let mut reader = tokio::fs::File::open(input).await?;
        written += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(written)
}

/// Concatenate each Part directory into `{batch_dir}/Part_{n}.{ext}`.
///
/// Returns the merged Part files in playback order.
pub async fn merge_parts(batch_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut merged = Vec::new();
    for dir in part_dirs(batch_dir).await? {
        let files = part_files(&dir).await?;
        if files.is_empty() {
            continue;
        }
        let ext = media_extension(&files).unwrap_or_else(|| DEFAULT_EXTENSION.to_owned());
        let Some(dir_name) = dir.file_name() else {
            continue;
        };
        let mut name = dir_name.to_os_string();
        name.push(format!(".{ext}"));
        let output = batch_dir.join(name);

        let bytes = concat_files(&files, &output).await?;
        debug!(part = %output.display(), files = files.len(), bytes, "Merged part");
        merged.push(output);
    }
    if merged.is_empty() {
        return Err(DownloadError::mux(format!(
            "no finished segments under {}",
            batch_dir.display()
        )));
    }
    Ok(merged)
}

/// Binary merge of a whole batch into `output`.
pub async fn binary_merge(batch_dir: &Path, output: &Path) -> Result<u64> {
    let parts = merge_parts(batch_dir).await?;
    let bytes = concat_files(&parts, output).await?;
    info!(output = %output.display(), parts = parts.len(), bytes, "Binary merge complete");
    Ok(bytes)
}

/// Thin wrapper around the ffmpeg executable.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: PathBuf,
    bitstream_filter: bool,
    format: OutputFormat,
    keep_fragmented: bool,
    fflags: Option<String>,
}

impl Ffmpeg {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::from_config(&MergeConfig::default())
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            path: config.ffmpeg_path.clone(),
            bitstream_filter: config.bitstream_filter,
            format: config.output_format,
            keep_fragmented: config.keep_fragmented,
            fflags: config.fflags(),
        }
    }

    /// Extension of the files this instance writes.
    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    fn input_args(&self, args: &mut Vec<OsString>, input: &Path) {
        if let Some(flags) = &self.fflags {
            args.push("-fflags".into());
            args.push(flags.into());
        }
        args.push("-i".into());
        args.push(input.into());
    }

    /// Codec copy, filters and container flags, then the output path.
    /// ADTS audio from MPEG-TS needs `aac_adtstoasc` only when it lands in mp4.
    fn output_args(&self, args: &mut Vec<OsString>, ts_audio: bool, output: &Path) {
        args.extend(["-c", "copy", "-y"].into_iter().map(OsString::from));
        let mp4 = self.format == OutputFormat::Mp4;
        if self.bitstream_filter && ts_audio && mp4 {
            args.extend(["-bsf:a", "aac_adtstoasc"].into_iter().map(OsString::from));
        }
        if self.keep_fragmented && mp4 {
            args.extend(
                ["-movflags", "frag_keyframe+empty_moov"]
                    .into_iter()
                    .map(OsString::from),
            );
        }
        args.extend(["-f", self.format.muxer()].into_iter().map(OsString::from));
        args.push(output.into());
        args.extend(["-loglevel", "warning"].into_iter().map(OsString::from));
    }

    fn concat_args(&self, list: &Path, output: &Path, ts_input: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(flags) = &self.fflags {
            args.push("-fflags".into());
            args.push(flags.into());
        }
        args.extend(["-f", "concat", "-safe", "0", "-i"].into_iter().map(OsString::from));
        args.push(list.into());
        args.extend(
            ["-map", "0:v?", "-map", "0:a?", "-map", "0:s?"]
                .into_iter()
                .map(OsString::from),
        );
        self.output_args(&mut args, ts_input, output);
        args
    }

    fn mux_args(&self, video: &Path, audio: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Vec::new();
        self.input_args(&mut args, video);
        self.input_args(&mut args, audio);
        args.extend(
            ["-map", "0:v?", "-map", "1:a?"]
                .into_iter()
                .map(OsString::from),
        );
        self.output_args(&mut args, is_ts(audio), output);
        args
    }

    /// Concatenate `parts` into `output` without re-encoding.
    ///
    /// The concat list is written next to the first part. Every stderr line is
    /// passed to `on_warning`.
    pub async fn concat(
        &self,
        parts: &[PathBuf],
        output: &Path,
        on_warning: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<()> {
        let Some(list_dir) = parts.first().and_then(|p| p.parent()) else {
            return Err(DownloadError::mux("nothing to concatenate"));
        };
        let list = list_dir.join(CONCAT_LIST);
        tokio::fs::write(&list, concat_list(parts)).await?;

        let ts_input = parts.iter().any(|p| is_ts(p));
        let result = self
            .run(self.concat_args(&list, output, ts_input), on_warning)
            .await;
        if let Err(e) = tokio::fs::remove_file(&list).await {
            debug!(error = %e, "Failed to remove concat list");
        }
        result?;
        info!(output = %output.display(), parts = parts.len(), "ffmpeg concat complete");
        Ok(())
    }

    /// Mux a video track and a separately downloaded audio rendition.
    pub async fn mux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        on_warning: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<()> {
        self.run(self.mux_args(video, audio, output), on_warning)
            .await?;
        info!(output = %output.display(), "ffmpeg mux complete");
        Ok(())
    }

    async fn run(&self, args: Vec<OsString>, on_warning: &(dyn Fn(&str) + Send + Sync)) -> Result<()> {
        let mut command = Command::new(&self.path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        debug!(program = %self.path.display(), ?args, "Spawning ffmpeg");
        let mut child = command.spawn().map_err(|e| {
            DownloadError::mux(format!("failed to spawn {}: {e}", self.path.display()))
        })?;

        let mut last_line = None;
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                warn!("ffmpeg: {}", line);
                on_warning(&line);
                last_line = Some(line);
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(DownloadError::mux(format!(
                "ffmpeg exited with {status}{}",
                last_line.map(|l| format!(": {l}")).unwrap_or_default()
            )))
        }
    }
}

fn is_ts(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("ts"))
}

/// ffmpeg concat demuxer list. Single quotes in paths are escaped.
fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| {
            let path = p.to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Move `output` to `{dest_dir}/{name}.{ext}`.
///
/// An existing file at the target is never overwritten; a timestamp suffix is
/// appended instead. Returns the final path.
pub async fn finalize(output: &Path, dest_dir: &Path, name: &str) -> Result<PathBuf> {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(DEFAULT_EXTENSION);
    tokio::fs::create_dir_all(dest_dir).await?;

    let mut target = dest_dir.join(format!("{name}.{ext}"));
    if tokio::fs::try_exists(&target).await? {
        let suffix = chrono::Local::now().format("_%Y_%m_%d_%H_%M_%S");
        target = dest_dir.join(format!("{name}{suffix}.{ext}"));
    }

    if tokio::fs::rename(output, &target).await.is_err() {
        // Different filesystem: copy, then drop the source.
        tokio::fs::copy(output, &target).await?;
        tokio::fs::remove_file(output).await?;
    }
    info!(path = %target.display(), "Output ready");
    Ok(target)
}

/// Remove a batch directory and everything under it.
pub async fn clear_temp(batch_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(batch_dir).await {
        Ok(()) => {
            debug!(dir = %batch_dir.display(), "Removed temp directory");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(path: PathBuf, data: &[u8]) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, data).await.unwrap();
    }

    #[tokio::test]
    async fn merges_parts_in_playback_order() {
        let tmp = tempfile::tempdir().unwrap();
        let batch = tmp.path().join("show");
        write(batch.join("Part_1/0.ts"), b"P1.s0|").await;
        write(batch.join("Part_1/1.ts"), b"P1.s1|").await;
        write(batch.join("Part_0/10.ts"), b"P0.s10|").await;
        write(batch.join("Part_0/09.ts"), b"P0.s9|").await;
        // Leftover temp files are not part of the output.
        write(batch.join("Part_0/11.downloading"), b"junk").await;

        let output = tmp.path().join("out.ts");
        binary_merge(&batch, &output).await.unwrap();

        let merged = tokio::fs::read(&output).await.unwrap();
        assert_eq!(merged, b"P0.s9|P0.s10|P1.s0|P1.s1|");
        assert!(batch.join("Part_0.ts").is_file());
        assert!(batch.join("Part_1.ts").is_file());
    }

    #[tokio::test]
    async fn map_comes_first_and_names_the_fragment_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let batch = tmp.path().join("show");
        write(batch.join("Part_0/0.m4s"), b"frag0").await;
        write(batch.join("Part_0/!MAP.mp4"), b"init").await;

        let parts = merge_parts(&batch).await.unwrap();
        assert_eq!(parts, vec![batch.join("Part_0.m4s")]);
        assert_eq!(tokio::fs::read(&parts[0]).await.unwrap(), b"initfrag0");
    }

    #[tokio::test]
    async fn empty_batch_is_a_mux_error() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("Part_0")).await.unwrap();
        let err = merge_parts(tmp.path()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Mux { .. }));
    }

    fn joined(args: Vec<OsString>) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn concat_arguments() {
        let ffmpeg = Ffmpeg::new("ffmpeg");
        assert_eq!(
            joined(ffmpeg.concat_args(Path::new("concat.txt"), Path::new("out.mp4"), true)),
            "-f concat -safe 0 -i concat.txt -map 0:v? -map 0:a? -map 0:s? -c copy -y \
             -bsf:a aac_adtstoasc -f mp4 out.mp4 -loglevel warning"
        );

        let plain = Ffmpeg {
            bitstream_filter: false,
            ..ffmpeg
        };
        let args = plain.concat_args(Path::new("l"), Path::new("o"), true);
        assert!(!args.iter().any(|a| a == "-bsf:a"));
    }

    #[test]
    fn fragmented_input_skips_the_adts_filter() {
        let args = Ffmpeg::new("ffmpeg").concat_args(Path::new("l"), Path::new("o"), false);
        assert!(!args.iter().any(|a| a == "-bsf:a"));
    }

    #[test]
    fn merge_options_reach_the_command_line() {
        let config = MergeConfig {
            keep_fragmented: true,
            discard_corrupt: true,
            gen_pts: true,
            ..Default::default()
        };
        assert_eq!(
            joined(Ffmpeg::from_config(&config).concat_args(Path::new("l"), Path::new("o"), false)),
            "-fflags +discardcorrupt+genpts -f concat -safe 0 -i l -map 0:v? -map 0:a? -map 0:s? \
             -c copy -y -movflags frag_keyframe+empty_moov -f mp4 o -loglevel warning"
        );

        let ts = Ffmpeg::from_config(&MergeConfig {
            output_format: OutputFormat::Ts,
            keep_fragmented: true,
            ..Default::default()
        });
        assert_eq!(ts.extension(), "ts");
        assert_eq!(
            joined(ts.concat_args(Path::new("l"), Path::new("o.ts"), true)),
            "-f concat -safe 0 -i l -map 0:v? -map 0:a? -map 0:s? -c copy -y -f mpegts o.ts \
             -loglevel warning"
        );
    }

    #[test]
    fn mux_arguments() {
        let ffmpeg = Ffmpeg::new("ffmpeg");
        assert_eq!(
            joined(ffmpeg.mux_args(Path::new("v.mp4"), Path::new("a.ts"), Path::new("out.mp4"))),
            "-i v.mp4 -i a.ts -map 0:v? -map 1:a? -c copy -y -bsf:a aac_adtstoasc -f mp4 out.mp4 \
             -loglevel warning"
        );
        let args = ffmpeg.mux_args(Path::new("v.mp4"), Path::new("a.m4s"), Path::new("out.mp4"));
        assert!(!args.iter().any(|a| a == "-bsf:a"));
    }

    #[test]
    fn concat_list_escapes_quotes() {
        let list = concat_list(&[PathBuf::from("/tmp/a.ts"), PathBuf::from("/tmp/it's.ts")]);
        assert_eq!(list, "file '/tmp/a.ts'\nfile '/tmp/it'\\''s.ts'\n");
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_a_mux_error() {
        let tmp = tempfile::tempdir().unwrap();
        let part = tmp.path().join("Part_0.ts");
        tokio::fs::write(&part, b"x").await.unwrap();

        let ffmpeg = Ffmpeg::new(tmp.path().join("no-such-ffmpeg"));
        let err = ffmpeg
            .concat(&[part], &tmp.path().join("out.mp4"), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Mux { .. }));
        assert!(!tmp.path().join(CONCAT_LIST).exists());
    }

    #[tokio::test]
    async fn finalize_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");

        let first = tmp.path().join("a.mp4");
        tokio::fs::write(&first, b"first").await.unwrap();
        let path = finalize(&first, &dest, "show").await.unwrap();
        assert_eq!(path, dest.join("show.mp4"));

        let second = tmp.path().join("b.mp4");
        tokio::fs::write(&second, b"second").await.unwrap();
        let path = finalize(&second, &dest, "show").await.unwrap();
        assert_ne!(path, dest.join("show.mp4"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("show_") && name.ends_with(".mp4"));
        assert_eq!(tokio::fs::read(dest.join("show.mp4")).await.unwrap(), b"first");
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn clear_temp_tolerates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let batch = tmp.path().join("show");
        write(batch.join("Part_0/0.ts"), b"x").await;
        clear_temp(&batch).await.unwrap();
        assert!(!batch.exists());
        clear_temp(&batch).await.unwrap();
    }
}
