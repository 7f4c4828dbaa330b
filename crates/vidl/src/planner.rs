//! Turns manifest Parts into on-disk work items.
//!
//! Layout: `{work_dir}/{save_name}/Part_{n}/{index}{ext}`, with the Part's
//! initialization map stored as `!MAP.mp4`. Names are zero-padded so lexical
//! order matches playback order.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{DownloadError, Result};
use crate::model::{ByteRange, Part, SegmentKey};
use crate::state::BatchCounters;

pub const MAP_NAME: &str = "!MAP";
pub const EXT_MAP: &str = ".mp4";
pub const EXT_FRAGMENT: &str = ".m4s";
pub const EXT_TS: &str = ".ts";
pub const TEMP_SUFFIX: &str = ".downloading";
const DEFAULT_FILENAME: &str = "video";

/// One file to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Playback order: (part, position in part).
    pub order: (usize, usize),
    pub dir: PathBuf,
    pub name: String,
    pub extension: &'static str,
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub key: SegmentKey,
    /// Used to derive the IV when the key carries none.
    pub media_sequence: u64,
}

impl WorkItem {
    pub fn final_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, self.extension))
    }

    pub fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, TEMP_SUFFIX))
    }

    pub fn is_map(&self) -> bool {
        self.name == MAP_NAME
    }
}

/// Work items of one batch plus its directory.
#[derive(Debug, Clone)]
pub struct Plan {
    pub batch_dir: PathBuf,
    pub part_dirs: Vec<PathBuf>,
    pub items: Vec<WorkItem>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items without a non-empty final file. When `counters` is given, items
    /// already on disk are counted there as finished.
    pub async fn pending(&self, counters: Option<&BatchCounters>) -> Result<Vec<WorkItem>> {
        let mut pending = Vec::new();
        for item in &self.items {
            match completed_size(&item.final_path()).await? {
                Some(size) => {
                    if let Some(counters) = counters {
                        counters.finish_item(size);
                    }
                }
                None => pending.push(item.clone()),
            }
        }
        debug!(
            total = self.items.len(),
            pending = pending.len(),
            "Scanned batch directory"
        );
        Ok(pending)
    }

    /// Fail with `Incomplete` unless every item has its final file.
    pub async fn check_complete(&self) -> Result<()> {
        let mut finished = 0;
        for item in &self.items {
            if completed_size(&item.final_path()).await?.is_some() {
                finished += 1;
            }
        }
        if finished == self.items.len() {
            Ok(())
        } else {
            Err(DownloadError::Incomplete {
                finished,
                total: self.items.len(),
            })
        }
    }
}

/// Size of a completed output file, `None` if missing or empty.
pub async fn completed_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub struct WorkPlanner {
    batch_dir: PathBuf,
}

impl WorkPlanner {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            batch_dir: config.batch_dir(),
        })
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    /// Build work items for `parts` and create the directory skeleton.
    pub async fn plan(&self, parts: &[Part]) -> Result<Plan> {
        let segment_count: usize = parts.iter().map(|p| p.segments.len()).sum();
        if segment_count == 0 {
            return Err(DownloadError::configuration("manifest contains no segments"));
        }

        let part_width = digits(parts.len().saturating_sub(1) as u64);
        let mut items = Vec::with_capacity(segment_count + parts.len());
        let mut part_dirs = Vec::with_capacity(parts.len());

        for (part_no, part) in parts.iter().enumerate() {
            let dir = self
                .batch_dir
                .join(format!("Part_{part_no:0part_width$}"));
            tokio::fs::create_dir_all(&dir).await?;
            items.extend(part_items(part_no, part, &dir));
            part_dirs.push(dir);
        }

        debug!(
            batch_dir = %self.batch_dir.display(),
            parts = parts.len(),
            items = items.len(),
            "Planned batch"
        );

        Ok(Plan {
            batch_dir: self.batch_dir.clone(),
            part_dirs,
            items,
        })
    }
}

/// Work items of one Part, the map (if any) first.
pub fn part_items(part_no: usize, part: &Part, dir: &Path) -> Vec<WorkItem> {
    let mut items = Vec::with_capacity(part.segments.len() + 1);
    let extension = if part.map.is_some() {
        EXT_FRAGMENT
    } else {
        EXT_TS
    };

    if let Some(map) = &part.map {
        items.push(WorkItem {
            order: (part_no, 0),
            dir: dir.to_path_buf(),
            name: MAP_NAME.to_owned(),
            extension: EXT_MAP,
            uri: map.uri.clone(),
            byte_range: map.byte_range,
            key: map.key.clone(),
            media_sequence: part.segments.first().map_or(0, |s| s.index),
        });
    }

    let width = digits(part.segments.iter().map(|s| s.index).max().unwrap_or(0));
    let offset = items.len();
    items.extend(part.segments.iter().enumerate().map(|(pos, segment)| WorkItem {
        order: (part_no, offset + pos),
        dir: dir.to_path_buf(),
        name: format!("{:0width$}", segment.index),
        extension,
        uri: segment.uri.clone(),
        byte_range: segment.byte_range,
        key: segment.key.clone(),
        media_sequence: segment.index,
    }));
    items
}

fn digits(n: u64) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

/// Replace characters that are invalid in file names.
pub fn sanitize_filename(input: &str) -> String {
    let invalid_chars = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let result: String = input
        .chars()
        .map(|c| {
            if invalid_chars.contains(&c) || c < ' ' {
                '_'
            } else {
                c
            }
        })
        .collect();

    let result = result.trim_matches(|c| c == '.' || c == ' ');
    if result.is_empty() {
        DEFAULT_FILENAME.to_owned()
    } else {
        result.chars().take(200).collect()
    }
}
