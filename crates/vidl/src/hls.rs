// HLS manifest adapter: maps m3u8-rs playlists onto Parts and Segments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m3u8_rs::{AlternativeMediaType, MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};
use url::Url;

use crate::error::{DownloadError, Result};
use crate::model::{ByteRange, KeyMethod, Manifest, Part, Segment, SegmentKey, SegmentMap};
use crate::rec::ManifestSource;
use crate::transport::{Transport, fetch_text};

/// Fetches an HLS playlist and resolves master playlists to their
/// highest-bandwidth variant. The resolved media playlist URL is remembered,
/// so live polling skips the master after the first fetch.
pub struct HlsManifestSource {
    transport: Arc<dyn Transport>,
    url: String,
    media_url: Mutex<Option<String>>,
    audio_url: Mutex<Option<String>>,
}

impl HlsManifestSource {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            media_url: Mutex::new(None),
            audio_url: Mutex::new(None),
        }
    }

    /// URL of the media playlist actually polled, once known.
    pub fn media_url(&self) -> Option<String> {
        self.media_url.lock().clone()
    }

    /// Separate audio rendition of the selected variant, if the master
    /// playlist declared one.
    pub fn audio_url(&self) -> Option<String> {
        self.audio_url.lock().clone()
    }

    /// Source polling the audio rendition found by the last master fetch.
    pub fn audio_source(&self) -> Option<HlsManifestSource> {
        self.audio_url()
            .map(|url| HlsManifestSource::new(Arc::clone(&self.transport), url))
    }

    async fn fetch_playlist(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<(Playlist, String)> {
        let (text, final_url) = fetch_text(self.transport.as_ref(), url, token).await?;
        let playlist = parse_playlist(&text)?;
        Ok((playlist, final_url))
    }
}

#[async_trait]
impl ManifestSource for HlsManifestSource {
    #[instrument(skip(self, token), fields(url = %self.url))]
    async fn fetch(&self, token: &CancellationToken) -> Result<Manifest> {
        let known = self.media_url();
        let url = known.as_deref().unwrap_or(&self.url);

        let (playlist, final_url) = self.fetch_playlist(url, token).await?;
        let (media, base) = match playlist {
            Playlist::MediaPlaylist(media) => (media, final_url),
            Playlist::MasterPlaylist(master) => {
                let variant_url = select_variant(&master, &final_url)?;
                info!(variant = %variant_url, "Selected highest bandwidth variant");
                let audio_url = select_audio(&master, &final_url)?;
                if let Some(audio) = &audio_url {
                    info!(audio = %audio, "Variant has a separate audio rendition");
                }
                *self.audio_url.lock() = audio_url;
                match self.fetch_playlist(&variant_url, token).await? {
                    (Playlist::MediaPlaylist(media), base) => (media, base),
                    (Playlist::MasterPlaylist(_), _) => {
                        return Err(DownloadError::playlist(format!(
                            "variant {variant_url} is another master playlist"
                        )));
                    }
                }
            }
        };

        *self.media_url.lock() = Some(base.clone());
        let manifest = to_manifest(&media, &base)?;
        debug!(
            parts = manifest.parts.len(),
            segments = manifest.segment_count(),
            end_list = manifest.end_list,
            "Playlist refreshed"
        );
        Ok(manifest)
    }
}

pub fn parse_playlist(text: &str) -> Result<Playlist> {
    m3u8_rs::parse_playlist_res(text.as_bytes())
        .map_err(|e| DownloadError::playlist(format!("failed to parse playlist: {e:?}")))
}

fn best_variant(master: &MasterPlaylist) -> Result<&VariantStream> {
    master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .max_by_key(|v| v.bandwidth)
        .ok_or_else(|| DownloadError::playlist("master playlist has no variants"))
}

/// Absolute URL of the highest-bandwidth (non I-frame) variant.
pub fn select_variant(master: &MasterPlaylist, base: &str) -> Result<String> {
    resolve_uri(base, &best_variant(master)?.uri)
}

/// Absolute URL of the audio rendition in the selected variant's `AUDIO`
/// group. The `DEFAULT=YES` entry wins; renditions without a URI are muxed
/// into the variant and ignored.
pub fn select_audio(master: &MasterPlaylist, base: &str) -> Result<Option<String>> {
    let Some(group) = best_variant(master)?.audio.as_deref() else {
        return Ok(None);
    };
    let mut renditions = master.alternatives.iter().filter(|media| {
        media.media_type == AlternativeMediaType::Audio
            && media.group_id == group
            && media.uri.is_some()
    });
    let first = renditions.clone().next();
    let chosen = renditions.find(|media| media.default).or(first);
    chosen
        .and_then(|media| media.uri.as_deref())
        .map(|uri| resolve_uri(base, uri))
        .transpose()
}

fn resolve_uri(base: &str, relative: &str) -> Result<String> {
    let resolved = Url::parse(base)
        .and_then(|b| b.join(relative))
        .map_err(|e| DownloadError::invalid_url(relative, e.to_string()))?;
    trace!("Resolved URI: {} + {} -> {}", base, relative, resolved);
    Ok(resolved.to_string())
}

/// `0x`-prefixed hex IV from `EXT-X-KEY`.
pub fn parse_iv(iv_hex_str: &str) -> Result<[u8; 16]> {
    let iv_str = iv_hex_str
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv_bytes = [0u8; 16];
    hex::decode_to_slice(iv_str, &mut iv_bytes)
        .map_err(|e| DownloadError::playlist(format!("failed to parse IV '{iv_hex_str}': {e}")))?;
    Ok(iv_bytes)
}

fn convert_key(key: &m3u8_rs::Key, base: &str) -> Result<SegmentKey> {
    let method = match key.method {
        m3u8_rs::KeyMethod::None => return Ok(SegmentKey::none()),
        m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
        _ => KeyMethod::Other,
    };
    let uri = key
        .uri
        .as_deref()
        .map(|uri| resolve_uri(base, uri))
        .transpose()?;
    let iv = key.iv.as_deref().map(parse_iv).transpose()?;
    Ok(SegmentKey { method, uri, iv })
}

fn convert_range(range: &m3u8_rs::ByteRange, previous_end: Option<u64>) -> ByteRange {
    ByteRange::new(range.offset.or(previous_end).unwrap_or(0), range.length)
}

/// `EXT-X-MAP` that m3u8-rs leaves in `unknown_tags` when it precedes the
/// first segment.
fn parse_playlist_level_map(playlist: &MediaPlaylist) -> Option<m3u8_rs::Map> {
    let ext = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?;
    let rest = ext.rest.as_deref()?;

    let mut uri: Option<String> = None;
    let mut byte_range: Option<m3u8_rs::ByteRange> = None;

    // Split on commas, but keep quoted values intact.
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }

    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let key = k.trim();
        let val = v.trim().trim_matches('"');

        if key.eq_ignore_ascii_case("URI") {
            uri = Some(val.to_string());
        } else if key.eq_ignore_ascii_case("BYTERANGE") {
            let (len_str, offset_str) = val.split_once('@').unwrap_or((val, ""));
            if let Ok(length) = len_str.trim().parse::<u64>() {
                byte_range = Some(m3u8_rs::ByteRange {
                    length,
                    offset: offset_str.trim().parse::<u64>().ok(),
                });
            }
        }
    }

    Some(m3u8_rs::Map {
        uri: uri?,
        byte_range,
        other_attributes: Default::default(),
    })
}

fn convert_map(map: &m3u8_rs::Map, base: &str, key: &SegmentKey) -> Result<SegmentMap> {
    let byte_range = map.byte_range.as_ref().map(|r| convert_range(r, None));
    Ok(SegmentMap::new(resolve_uri(base, &map.uri)?, byte_range).with_key(key.clone()))
}

/// Map a media playlist onto Parts.
///
/// Segment indices come from `EXT-X-MEDIA-SEQUENCE`, discontinuity numbers
/// from `EXT-X-DISCONTINUITY-SEQUENCE` plus the discontinuities seen so far,
/// so both stay stable across refreshes of a live playlist. A new Part also
/// starts when the initialization map changes. Keys carry forward until the
/// next `EXT-X-KEY`; a map is encrypted with the key in force at the segment
/// that declares it.
pub fn to_manifest(playlist: &MediaPlaylist, base: &str) -> Result<Manifest> {
    let mut parts: Vec<Part> = Vec::new();
    let mut sequence = playlist.discontinuity_sequence;
    let mut discontinuity = playlist.discontinuity_sequence;
    let mut key = SegmentKey::none();
    if let Some(k) = playlist.segments.first().and_then(|s| s.key.as_ref()) {
        key = convert_key(k, base)?;
    }
    let mut map = parse_playlist_level_map(playlist)
        .map(|m| convert_map(&m, base, &key))
        .transpose()?;
    let mut current = Part {
        sequence,
        discontinuity_sequence: discontinuity,
        segments: Vec::new(),
        map: map.clone(),
    };
    let mut last_range: Option<(String, u64)> = None;

    for (i, segment) in playlist.segments.iter().enumerate() {
        let index = playlist.media_sequence + i as u64;

        if let Some(k) = &segment.key {
            key = convert_key(k, base)?;
        }

        let mut boundary = false;
        if segment.discontinuity {
            sequence += 1;
            discontinuity += 1;
            boundary = true;
        }
        if let Some(m) = &segment.map {
            let m = convert_map(m, base, &key)?;
            if !map.as_ref().is_some_and(|current| current.same_resource(&m)) {
                if !segment.discontinuity && !current.segments.is_empty() {
                    sequence += 1;
                }
                map = Some(m);
                boundary = true;
            }
        }
        if boundary {
            let finished = std::mem::replace(
                &mut current,
                Part {
                    sequence,
                    discontinuity_sequence: discontinuity,
                    segments: Vec::new(),
                    map: map.clone(),
                },
            );
            if !finished.segments.is_empty() {
                parts.push(finished);
            }
        }

        let uri = resolve_uri(base, &segment.uri)?;
        let byte_range = segment.byte_range.as_ref().map(|range| {
            let previous_end = last_range
                .as_ref()
                .filter(|(last_uri, _)| *last_uri == uri)
                .map(|(_, end)| *end);
            convert_range(range, previous_end)
        });
        if let Some(range) = byte_range {
            last_range = Some((uri.clone(), range.offset + range.length));
        }

        current.segments.push(Segment {
            index,
            duration: segment.duration,
            uri,
            byte_range,
            key: key.clone(),
            discontinuity: segment.discontinuity,
        });
    }
    if !current.segments.is_empty() {
        parts.push(current);
    }

    Ok(Manifest {
        parts,
        end_list: playlist.end_list,
        target_duration: Duration::from_secs(playlist.target_duration),
    })
}
