//! Manifest-level data model consumed by the engine.

use std::time::Duration;

/// HTTP partial-content window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Value for the `Range` request header. Ranges are inclusive on both ends.
    pub fn header_value(&self) -> String {
        let last = self.offset + self.length.saturating_sub(1);
        format!("bytes={}-{}", self.offset, last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum KeyMethod {
    #[default]
    None,
    Aes128,
    /// Any method the engine cannot decrypt (e.g. SAMPLE-AES).
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentKey {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

impl SegmentKey {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn aes128(uri: impl Into<String>, iv: Option<[u8; 16]>) -> Self {
        Self {
            method: KeyMethod::Aes128,
            uri: Some(uri.into()),
            iv,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.method != KeyMethod::None
    }

    /// Explicit IV, or the media sequence number as a big-endian 128-bit value.
    pub fn iv_for(&self, media_sequence: u64) -> [u8; 16] {
        self.iv
            .unwrap_or_else(|| u128::from(media_sequence).to_be_bytes())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Ordinal, unique within one stream generation.
    pub index: u64,
    pub duration: f32,
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub key: SegmentKey,
    pub discontinuity: bool,
}

impl Segment {
    pub fn new(index: u64, uri: impl Into<String>) -> Self {
        Self {
            index,
            duration: 0.0,
            uri: uri.into(),
            byte_range: None,
            key: SegmentKey::none(),
            discontinuity: false,
        }
    }
}

/// Initialization object shared by a Part's segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMap {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    /// Key in effect where the map is declared. An encrypted map needs an
    /// explicit IV; without one the first segment's sequence number is used.
    pub key: SegmentKey,
}

impl SegmentMap {
    pub fn new(uri: impl Into<String>, byte_range: Option<ByteRange>) -> Self {
        Self {
            uri: uri.into(),
            byte_range,
            key: SegmentKey::none(),
        }
    }

    pub fn with_key(mut self, key: SegmentKey) -> Self {
        self.key = key;
        self
    }

    /// Whether both maps point at the same bytes, whatever their keys.
    pub fn same_resource(&self, other: &SegmentMap) -> bool {
        self.uri == other.uri && self.byte_range == other.byte_range
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// Order of this part within the playlist. Also bumped by a map change,
    /// so it can shift when the live window slides.
    pub sequence: u64,
    /// Discontinuity sequence the part belongs to; stable across refreshes.
    pub discontinuity_sequence: u64,
    pub segments: Vec<Segment>,
    pub map: Option<SegmentMap>,
}

impl Part {
    pub fn new(sequence: u64, segments: Vec<Segment>) -> Self {
        Self {
            sequence,
            discontinuity_sequence: sequence,
            segments,
            map: None,
        }
    }

    pub fn with_map(mut self, map: SegmentMap) -> Self {
        self.map = Some(map);
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.segments.iter().map(|s| f64::from(s.duration)).sum())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub parts: Vec<Part>,
    pub end_list: bool,
    pub target_duration: Duration,
}

impl Manifest {
    pub fn is_live(&self) -> bool {
        !self.end_list
    }

    pub fn segment_count(&self) -> usize {
        self.parts.iter().map(|p| p.segments.len()).sum()
    }

    /// AES-128 key URIs used by segments and init maps.
    pub fn key_uris(&self) -> impl Iterator<Item = &str> {
        self.parts
            .iter()
            .flat_map(|p| {
                p.map
                    .iter()
                    .map(|m| &m.key)
                    .chain(p.segments.iter().map(|s| &s.key))
            })
            .filter(|key| key.method == KeyMethod::Aes128)
            .filter_map(|key| key.uri.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(ByteRange::new(100, 50).header_value(), "bytes=100-149");
        assert_eq!(ByteRange::new(0, 1).header_value(), "bytes=0-0");
    }

    #[test]
    fn iv_defaults_to_media_sequence() {
        let key = SegmentKey::aes128("key.bin", None);
        let iv = key.iv_for(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);

        let explicit = SegmentKey::aes128("key.bin", Some([7u8; 16]));
        assert_eq!(explicit.iv_for(5), [7u8; 16]);
    }

    #[test]
    fn key_uris_include_encrypted_maps() {
        let map = SegmentMap::new("init.mp4", None)
            .with_key(SegmentKey::aes128("map.key", Some([1u8; 16])));
        let mut segment = Segment::new(0, "0.m4s");
        segment.key = SegmentKey::aes128("seg.key", None);
        let manifest = Manifest {
            parts: vec![Part::new(0, vec![segment]).with_map(map)],
            end_list: true,
            target_duration: Duration::from_secs(4),
        };
        let uris: Vec<&str> = manifest.key_uris().collect();
        assert_eq!(uris, vec!["map.key", "seg.key"]);
    }
}
