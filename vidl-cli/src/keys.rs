use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vidl_engine::{KeyMethod, Manifest, ManifestSource, Result, SegmentKey};

/// Pseudo URI under which a key given on the command line is cached.
pub const CUSTOM_KEY_URI: &str = "vidl:custom-key";

/// Command line overrides for segment encryption.
#[derive(Debug, Clone, Default)]
pub struct KeyOverride {
    pub method: Option<KeyMethod>,
    pub key: Option<[u8; 16]>,
    pub iv: Option<[u8; 16]>,
}

impl KeyOverride {
    pub fn is_empty(&self) -> bool {
        self.method.is_none() && self.key.is_none() && self.iv.is_none()
    }

    pub fn apply(&self, manifest: &mut Manifest) {
        for part in &mut manifest.parts {
            if let Some(map) = &mut part.map {
                self.apply_map_key(&mut map.key);
            }
            for segment in &mut part.segments {
                self.apply_key(&mut segment.key);
            }
        }
    }

    /// Maps are only decrypted when the playlist says so; a forced method
    /// never turns a clear map into an encrypted one.
    fn apply_map_key(&self, key: &mut SegmentKey) {
        if self.method == Some(KeyMethod::None) {
            *key = SegmentKey::none();
        } else if key.is_encrypted() {
            let method = key.method;
            self.apply_key(key);
            key.method = method;
        }
    }

    fn apply_key(&self, key: &mut SegmentKey) {
        match self.method {
            Some(KeyMethod::None) => {
                *key = SegmentKey::none();
                return;
            }
            Some(method) => key.method = method,
            None => {}
        }
        if !key.is_encrypted() {
            return;
        }
        if self.key.is_some() {
            key.uri = Some(CUSTOM_KEY_URI.to_owned());
        }
        if let Some(iv) = self.iv {
            key.iv = Some(iv);
        }
    }
}

/// Applies a [`KeyOverride`] to every manifest fetched from `inner`.
pub struct OverrideSource {
    inner: Arc<dyn ManifestSource>,
    keys: KeyOverride,
}

impl OverrideSource {
    pub fn wrap(inner: Arc<dyn ManifestSource>, keys: KeyOverride) -> Arc<dyn ManifestSource> {
        if keys.is_empty() {
            inner
        } else {
            Arc::new(Self { inner, keys })
        }
    }
}

#[async_trait]
impl ManifestSource for OverrideSource {
    async fn fetch(&self, token: &CancellationToken) -> Result<Manifest> {
        let mut manifest = self.inner.fetch(token).await?;
        self.keys.apply(&mut manifest);
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vidl_engine::{Part, Segment, SegmentMap};

    fn manifest(key: SegmentKey) -> Manifest {
        let mut segment = Segment::new(0, "https://cdn.test/0.ts");
        segment.key = key;
        Manifest {
            parts: vec![Part::new(0, vec![segment])],
            end_list: true,
            target_duration: Duration::from_secs(4),
        }
    }

    fn key_of(manifest: &Manifest) -> &SegmentKey {
        &manifest.parts[0].segments[0].key
    }

    #[test]
    fn custom_key_replaces_key_uri() {
        let mut m = manifest(SegmentKey::aes128("https://cdn.test/key", None));
        KeyOverride {
            key: Some([1; 16]),
            iv: Some([2; 16]),
            ..Default::default()
        }
        .apply(&mut m);
        assert_eq!(key_of(&m).uri.as_deref(), Some(CUSTOM_KEY_URI));
        assert_eq!(key_of(&m).iv, Some([2; 16]));
    }

    #[test]
    fn plain_segments_stay_plain_without_method() {
        let mut m = manifest(SegmentKey::none());
        KeyOverride {
            key: Some([1; 16]),
            ..Default::default()
        }
        .apply(&mut m);
        assert!(!key_of(&m).is_encrypted());
    }

    #[test]
    fn method_override_encrypts_and_disables() {
        let mut m = manifest(SegmentKey::none());
        KeyOverride {
            method: Some(KeyMethod::Aes128),
            key: Some([1; 16]),
            ..Default::default()
        }
        .apply(&mut m);
        assert!(key_of(&m).is_encrypted());
        assert_eq!(key_of(&m).uri.as_deref(), Some(CUSTOM_KEY_URI));

        KeyOverride {
            method: Some(KeyMethod::None),
            ..Default::default()
        }
        .apply(&mut m);
        assert!(!key_of(&m).is_encrypted());
    }

    #[test]
    fn forced_method_leaves_clear_maps_alone() {
        let mut m = manifest(SegmentKey::none());
        m.parts[0].map = Some(SegmentMap::new("https://cdn.test/init.mp4", None));
        let mut encrypted = manifest(SegmentKey::none());
        encrypted.parts[0].map = Some(
            SegmentMap::new("https://cdn.test/init.mp4", None)
                .with_key(SegmentKey::aes128("https://cdn.test/key", None)),
        );
        let overrides = KeyOverride {
            method: Some(KeyMethod::Aes128),
            key: Some([1; 16]),
            ..Default::default()
        };
        overrides.apply(&mut m);
        overrides.apply(&mut encrypted);

        assert!(key_of(&m).is_encrypted());
        assert!(!m.parts[0].map.as_ref().unwrap().key.is_encrypted());
        let map_key = &encrypted.parts[0].map.as_ref().unwrap().key;
        assert_eq!(map_key.uri.as_deref(), Some(CUSTOM_KEY_URI));
    }
}
