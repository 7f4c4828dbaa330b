use std::collections::HashMap;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::transport::{FetchRequest, Transport, fetch_bytes};

pub const AES_128_KEY_LEN: usize = 16;

/// Raw key bytes by key URI.
///
/// Populated before a batch starts and only read afterwards, so it is shared
/// between workers behind an `Arc` without locking.
#[derive(Debug, Clone, Default)]
pub struct KeyCache {
    keys: HashMap<String, Bytes>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.keys.contains_key(uri)
    }

    pub fn insert(&mut self, uri: impl Into<String>, key: Bytes) {
        self.keys.insert(uri.into(), key);
    }

    /// Fetch every URI not cached yet. Returns the number of keys fetched.
    pub async fn populate<'a, I>(
        &mut self,
        uris: I,
        transport: &dyn Transport,
        token: &CancellationToken,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut fetched = 0;
        for uri in uris {
            if self.keys.contains_key(uri) {
                continue;
            }
            let (key, _) = fetch_bytes(transport, FetchRequest::get(uri), token).await?;
            debug!(uri, len = key.len(), "Fetched decryption key");
            self.keys.insert(uri.to_owned(), key);
            fetched += 1;
        }
        Ok(fetched)
    }

    /// AES-128 key for `uri`.
    pub fn aes128(&self, uri: &str) -> Result<[u8; AES_128_KEY_LEN]> {
        let key = self
            .keys
            .get(uri)
            .ok_or_else(|| DownloadError::crypto(format!("no cached key for {uri}")))?;
        key.as_ref().try_into().map_err(|_| {
            DownloadError::crypto(format!(
                "key from {uri} is {} bytes, expected {AES_128_KEY_LEN}",
                key.len()
            ))
        })
    }
}
