#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use vidl_engine::transport::{FetchRequest, FetchResponse, Transport};
use vidl_engine::{DownloadError, EngineConfig, Result};

/// In-memory transport serving registered bodies, with range support,
/// failure injection and fetch accounting.
#[derive(Default)]
pub struct MockTransport {
    resources: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, u32>>,
    truncations: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.resources.lock().insert(url.to_owned(), body.into());
    }

    /// Fail the next `times` fetches of `url` with HTTP 503.
    pub fn fail(&self, url: &str, times: u32) {
        self.failures.lock().insert(url.to_owned(), times);
    }

    /// Cut the body of the next `times` fetches of `url` in half while still
    /// announcing the full length.
    pub fn truncate(&self, url: &str, times: u32) {
        self.truncations.lock().insert(url.to_owned(), times);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fetches(&self) -> usize {
        self.log.lock().len()
    }

    pub fn fetches_of(&self, url: &str) -> usize {
        self.log.lock().iter().filter(|u| *u == url).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        token: &CancellationToken,
    ) -> Result<FetchResponse> {
        self.log.lock().push(request.url.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock();
        let cancelled = tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(latency) => false,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Err(DownloadError::Cancelled);
        }

        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&request.url)
                && *left > 0
            {
                *left -= 1;
                return Err(DownloadError::http_status(
                    StatusCode::SERVICE_UNAVAILABLE,
                    request.url,
                    "mock fetch",
                ));
            }
        }

        let Some(body) = self.resources.lock().get(&request.url).cloned() else {
            return Err(DownloadError::http_status(
                StatusCode::NOT_FOUND,
                request.url,
                "mock fetch",
            ));
        };

        let total = body.len() as u64;
        let (body, total_length) = match request.range {
            Some(range) => {
                let start = range.offset.min(total) as usize;
                let end = (range.offset + range.length).min(total) as usize;
                (body.slice(start..end), Some(total))
            }
            None => (body, None),
        };

        let content_length = body.len() as u64;
        let body = {
            let mut truncations = self.truncations.lock();
            match truncations.get_mut(&request.url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    body.slice(..body.len() / 2)
                }
                _ => body,
            }
        };

        // Split into small chunks to exercise the streaming path.
        let chunks: Vec<Result<Bytes>> = body
            .chunks(1000)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(FetchResponse {
            content_length: Some(content_length),
            total_length,
            body: futures::stream::iter(chunks).boxed(),
            charset: None,
            final_url: request.url,
        })
    }
}

/// Route engine logs to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        work_dir: dir.to_path_buf(),
        save_name: "batch".into(),
        concurrency: 4,
        delay: Duration::ZERO,
        max_retries: 3,
        outer_retries: 0,
        outer_delay: Duration::from_millis(1),
        report_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Mock TS payload: `packets` sync-aligned 188-byte packets tagged with `tag`.
pub fn ts_payload(tag: u8, packets: usize) -> Vec<u8> {
    let mut data = vec![tag; packets * 188];
    for packet in data.chunks_mut(188) {
        packet[0] = 0x47;
    }
    data
}

pub fn encrypt_data(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let encryptor = cbc::Encryptor::<Aes128>::new(key.into(), iv.into());
    let mut buf = vec![0u8; data.len() + 16 - data.len() % 16];
    buf[..data.len()].copy_from_slice(data);
    encryptor
        .encrypt_padded_mut::<Pkcs7>(&mut buf, data.len())
        .unwrap()
        .to_vec()
}
