//! # Segment byte pipeline
//!
//! Bytes read from the network flow through an ordered chain of
//! [`SegmentStage`]s before they reach the temp file: decryption first, then
//! any caller-supplied post-processing.
//!
//! Each stage receives chunks through `process` and may emit any number of
//! chunks downstream. `finish` flushes whatever a stage held back. Stages only
//! buffer what they must: the AES stage keeps the trailing block (it may carry
//! padding) and the header stripper keeps a bounded lookahead window.

use std::sync::Arc;

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cbc::Decryptor;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use tracing::{debug, trace};

use crate::error::{DownloadError, Result};
use crate::keys::KeyCache;
use crate::model::{KeyMethod, SegmentKey};

const AES_BLOCK_SIZE: usize = 16;

/// PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
pub const TS_SYNC_BYTE: u8 = 0x47;
pub const TS_PACKET_SIZE: usize = 188;
const DEFAULT_LOOKAHEAD: usize = 1024;

pub type Output<'a> = dyn FnMut(Bytes) -> Result<()> + 'a;

/// One step of the segment pipeline.
pub trait SegmentStage: Send {
    fn process(&mut self, chunk: Bytes, output: &mut Output<'_>) -> Result<()>;

    fn finish(&mut self, output: &mut Output<'_>) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Builds a fresh post-processing stage for each segment.
pub type StageFactory = Arc<dyn Fn() -> Box<dyn SegmentStage> + Send + Sync>;

/// Ordered chain of stages for a single segment.
#[derive(Default)]
pub struct SegmentPipeline {
    stages: Vec<Box<dyn SegmentStage>>,
}

impl SegmentPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage to the end of the pipeline.
    pub fn add_stage<S: SegmentStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn add_boxed(mut self, stage: Box<dyn SegmentStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Build the pipeline for one segment: decryption for its key, then the
    /// post-processing stages.
    pub fn for_segment(
        key: &SegmentKey,
        media_sequence: u64,
        keys: &KeyCache,
        post: &[StageFactory],
    ) -> Result<Self> {
        let mut pipeline = Self::new();
        match key.method {
            KeyMethod::None => {}
            KeyMethod::Aes128 => {
                let uri = key
                    .uri
                    .as_deref()
                    .ok_or_else(|| DownloadError::crypto("AES-128 key without URI"))?;
                let raw = keys.aes128(uri)?;
                pipeline = pipeline.add_stage(Aes128CbcStage::new(raw, key.iv_for(media_sequence)));
            }
            KeyMethod::Other => {
                return Err(DownloadError::crypto("unsupported encryption method"));
            }
        }
        for factory in post {
            pipeline = pipeline.add_boxed(factory());
        }
        Ok(pipeline)
    }

    pub fn process(&mut self, chunk: Bytes, output: &mut Output<'_>) -> Result<()> {
        process_inner(&mut self.stages, chunk, output)
    }

    pub fn finish(&mut self, output: &mut Output<'_>) -> Result<()> {
        finish_inner(&mut self.stages, output)
    }
}

fn process_inner(
    stages: &mut [Box<dyn SegmentStage>],
    data: Bytes,
    output: &mut Output<'_>,
) -> Result<()> {
    if let Some((first, rest)) = stages.split_first_mut() {
        let mut next = |data: Bytes| process_inner(rest, data, output);
        first.process(data, &mut next)
    } else if data.is_empty() {
        Ok(())
    } else {
        output(data)
    }
}

// A stage's flushed bytes still pass through every later stage before
// those stages are finished themselves.
fn finish_inner(stages: &mut [Box<dyn SegmentStage>], output: &mut Output<'_>) -> Result<()> {
    if let Some((first, rest)) = stages.split_first_mut() {
        {
            let mut next = |data: Bytes| process_inner(rest, data, output);
            first.finish(&mut next)?;
        }
        finish_inner(rest, output)
    } else {
        Ok(())
    }
}

/// Streaming AES-128-CBC decryption with PKCS#7 padding removal.
pub struct Aes128CbcStage {
    key: [u8; AES_BLOCK_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
    pending: BytesMut,
    received: u64,
}

impl Aes128CbcStage {
    pub fn new(key: [u8; AES_BLOCK_SIZE], iv: [u8; AES_BLOCK_SIZE]) -> Self {
        Self {
            key,
            iv,
            pending: BytesMut::new(),
            received: 0,
        }
    }

    fn decryptor(&self) -> Decryptor<Aes128> {
        Decryptor::<Aes128>::new((&self.key).into(), (&self.iv).into())
    }
}

impl SegmentStage for Aes128CbcStage {
    fn process(&mut self, chunk: Bytes, output: &mut Output<'_>) -> Result<()> {
        self.received += chunk.len() as u64;
        self.pending.extend_from_slice(&chunk);

        // Hold back 1..=16 bytes: the final block carries the padding.
        if self.pending.len() <= AES_BLOCK_SIZE {
            return Ok(());
        }
        let ready = (self.pending.len() - 1) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        let mut blocks = self.pending.split_to(ready);

        // CBC chaining: the next IV is the last ciphertext block of this run.
        let mut next_iv = [0u8; AES_BLOCK_SIZE];
        next_iv.copy_from_slice(&blocks[ready - AES_BLOCK_SIZE..]);

        self.decryptor()
            .decrypt_padded_mut::<NoPadding>(&mut blocks[..])
            .map_err(|e| DownloadError::crypto(format!("CBC decrypt failed: {e}")))?;
        self.iv = next_iv;

        trace!(bytes = ready, "Decrypted intermediate blocks");
        output(blocks.freeze())
    }

    fn finish(&mut self, output: &mut Output<'_>) -> Result<()> {
        if self.received == 0 {
            return Ok(());
        }
        if self.pending.len() != AES_BLOCK_SIZE {
            return Err(DownloadError::crypto(format!(
                "ciphertext of {} bytes is not a multiple of the AES block size",
                self.received
            )));
        }
        let mut last = std::mem::take(&mut self.pending);
        let plain_len = self
            .decryptor()
            .decrypt_padded_mut::<Pkcs7>(&mut last[..])
            .map_err(|e| DownloadError::crypto(format!("PKCS7 unpad failed: {e}")))?
            .len();
        last.truncate(plain_len);
        output(last.freeze())
    }

    fn name(&self) -> &'static str {
        "aes-128-cbc"
    }
}

enum StripState {
    Detecting(BytesMut),
    Passthrough,
}

/// Removes a foreign container header accidentally prepended to a media
/// segment, then resumes streaming from the first position where the sync
/// byte repeats at the packet period.
pub struct ForeignHeaderStripper {
    signature: &'static [u8],
    sync: u8,
    period: usize,
    window: usize,
    state: StripState,
}

impl ForeignHeaderStripper {
    pub fn new(signature: &'static [u8], sync: u8, period: usize, window: usize) -> Self {
        Self {
            signature,
            sync,
            period,
            window: window.max(period + 1),
            state: StripState::Detecting(BytesMut::new()),
        }
    }

    /// PNG header in front of an MPEG-TS stream.
    pub fn png_ts() -> Self {
        Self::new(&PNG_SIGNATURE, TS_SYNC_BYTE, TS_PACKET_SIZE, DEFAULT_LOOKAHEAD)
    }

    pub fn factory() -> StageFactory {
        Arc::new(|| Box::new(Self::png_ts()) as Box<dyn SegmentStage>)
    }

    fn find_sync(&self, buf: &[u8]) -> Option<usize> {
        let limit = buf.len().min(self.window);
        (0..limit.saturating_sub(self.period))
            .find(|&i| buf[i] == self.sync && buf[i + self.period] == self.sync)
    }

    /// Decide on the buffered prefix. `eof` forces a decision on short input.
    fn resolve(&mut self, eof: bool, output: &mut Output<'_>) -> Result<()> {
        let StripState::Detecting(buf) = &mut self.state else {
            return Ok(());
        };

        let probe = buf.len().min(self.signature.len());
        if buf[..probe] != self.signature[..probe] {
            let data = std::mem::take(buf).freeze();
            self.state = StripState::Passthrough;
            return output(data);
        }
        if buf.len() < self.signature.len() {
            if eof {
                let data = std::mem::take(buf).freeze();
                self.state = StripState::Passthrough;
                return output(data);
            }
            return Ok(());
        }
        if buf.len() < self.window && !eof {
            return Ok(());
        }

        let mut data = std::mem::take(buf);
        let offset = self.find_sync(&data).ok_or_else(|| {
            DownloadError::format(format!(
                "no sync byte 0x{:02X} at period {} within {} bytes",
                self.sync, self.period, self.window
            ))
        })?;
        debug!(offset, "Stripped foreign header");
        self.state = StripState::Passthrough;
        output(data.split_off(offset).freeze())
    }
}

impl SegmentStage for ForeignHeaderStripper {
    fn process(&mut self, chunk: Bytes, output: &mut Output<'_>) -> Result<()> {
        match &mut self.state {
            StripState::Passthrough => output(chunk),
            StripState::Detecting(buf) => {
                buf.extend_from_slice(&chunk);
                self.resolve(false, output)
            }
        }
    }

    fn finish(&mut self, output: &mut Output<'_>) -> Result<()> {
        let pending = matches!(&self.state, StripState::Detecting(buf) if !buf.is_empty());
        if pending {
            self.resolve(true, output)
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "foreign-header-stripper"
    }
}
