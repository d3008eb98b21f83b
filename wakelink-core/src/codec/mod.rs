//! Fixed-frame codec transcoding.
//!
//! ```text
//! PCM bytes ──encode()──► pad/truncate to 960 samples ──► CodecFrame (≤ 4000 B)
//! CodecFrame ──decode()──► guards ──► decoder (history kept) ──► ≤ 1920 samples
//! ```
//!
//! Encoder and decoder each sit behind their own mutex; the decoder mutex is
//! the decoder lock. Decoder state is only reset by [`Transcoder::reinitialize`].
//! Per-frame failures never propagate: they come back as `None` and are
//! counted by the caller.

#[cfg(feature = "codec-opus")]
pub mod opus_codec;
pub mod raw;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    buffering::frame::{le_bytes_to_samples, PcmFrame},
    config::{
        DecodeGuards, BYTES_PER_FRAME, DECODE_SAMPLE_CAPACITY, MAX_CODEC_FRAME_BYTES,
        SAMPLES_PER_FRAME, SAMPLE_RATE,
    },
    error::{Result, WakelinkError},
};

/// One encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecFrame {
    data: Vec<u8>,
}

impl CodecFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for CodecFrame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

pub trait FrameEncoder: Send {
    /// Encode exactly one frame of samples into `out`; returns bytes written.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;

    fn reset(&mut self) -> Result<()>;
}

pub trait FrameDecoder: Send {
    /// Decode one frame into `out`; returns samples written.
    fn decode(&mut self, frame: &[u8], out: &mut [i16]) -> Result<usize>;

    fn reset(&mut self) -> Result<()>;
}

/// Creates matched encoder/decoder instances.
pub trait CodecBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn create_encoder(&self) -> Result<Box<dyn FrameEncoder>>;

    fn create_decoder(&self) -> Result<Box<dyn FrameDecoder>>;
}

/// The codec compiled into this build: Opus when available, otherwise raw PCM.
pub fn default_backend() -> Arc<dyn CodecBackend> {
    #[cfg(feature = "codec-opus")]
    {
        Arc::new(opus_codec::OpusBackend::default())
    }
    #[cfg(not(feature = "codec-opus"))]
    {
        Arc::new(raw::RawBackend)
    }
}

/// Result of the pre-decode checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    Accept,
    Empty,
    /// Matched the always-rejected length.
    RejectedLength,
    /// Matched the header-checked length with an all-zero header or body.
    RejectedHeader,
}

/// Apply the heuristic decode guards to an incoming frame.
pub fn validate_frame(frame: &[u8], guards: &DecodeGuards) -> FrameVerdict {
    if frame.is_empty() {
        return FrameVerdict::Empty;
    }
    if guards.reject_len == Some(frame.len()) {
        return FrameVerdict::RejectedLength;
    }
    if guards.header_check_len == Some(frame.len()) {
        let header_ok = frame.iter().take(4).any(|&b| b != 0);
        let body_ok = frame.iter().any(|&b| b != 0);
        if !(header_ok && body_ok) {
            return FrameVerdict::RejectedHeader;
        }
    }
    FrameVerdict::Accept
}

/// What happened to one decode request.
#[derive(Debug)]
pub enum DecodeOutcome {
    Decoded(PcmFrame),
    Rejected(FrameVerdict),
    /// The decoder produced zero samples.
    NoOutput,
    Failed(WakelinkError),
}

impl DecodeOutcome {
    pub fn into_frame(self) -> Option<PcmFrame> {
        match self {
            DecodeOutcome::Decoded(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Stateful encoder/decoder pair for the fixed 16 kHz / 60 ms format.
pub struct Transcoder {
    backend: Arc<dyn CodecBackend>,
    encoder: Mutex<Box<dyn FrameEncoder>>,
    decoder: Mutex<Box<dyn FrameDecoder>>,
    guards: DecodeGuards,
}

impl Transcoder {
    pub fn new(backend: Arc<dyn CodecBackend>, guards: DecodeGuards) -> Result<Self> {
        let encoder = backend.create_encoder()?;
        let decoder = backend.create_decoder()?;
        info!(codec = backend.name(), "transcoder created");
        Ok(Self {
            backend,
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            guards,
        })
    }

    pub fn codec_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn guards(&self) -> &DecodeGuards {
        &self.guards
    }

    /// Encode little-endian PCM bytes as one frame.
    ///
    /// Short input is zero-padded to 960 samples, long input truncated.
    /// Returns `Ok(None)` for empty input or a zero-length encode.
    pub fn try_encode(&self, pcm: &[u8]) -> Result<Option<CodecFrame>> {
        let mut samples = le_bytes_to_samples(pcm);
        if samples.is_empty() {
            return Ok(None);
        }
        if samples.len() != SAMPLES_PER_FRAME {
            debug!(samples = samples.len(), "normalising frame length");
            samples.resize(SAMPLES_PER_FRAME, 0);
        }

        let mut out = vec![0u8; MAX_CODEC_FRAME_BYTES];
        let written = self.encoder.lock().encode(&samples, &mut out)?;
        if written == 0 {
            return Ok(None);
        }
        out.truncate(written.min(MAX_CODEC_FRAME_BYTES));
        Ok(Some(CodecFrame::new(out)))
    }

    /// [`try_encode`](Self::try_encode) with errors logged and mapped to `None`.
    pub fn encode(&self, pcm: &[u8]) -> Option<CodecFrame> {
        match self.try_encode(pcm) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(bytes = pcm.len(), "encode failed: {e}");
                None
            }
        }
    }

    /// Validate and decode one frame under the decoder lock.
    pub fn decode_checked(&self, frame: &[u8]) -> DecodeOutcome {
        let verdict = validate_frame(frame, &self.guards);
        if verdict != FrameVerdict::Accept {
            debug!(bytes = frame.len(), ?verdict, "frame rejected before decode");
            return DecodeOutcome::Rejected(verdict);
        }

        let mut out = vec![0i16; DECODE_SAMPLE_CAPACITY];
        let decoded = self.decoder.lock().decode(frame, &mut out);
        match decoded {
            Ok(0) => DecodeOutcome::NoOutput,
            Ok(n) => {
                out.truncate(n.min(DECODE_SAMPLE_CAPACITY));
                DecodeOutcome::Decoded(PcmFrame::from_samples(out))
            }
            Err(e) => {
                warn!(bytes = frame.len(), "decode failed: {e}");
                DecodeOutcome::Failed(e)
            }
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Option<PcmFrame> {
        self.decode_checked(frame).into_frame()
    }

    /// Recreate encoder and decoder, discarding their history.
    pub fn reinitialize(&self) -> Result<()> {
        let encoder = self.backend.create_encoder()?;
        let decoder = self.backend.create_decoder()?;
        *self.encoder.lock() = encoder;
        *self.decoder.lock() = decoder;
        info!(codec = self.backend.name(), "transcoder reinitialized");
        Ok(())
    }

    /// Round-trip one second of silence through a fresh encoder/decoder pair.
    ///
    /// Uses its own codec instances so live decoder history is untouched.
    pub fn self_test(&self) -> Result<SelfTestReport> {
        let mut encoder = self.backend.create_encoder()?;
        let mut decoder = self.backend.create_decoder()?;
        let silence = vec![0u8; SAMPLE_RATE as usize * 2];

        let mut report = SelfTestReport {
            codec: self.backend.name(),
            ..SelfTestReport::default()
        };
        let mut encoded = vec![0u8; MAX_CODEC_FRAME_BYTES];
        let mut decoded = vec![0i16; DECODE_SAMPLE_CAPACITY];
        for chunk in silence.chunks(BYTES_PER_FRAME) {
            let mut samples = le_bytes_to_samples(chunk);
            samples.resize(SAMPLES_PER_FRAME, 0);
            let written = encoder.encode(&samples, &mut encoded)?;
            if written == 0 {
                return Err(WakelinkError::Codec("self-test encode produced no data".into()));
            }
            report.frames += 1;
            report.encoded_bytes += written;
            report.decoded_samples += decoder.decode(&encoded[..written], &mut decoded)?;
        }
        if report.decoded_samples == 0 {
            return Err(WakelinkError::Codec("self-test decode produced no samples".into()));
        }
        info!(
            codec = report.codec,
            frames = report.frames,
            encoded_bytes = report.encoded_bytes,
            decoded_samples = report.decoded_samples,
            "codec self-test passed"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfTestReport {
    pub codec: &'static str,
    pub frames: usize,
    pub encoded_bytes: usize,
    pub decoded_samples: usize,
}
