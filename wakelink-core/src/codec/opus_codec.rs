//! Opus at 16 kHz mono, VoIP application mode.

use opus::{Application, Channels, Decoder, Encoder};

use super::{CodecBackend, FrameDecoder, FrameEncoder};
use crate::{
    config::SAMPLE_RATE,
    error::{Result, WakelinkError},
};

fn codec_err(e: opus::Error) -> WakelinkError {
    WakelinkError::Codec(e.to_string())
}

#[derive(Debug, Clone)]
pub struct OpusBackend {
    application: Application,
}

impl Default for OpusBackend {
    fn default() -> Self {
        Self {
            application: Application::Voip,
        }
    }
}

impl OpusBackend {
    pub fn with_application(application: Application) -> Self {
        Self { application }
    }
}

impl CodecBackend for OpusBackend {
    fn name(&self) -> &'static str {
        "opus"
    }

    fn create_encoder(&self) -> Result<Box<dyn FrameEncoder>> {
        let inner =
            Encoder::new(SAMPLE_RATE, Channels::Mono, self.application).map_err(codec_err)?;
        Ok(Box::new(OpusFrameEncoder { inner }))
    }

    fn create_decoder(&self) -> Result<Box<dyn FrameDecoder>> {
        let inner = Decoder::new(SAMPLE_RATE, Channels::Mono).map_err(codec_err)?;
        Ok(Box::new(OpusFrameDecoder { inner }))
    }
}

pub struct OpusFrameEncoder {
    inner: Encoder,
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        self.inner.encode(pcm, out).map_err(codec_err)
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset_state().map_err(codec_err)
    }
}

pub struct OpusFrameDecoder {
    inner: Decoder,
}

impl FrameDecoder for OpusFrameDecoder {
    /// Best-effort decode: in-band FEC is not requested, so a damaged packet
    /// is concealed rather than failing the call.
    fn decode(&mut self, frame: &[u8], out: &mut [i16]) -> Result<usize> {
        self.inner.decode(frame, out, false).map_err(codec_err)
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset_state().map_err(codec_err)
    }
}
