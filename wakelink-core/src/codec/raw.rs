//! Uncompressed passthrough codec: frames are the PCM bytes themselves.
//!
//! Used when the build has no Opus support, and handy for loopback tests
//! where the decoded signal must match the input exactly.

use super::{CodecBackend, FrameDecoder, FrameEncoder};
use crate::error::{Result, WakelinkError};

#[derive(Debug, Default, Clone, Copy)]
pub struct RawBackend;

impl CodecBackend for RawBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn create_encoder(&self) -> Result<Box<dyn FrameEncoder>> {
        Ok(Box::new(RawCodec))
    }

    fn create_decoder(&self) -> Result<Box<dyn FrameDecoder>> {
        Ok(Box::new(RawCodec))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl FrameEncoder for RawCodec {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let needed = pcm.len() * 2;
        if needed > out.len() {
            return Err(WakelinkError::Codec(format!(
                "raw frame needs {needed} bytes, buffer holds {}",
                out.len()
            )));
        }
        for (dst, s) in out.chunks_exact_mut(2).zip(pcm) {
            dst.copy_from_slice(&s.to_le_bytes());
        }
        Ok(needed)
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FrameDecoder for RawCodec {
    fn decode(&mut self, frame: &[u8], out: &mut [i16]) -> Result<usize> {
        let mut n = 0;
        for (dst, pair) in out.iter_mut().zip(frame.chunks_exact(2)) {
            *dst = i16::from_le_bytes([pair[0], pair[1]]);
            n += 1;
        }
        Ok(n)
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip_preserves_samples() {
        let mut codec = RawCodec;
        let mut bytes = [0u8; 8];
        assert_eq!(codec.encode(&[1, -2, 300, i16::MIN], &mut bytes).unwrap(), 8);
        let mut samples = [0i16; 4];
        assert_eq!(codec.decode(&bytes, &mut samples).unwrap(), 4);
        assert_eq!(samples, [1, -2, 300, i16::MIN]);
    }

    #[test]
    fn raw_encode_rejects_small_buffer() {
        let mut out = [0u8; 2];
        assert!(RawCodec.encode(&[1, 2], &mut out).is_err());
    }
}
