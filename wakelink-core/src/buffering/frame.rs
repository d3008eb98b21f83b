//! `PcmFrame` — one frame interval of 16-bit mono PCM.

use crate::config::{SAMPLES_PER_FRAME, SAMPLE_RATE};

/// Ordered 16-bit signed samples for (nominally) one 60 ms frame.
///
/// Produced by the capture loop for every successful read and consumed
/// immediately by the detector and the encoder. A short read yields a short
/// frame; consumers decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    samples: Vec<i16>,
}

impl PcmFrame {
    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Interpret `bytes` as little-endian i16. A trailing odd byte is dropped.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        Self {
            samples: le_bytes_to_samples(bytes),
        }
    }

    /// A full frame of digital silence.
    pub fn silence() -> Self {
        Self {
            samples: vec![0; SAMPLES_PER_FRAME],
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        samples_to_le_bytes(&self.samples)
    }

    /// Samples scaled to [-1.0, 1.0) as `sample / 32768.0`.
    pub fn to_normalized(&self) -> Vec<f32> {
        normalize_samples(&self.samples)
    }

    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 * 1000.0 / SAMPLE_RATE as f64
    }
}

pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

pub fn normalize_samples(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Inverse of [`normalize_samples`], saturating at the i16 range.
pub fn denormalize_sample(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parses_little_endian_and_drops_odd_byte() {
        let frame = PcmFrame::from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x7f]);
        assert_eq!(frame.samples(), &[1, -1]);
    }

    #[test]
    fn normalizes_by_32768() {
        let frame = PcmFrame::from_samples(vec![i16::MIN, 0, 16_384]);
        let norm = frame.to_normalized();
        assert_relative_eq!(norm[0], -1.0);
        assert_relative_eq!(norm[1], 0.0);
        assert_relative_eq!(norm[2], 0.5);
    }

    #[test]
    fn denormalize_saturates() {
        assert_eq!(denormalize_sample(2.0), i16::MAX);
        assert_eq!(denormalize_sample(-2.0), i16::MIN);
        assert_eq!(denormalize_sample(0.5), 16_384);
    }

    #[test]
    fn silence_is_one_full_frame() {
        let frame = PcmFrame::silence();
        assert_eq!(frame.len(), SAMPLES_PER_FRAME);
        assert_eq!(frame.to_le_bytes().len(), 1920);
        assert_relative_eq!(frame.duration_ms(), 60.0);
    }
}
