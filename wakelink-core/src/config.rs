//! Fixed pipeline constants and the runtime-tunable `PipelineConfig`.
//!
//! The audio format is fixed: 16 kHz, mono, 16-bit signed little-endian PCM,
//! cut into 60 ms frames. Everything that may reasonably differ between
//! deployments lives in [`PipelineConfig`].

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Pipeline sample rate (Hz).
pub const SAMPLE_RATE: u32 = 16_000;
/// Mono.
pub const CHANNELS: u16 = 1;
/// 16-bit signed samples.
pub const BITS_PER_SAMPLE: u16 = 16;
/// Frame interval: the unit of capture, detection submission and encoding.
pub const FRAME_DURATION_MS: u32 = 60;
/// 960 samples per frame at 16 kHz.
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;
/// 1920 bytes per frame (16-bit mono).
pub const BYTES_PER_FRAME: usize = SAMPLES_PER_FRAME * 2;
/// Capture buffer is this many times the device's minimum buffer size.
pub const CAPTURE_BUFFER_MULTIPLIER: usize = 4;
/// Largest encoded frame the encoder may produce.
pub const MAX_CODEC_FRAME_BYTES: usize = 4000;
/// Decoder output capacity in samples (120 ms at 16 kHz).
pub const DECODE_SAMPLE_CAPACITY: usize = 1920;
/// Feature dimension handed to the keyword engine's front-end.
pub const FEATURE_DIM: usize = 80;

pub const DEFAULT_KEYWORDS: &str = "x iǎo ān x iǎo ān";
pub const DEFAULT_THRESHOLD: f32 = 0.25;
pub const DEFAULT_KEYWORDS_SCORE: f32 = 1.5;

/// Default sleep while a blocking device call waits on a ring buffer.
const DEFAULT_DEVICE_POLL_MS: u64 = 5;

/// Heuristic decode guards.
///
/// These encode empirically observed bad frame patterns, not codec
/// invariants, so each can be switched off with `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DecodeGuards {
    /// Frames of exactly this length are always rejected.
    pub reject_len: Option<usize>,
    /// Frames of exactly this length must have a non-zero byte in their
    /// first four bytes (and must not be all-zero).
    pub header_check_len: Option<usize>,
}

impl Default for DecodeGuards {
    fn default() -> Self {
        Self {
            reject_len: Some(960),
            header_check_len: Some(120),
        }
    }
}

impl DecodeGuards {
    /// Guards that accept every non-empty frame.
    pub fn disabled() -> Self {
        Self {
            reject_len: None,
            header_check_len: None,
        }
    }
}

/// Runtime configuration for a [`WakelinkEngine`](crate::engine::WakelinkEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PipelineConfig {
    /// Keyword specification handed to the engine's `create_stream`.
    pub keywords: String,
    /// Detection threshold. Immutable inside the engine; changing it rebuilds it.
    pub threshold: f32,
    /// Per-keyword boosting score passed through to the engine.
    pub keywords_score: f32,
    /// Initial echo-canceller state (ignored when unavailable).
    pub aec_enabled: bool,
    /// Initial noise-suppressor state (ignored when unavailable).
    pub ns_enabled: bool,
    pub capture_buffer_multiplier: usize,
    /// Bounded detection channel capacity.
    pub detection_channel_capacity: usize,
    /// Broadcast capacity for encoded outbound frames.
    pub encoded_channel_capacity: usize,
    /// Frames queued between the capture thread and the encode worker.
    pub encode_queue_capacity: usize,
    pub decode_guards: DecodeGuards,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Safety margin (frames) for natural-completion polling.
    pub completion_margin_frames: u64,
    pub completion_settle_ms: u64,
    /// Silence written to the playback device during warm-up.
    pub warm_up_silence_bytes: usize,
    /// Number of discrete output volume steps for software volume.
    pub volume_steps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.into(),
            threshold: DEFAULT_THRESHOLD,
            keywords_score: DEFAULT_KEYWORDS_SCORE,
            aec_enabled: true,
            ns_enabled: true,
            capture_buffer_multiplier: CAPTURE_BUFFER_MULTIPLIER,
            detection_channel_capacity: 32,
            encoded_channel_capacity: 64,
            encode_queue_capacity: 8,
            decode_guards: DecodeGuards::default(),
            preferred_input_device: None,
            preferred_output_device: None,
            completion_margin_frames: 100,
            completion_settle_ms: 50,
            warm_up_silence_bytes: 1024,
            volume_steps: 15,
        }
    }
}

impl PipelineConfig {
    /// Clamp every field into its supported range.
    pub fn normalize(&mut self) {
        self.keywords = self.keywords.trim().to_string();
        if self.keywords.is_empty() {
            self.keywords = DEFAULT_KEYWORDS.into();
        }
        self.threshold = clamp_threshold(self.threshold);
        self.keywords_score = self.keywords_score.clamp(0.1, 10.0);
        self.capture_buffer_multiplier = self.capture_buffer_multiplier.clamp(1, 16);
        self.detection_channel_capacity = self.detection_channel_capacity.clamp(1, 1024);
        self.encoded_channel_capacity = self.encoded_channel_capacity.clamp(1, 4096);
        self.encode_queue_capacity = self.encode_queue_capacity.clamp(1, 256);
        self.completion_settle_ms = self.completion_settle_ms.min(1_000);
        // Keep warm-up silence sample-aligned.
        self.warm_up_silence_bytes = (self.warm_up_silence_bytes.min(BYTES_PER_FRAME * 4)) & !1;
        self.volume_steps = self.volume_steps.clamp(1, 100);
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device_name(self.preferred_output_device.take());
    }
}

pub fn clamp_threshold(value: f32) -> f32 {
    if value.is_nan() {
        return DEFAULT_THRESHOLD;
    }
    value.clamp(0.01, 0.99)
}

fn normalize_device_name(name: Option<String>) -> Option<String> {
    name.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

/// How long blocking device calls sleep while waiting on a ring.
///
/// Overridable with `WAKELINK_DEVICE_POLL_MS` (clamped to 1..=20).
pub fn device_poll_ms() -> u64 {
    static DEVICE_POLL_MS: OnceLock<u64> = OnceLock::new();
    *DEVICE_POLL_MS.get_or_init(|| {
        std::env::var("WAKELINK_DEVICE_POLL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_DEVICE_POLL_MS)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_constants_match_fixed_format() {
        assert_eq!(SAMPLES_PER_FRAME, 960);
        assert_eq!(BYTES_PER_FRAME, 1920);
    }

    #[test]
    fn normalize_clamps_and_fills_defaults() {
        let mut cfg = PipelineConfig {
            keywords: "   ".into(),
            threshold: 4.0,
            capture_buffer_multiplier: 0,
            warm_up_silence_bytes: 1023,
            preferred_input_device: Some("  ".into()),
            ..PipelineConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.keywords, DEFAULT_KEYWORDS);
        assert!((cfg.threshold - 0.99).abs() < f32::EPSILON);
        assert_eq!(cfg.capture_buffer_multiplier, 1);
        assert_eq!(cfg.warm_up_silence_bytes, 1022);
        assert!(cfg.preferred_input_device.is_none());
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"threshold":0.4,"decodeGuards":{"rejectLen":null}}"#)
                .expect("parse config");
        assert!((cfg.threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(cfg.decode_guards.reject_len, None);
        assert_eq!(cfg.decode_guards.header_check_len, Some(120));
        assert_eq!(cfg.keywords, DEFAULT_KEYWORDS);
    }

    #[test]
    fn nan_threshold_falls_back_to_default() {
        assert!((clamp_threshold(f32::NAN) - DEFAULT_THRESHOLD).abs() < f32::EPSILON);
    }
}
