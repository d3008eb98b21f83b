//! # wakelink-core
//!
//! Real-time audio pipeline for a voice-assistant client: microphone capture,
//! streaming keyword spotting, Opus transcoding in both directions and
//! playback of decoded audio.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureDevice → capture thread (60 ms PcmFrame, AEC → NS)
//!                                   ├─► DetectorBridge ──► crossbeam<DetectionEvent>
//!                                   └─► encode queue ──► Transcoder::encode ──► broadcast<CodecFrame>
//!
//! CodecFrame ──► play_encoded_frame (spawn_blocking)
//!                   └─► Transcoder::decode_checked ──► PlaybackEngine::write ──► Speaker
//! ```
//!
//! Every device operation runs off the async runtime, and every device open,
//! close or reinit goes through one device lock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod detector;
pub mod effects;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;

// Convenience re-exports for downstream crates
pub use buffering::frame::PcmFrame;
pub use codec::{CodecFrame, Transcoder};
pub use config::{DecodeGuards, PipelineConfig};
pub use detector::{KeywordSpotter, SpotterFactory, StubSpotterFactory};
pub use effects::{EffectKind, EffectsStatus};
pub use engine::{pipeline::DiagnosticsSnapshot, EngineBackends, WakelinkEngine};
pub use error::{ErrorKind, Result, WakelinkError};
pub use ipc::events::{DetectionEvent, PipelineStatus, PipelineStatusEvent};
pub use playback::PlaybackState;
