//! Audio device abstraction.
//!
//! The pipeline talks to microphones and speakers through four traits:
//!
//! ```text
//! CaptureBackend  ──open()──►  CaptureDevice   (blocking read, owned by the capture thread)
//! PlaybackBackend ──open()──►  PlaybackDevice  (blocking write, guarded by the device lock)
//! ```
//!
//! Backends are long-lived and shared (`Send + Sync`); devices are the
//! per-open bindings and release the hardware when dropped.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `CaptureDevice` therefore carries no `Send` bound: it is opened,
//! read and dropped on the capture thread. `PlaybackDevice` is written from the
//! blocking pool, so the cpal implementation parks its stream on a dedicated
//! thread and only shares the ring producer.

#[cfg(feature = "audio-cpal")]
pub mod cpal_backend;
pub mod device;
pub mod resample;
pub mod wav;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};
use crate::error::Result;

/// Serialises device open, reinit and close across capture and playback.
pub type DeviceLock = Arc<Mutex<()>>;

/// Direction of a device binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Capture,
    Playback,
}

/// One open device binding.
///
/// The format fields are fixed for this pipeline; `session_id` is assigned by
/// the backend and correlates a capture stream with its effect processors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSession {
    pub session_id: i32,
    pub direction: Direction,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioSession {
    pub fn new(session_id: i32, direction: Direction) -> Self {
        Self {
            session_id,
            direction,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
        }
    }
}

/// Hands out backend-local session identifiers, starting at 1.
#[derive(Debug, Default)]
pub struct SessionIds(AtomicI32);

impl SessionIds {
    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Runtime record-permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    /// The platform has no runtime grant for microphones.
    NotRequired,
}

impl PermissionState {
    pub fn allows_capture(self) -> bool {
        !matches!(self, PermissionState::Denied)
    }
}

/// Factory for capture devices.
pub trait CaptureBackend: Send + Sync + 'static {
    fn record_permission(&self) -> PermissionState;

    /// Smallest device buffer (bytes of 16 kHz mono i16) that can hold the
    /// stream without overruns.
    fn min_buffer_size(&self) -> Result<usize>;

    /// Open the input device with a capture buffer of `buffer_size` bytes.
    ///
    /// Called from the capture thread; the returned device never leaves it.
    fn open(&self, buffer_size: usize) -> Result<Box<dyn CaptureDevice>>;
}

/// An open input device delivering 16 kHz mono i16 little-endian bytes.
pub trait CaptureDevice {
    fn session(&self) -> &AudioSession;

    fn start(&mut self) -> Result<()>;

    /// Blocking read of up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means nothing arrived within the device's wait window; the
    /// implementation must already have slept rather than spun.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn stop(&mut self) -> Result<()>;

    fn is_recording(&self) -> bool;
}

/// Device-level play state, as reported by the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlayState {
    Stopped,
    Playing,
}

/// Factory for playback devices plus the shared output volume.
pub trait PlaybackBackend: Send + Sync + 'static {
    fn min_buffer_size(&self) -> Result<usize>;

    fn open(&self, buffer_size: usize) -> Result<Box<dyn PlaybackDevice>>;

    /// Highest index on the shared output-stream volume scale.
    fn max_volume_index(&self) -> u32;

    fn volume_index(&self) -> Result<u32>;

    fn set_volume_index(&self, index: u32) -> Result<()>;
}

/// An open output device accepting 16 kHz mono i16 little-endian bytes.
pub trait PlaybackDevice: Send {
    fn session(&self) -> &AudioSession;

    fn play(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn play_state(&self) -> DevicePlayState;

    /// Blocking write. Returns the number of bytes accepted.
    fn write(&mut self, pcm: &[u8]) -> Result<usize>;

    /// Frames (samples, mono) the device has rendered since it was opened.
    fn playback_head_position(&self) -> u64;

    /// Device buffer capacity in frames.
    fn buffer_size_frames(&self) -> u64;
}
