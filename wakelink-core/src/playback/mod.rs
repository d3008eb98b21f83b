//! Playback engine: owns the output device.
//!
//! ```text
//! Idle ──open()/first write──► WarmingUp ──write()──► Playing ──stop()──► Stopped
//!   ▲                             │ warm_up(): 1024 B silence + device play      │
//!   └───────────────────────── release() ◄──────────────────────────────────────┘
//! ```
//!
//! Writes never stop the device afterwards; the stream keeps draining on its
//! own. Every method assumes the caller holds the device lock.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    audio::{DevicePlayState, PlaybackBackend, PlaybackDevice},
    config::PipelineConfig,
    error::Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackState {
    /// No device open.
    Idle,
    /// Device open (and possibly primed), no real audio written yet.
    WarmingUp,
    Playing,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackSettings {
    pub warm_up_silence_bytes: usize,
    pub completion_margin_frames: u64,
    pub completion_settle_ms: u64,
}

impl From<&PipelineConfig> for PlaybackSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            warm_up_silence_bytes: config.warm_up_silence_bytes,
            completion_margin_frames: config.completion_margin_frames,
            completion_settle_ms: config.completion_settle_ms,
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

pub struct PlaybackEngine {
    backend: Arc<dyn PlaybackBackend>,
    device: Option<Box<dyn PlaybackDevice>>,
    state: PlaybackState,
    settings: PlaybackSettings,
}

impl PlaybackEngine {
    pub fn new(backend: Arc<dyn PlaybackBackend>, settings: PlaybackSettings) -> Self {
        Self {
            backend,
            device: None,
            state: PlaybackState::Idle,
            settings,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// Open the output device if it is not open yet.
    pub fn open(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let buffer_size = self.backend.min_buffer_size()?;
        let device = self.backend.open(buffer_size)?;
        info!(
            session_id = device.session().session_id,
            buffer_size, "playback device opened"
        );
        self.device = Some(device);
        self.state = PlaybackState::WarmingUp;
        Ok(())
    }

    /// Prime the device with silence and start it, unless it is already
    /// playing. Returns whether silence was written.
    pub fn warm_up(&mut self) -> Result<bool> {
        self.open()?;
        let silence = vec![0u8; self.settings.warm_up_silence_bytes];
        let Some(device) = self.device.as_mut() else {
            return Ok(false);
        };
        if device.play_state() == DevicePlayState::Playing {
            return Ok(false);
        }
        if !silence.is_empty() {
            device.write(&silence)?;
        }
        device.play()?;
        debug!(bytes = silence.len(), "playback warmed up");
        Ok(true)
    }

    /// Blocking write of one PCM chunk, opening the device on first use.
    pub fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        self.open()?;
        let Some(device) = self.device.as_mut() else {
            return Ok(0);
        };
        if self.state != PlaybackState::Playing {
            if device.play_state() != DevicePlayState::Playing {
                device.play()?;
            }
            self.state = PlaybackState::Playing;
        }
        device.write(pcm)
    }

    /// Stop the device, keeping it open.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(device) = self.device.as_mut() {
            device.stop()?;
            self.state = PlaybackState::Stopped;
            debug!("playback stopped");
        }
        Ok(())
    }

    /// Best-effort natural-completion check.
    ///
    /// When the head is within the margin of the buffer size, waits the settle
    /// time and reports completion only if the device has stopped by then.
    /// False negatives are expected.
    pub fn check_finished(&mut self) -> bool {
        if self.state != PlaybackState::Playing {
            return false;
        }
        let Some(device) = self.device.as_ref() else {
            return false;
        };
        let head = device.playback_head_position();
        let capacity = device.buffer_size_frames();
        if head < capacity.saturating_sub(self.settings.completion_margin_frames) {
            return false;
        }
        thread::sleep(Duration::from_millis(self.settings.completion_settle_ms));
        if device.play_state() == DevicePlayState::Stopped {
            self.state = PlaybackState::Stopped;
            debug!(head, capacity, "playback finished naturally");
            return true;
        }
        false
    }

    /// Close the device. Idempotent.
    pub fn release(&mut self) {
        if let Some(device) = self.device.take() {
            debug!(session_id = device.session().session_id, "playback device released");
        }
        self.state = PlaybackState::Idle;
    }

    /// Close and reopen the device.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.release();
        self.open()
    }

    /// Set the shared output volume from a 0.0..=1.0 level.
    pub fn set_volume(&self, level: f32) -> Result<()> {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        let max = self.backend.max_volume_index();
        let index = (level * max as f32).round() as u32;
        self.backend.set_volume_index(index.min(max))?;
        debug!(level, index, max, "volume set");
        Ok(())
    }

    pub fn volume(&self) -> Result<f32> {
        let max = self.backend.max_volume_index();
        if max == 0 {
            return Ok(0.0);
        }
        Ok(self.backend.volume_index()? as f32 / max as f32)
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.release();
    }
}
