//! File-backed devices: capture from a 16 kHz mono WAV, play into one.
//!
//! Used by the CLI `loopback` command and by headless hosts with no sound
//! card. The capture device reports `is_recording() == false` once the file is
//! exhausted, which ends the capture loop the same way a device stop does.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        AudioSession, CaptureBackend, CaptureDevice, DevicePlayState, Direction,
        PermissionState, PlaybackBackend, PlaybackDevice, SessionIds,
    },
    buffering::frame::le_bytes_to_samples,
    config::{BITS_PER_SAMPLE, BYTES_PER_FRAME, CHANNELS, SAMPLE_RATE},
    error::{Result, WakelinkError},
};

fn pipeline_spec() -> WavSpec {
    WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    }
}

/// Streams a WAV file as if it were a microphone.
pub struct WavCaptureBackend {
    path: PathBuf,
    /// Sleep for the duration of each read, pacing the file at real time.
    realtime: bool,
    ids: SessionIds,
}

impl WavCaptureBackend {
    pub fn new(path: impl Into<PathBuf>, realtime: bool) -> Self {
        Self {
            path: path.into(),
            realtime,
            ids: SessionIds::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureBackend for WavCaptureBackend {
    fn record_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    fn min_buffer_size(&self) -> Result<usize> {
        Ok(BYTES_PER_FRAME)
    }

    fn open(&self, _buffer_size: usize) -> Result<Box<dyn CaptureDevice>> {
        let reader = WavReader::open(&self.path)
            .map_err(|e| WakelinkError::DeviceInit(format!("{}: {e}", self.path.display())))?;
        let spec = reader.spec();
        if spec != pipeline_spec() {
            return Err(WakelinkError::DeviceInit(format!(
                "{} is {} Hz / {} ch / {} bit, expected 16000 Hz mono 16-bit",
                self.path.display(),
                spec.sample_rate,
                spec.channels,
                spec.bits_per_sample
            )));
        }
        info!(
            path = %self.path.display(),
            samples = reader.len(),
            "opened WAV capture source"
        );
        Ok(Box::new(WavCaptureDevice {
            reader,
            realtime: self.realtime,
            recording: false,
            exhausted: false,
            session: AudioSession::new(self.ids.next(), Direction::Capture),
        }))
    }
}

pub struct WavCaptureDevice {
    reader: WavReader<BufReader<File>>,
    realtime: bool,
    recording: bool,
    exhausted: bool,
    session: AudioSession,
}

impl CaptureDevice for WavCaptureDevice {
    fn session(&self) -> &AudioSession {
        &self.session
    }

    fn start(&mut self) -> Result<()> {
        self.recording = !self.exhausted;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let wanted = buf.len() / 2;
        let mut written = 0;
        for (dst, sample) in buf
            .chunks_exact_mut(2)
            .zip(self.reader.samples::<i16>().take(wanted))
        {
            dst.copy_from_slice(&sample?.to_le_bytes());
            written += 1;
        }

        if written < wanted {
            self.exhausted = true;
            self.recording = false;
            debug!(session_id = self.session.session_id, "WAV capture source exhausted");
        }
        if self.realtime && written > 0 {
            thread::sleep(Duration::from_micros(
                written as u64 * 1_000_000 / SAMPLE_RATE as u64,
            ));
        }
        Ok(written * 2)
    }

    fn stop(&mut self) -> Result<()> {
        self.recording = false;
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }
}

/// Writes played audio into a WAV file. Each `open` truncates the file.
pub struct WavPlaybackBackend {
    path: PathBuf,
    ids: SessionIds,
    volume_index: Arc<AtomicU32>,
    volume_steps: u32,
}

impl WavPlaybackBackend {
    pub fn new(path: impl Into<PathBuf>, volume_steps: u32) -> Self {
        let volume_steps = volume_steps.max(1);
        Self {
            path: path.into(),
            ids: SessionIds::default(),
            volume_index: Arc::new(AtomicU32::new(volume_steps)),
            volume_steps,
        }
    }
}

impl PlaybackBackend for WavPlaybackBackend {
    fn min_buffer_size(&self) -> Result<usize> {
        Ok(BYTES_PER_FRAME)
    }

    fn open(&self, buffer_size: usize) -> Result<Box<dyn PlaybackDevice>> {
        let writer = WavWriter::create(&self.path, pipeline_spec())
            .map_err(|e| WakelinkError::DeviceInit(format!("{}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), "opened WAV playback sink");
        Ok(Box::new(WavPlaybackDevice {
            writer: Some(writer),
            playing: false,
            frames_written: 0,
            buffer_frames: (buffer_size / 2) as u64,
            volume_index: Arc::clone(&self.volume_index),
            volume_steps: self.volume_steps,
            session: AudioSession::new(self.ids.next(), Direction::Playback),
        }))
    }

    fn max_volume_index(&self) -> u32 {
        self.volume_steps
    }

    fn volume_index(&self) -> Result<u32> {
        Ok(self.volume_index.load(Ordering::Relaxed))
    }

    fn set_volume_index(&self, index: u32) -> Result<()> {
        self.volume_index
            .store(index.min(self.volume_steps), Ordering::Relaxed);
        Ok(())
    }
}

/// A file sink: every written frame is "rendered" as soon as it is written.
pub struct WavPlaybackDevice {
    writer: Option<WavWriter<BufWriter<File>>>,
    playing: bool,
    frames_written: u64,
    buffer_frames: u64,
    volume_index: Arc<AtomicU32>,
    volume_steps: u32,
    session: AudioSession,
}

impl PlaybackDevice for WavPlaybackDevice {
    fn session(&self) -> &AudioSession {
        &self.session
    }

    fn play(&mut self) -> Result<()> {
        self.playing = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.playing = false;
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn play_state(&self) -> DevicePlayState {
        if self.playing {
            DevicePlayState::Playing
        } else {
            DevicePlayState::Stopped
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| WakelinkError::AudioDevice("WAV sink already finalized".into()))?;
        let gain = self.volume_index.load(Ordering::Relaxed) as f32 / self.volume_steps as f32;
        let samples = le_bytes_to_samples(pcm);
        for sample in &samples {
            writer.write_sample((*sample as f32 * gain) as i16)?;
        }
        self.frames_written += samples.len() as u64;
        Ok(samples.len() * 2)
    }

    fn playback_head_position(&self) -> u64 {
        self.frames_written
    }

    fn buffer_size_frames(&self) -> u64 {
        self.buffer_frames
    }
}

impl Drop for WavPlaybackDevice {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("failed to finalize WAV sink: {e}");
            }
        }
    }
}
