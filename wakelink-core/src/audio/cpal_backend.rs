//! cpal-backed capture and playback devices.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They only
//! downmix/upmix and move f32 samples through a lock-free SPSC ring; rate
//! conversion to and from the 16 kHz pipeline happens in the blocking
//! `read`/`write` calls on the caller's thread.
//!
//! Capture: `open()` builds the stream on the calling (capture) thread and the
//! device never leaves it.
//!
//! Playback: the output stream is built and parked on a dedicated thread so the
//! `PlaybackDevice` itself stays `Send`; dropping the device signals that thread
//! to drop the stream.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedBufferSize,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        resample::RateConverter, AudioSession, CaptureBackend, CaptureDevice, DevicePlayState,
        Direction, PermissionState, PlaybackBackend, PlaybackDevice, SessionIds,
    },
    buffering::{
        create_sample_ring,
        frame::{denormalize_sample, le_bytes_to_samples},
        Consumer, Observer, Producer, SampleConsumer, SampleProducer,
    },
    config::{device_poll_ms, BYTES_PER_FRAME, FRAME_DURATION_MS, SAMPLE_RATE},
    error::{Result, WakelinkError},
};

/// Longest a capture read waits for samples before returning `Ok(0)`.
const READ_WAIT: Duration = Duration::from_millis(4 * FRAME_DURATION_MS as u64);

/// A playback write that makes no progress for this long fails.
const WRITE_STALL: Duration = Duration::from_secs(2);

fn select_input_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("preferred input device '{preferred_name}' not found, falling back");
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| WakelinkError::DeviceInit(e.to_string()))?;
    let fallback = devices.next().ok_or(WakelinkError::NoDefaultInputDevice)?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

fn select_output_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(preferred_name) = preferred {
        if let Ok(mut devices) = host.output_devices() {
            if let Some(device) =
                devices.find(|d| d.name().map(|n| n == preferred_name).unwrap_or(false))
            {
                return Ok(device);
            }
        }
        warn!("preferred output device '{preferred_name}' not found, falling back");
    }
    host.default_output_device()
        .ok_or(WakelinkError::NoDefaultOutputDevice)
}

/// Bytes of 16 kHz mono i16 equivalent to `device_frames` at `device_rate`.
/// Unknown sizes count as one pipeline frame.
fn pipeline_bytes_for(buffer: &SupportedBufferSize, device_rate: u32) -> usize {
    match buffer {
        SupportedBufferSize::Range { min, .. } if *min > 0 && device_rate > 0 => {
            let frames = (*min as u64 * SAMPLE_RATE as u64).div_ceil(device_rate as u64);
            frames as usize * 2
        }
        _ => BYTES_PER_FRAME,
    }
}

/// Device-rate ring slots for a pipeline buffer of `buffer_size` bytes.
fn ring_capacity_for(buffer_size: usize, device_rate: u32) -> usize {
    (buffer_size / 2) * device_rate as usize / SAMPLE_RATE as usize
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Opens the preferred (or default) microphone through cpal.
pub struct CpalCaptureBackend {
    preferred_device: Option<String>,
    ids: SessionIds,
}

impl CpalCaptureBackend {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred_device,
            ids: SessionIds::default(),
        }
    }
}

impl CaptureBackend for CpalCaptureBackend {
    fn record_permission(&self) -> PermissionState {
        // Desktop hosts gate microphones at the OS level, not per process call.
        PermissionState::NotRequired
    }

    fn min_buffer_size(&self) -> Result<usize> {
        let host = cpal::default_host();
        let device = select_input_device(&host, self.preferred_device.as_deref())?;
        let supported = device
            .default_input_config()
            .map_err(|e| WakelinkError::DeviceInit(e.to_string()))?;
        Ok(pipeline_bytes_for(
            supported.buffer_size(),
            supported.sample_rate().0,
        ))
    }

    fn open(&self, buffer_size: usize) -> Result<Box<dyn CaptureDevice>> {
        let host = cpal::default_host();
        let device = select_input_device(&host, self.preferred_device.as_deref())?;
        let session = AudioSession::new(self.ids.next(), Direction::Capture);
        Ok(Box::new(CpalCaptureDevice::open(
            &device,
            buffer_size,
            session,
        )?))
    }
}

/// An open cpal input stream read as 16 kHz mono i16.
///
/// **Not `Send`**: create and drop on the same thread.
pub struct CpalCaptureDevice {
    stream: Stream,
    consumer: SampleConsumer,
    running: Arc<AtomicBool>,
    stream_error: Arc<Mutex<Option<String>>>,
    converter: RateConverter,
    scratch: Vec<f32>,
    /// Converted 16 kHz samples not yet handed out.
    pending: Vec<f32>,
    session: AudioSession,
}

impl CpalCaptureDevice {
    fn open(device: &cpal::Device, buffer_size: usize, session: AudioSession) -> Result<Self> {
        info!(
            device = device.name().unwrap_or_default().as_str(),
            session_id = session.session_id,
            buffer_size,
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| WakelinkError::DeviceInit(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) =
            create_sample_ring(ring_capacity_for(buffer_size, device_rate));
        let running = Arc::new(AtomicBool::new(false));
        let stream_error = Arc::new(Mutex::new(None));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(device, &config, producer, &running, &stream_error),
            SampleFormat::I16 => build_input::<i16>(device, &config, producer, &running, &stream_error),
            SampleFormat::U16 => build_input::<u16>(device, &config, producer, &running, &stream_error),
            SampleFormat::U8 => build_input::<u8>(device, &config, producer, &running, &stream_error),
            fmt => {
                return Err(WakelinkError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        // 10 ms of device audio per rubato call.
        let chunk = (device_rate as usize / 100).max(1);
        let converter = RateConverter::new(device_rate, SAMPLE_RATE, chunk)?;
        info!(
            device_rate,
            channels = config.channels,
            resampling = !converter.is_passthrough(),
            "input stream ready"
        );

        Ok(Self {
            stream,
            consumer,
            running,
            stream_error,
            converter,
            scratch: vec![0.0; chunk * 4],
            pending: Vec::new(),
            session,
        })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: SampleProducer,
    running: &Arc<AtomicBool>,
    stream_error: &Arc<Mutex<Option<String>>>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let running = Arc::clone(running);
    let stream_error = Arc::clone(stream_error);
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * channels;
                    let sum: f32 = data[base..base + channels]
                        .iter()
                        .map(|s| f32::from_sample(*s))
                        .sum();
                    *out = sum / channels as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                *stream_error.lock() = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| WakelinkError::AudioStream(e.to_string()))
}

impl CaptureDevice for CpalCaptureDevice {
    fn session(&self) -> &AudioSession {
        &self.session
    }

    fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        self.stream
            .play()
            .map_err(|e| WakelinkError::AudioStream(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(err) = self.stream_error.lock().take() {
            return Err(WakelinkError::TransientIo(err));
        }

        let wanted = buf.len() / 2;
        let deadline = Instant::now() + READ_WAIT;
        while self.pending.len() < wanted {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                if !self.running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(device_poll_ms()));
                continue;
            }
            let converted = self.converter.process(&self.scratch[..n]);
            self.pending.extend_from_slice(&converted);
        }

        let take = wanted.min(self.pending.len());
        for (dst, sample) in buf.chunks_exact_mut(2).zip(self.pending.drain(..take)) {
            dst.copy_from_slice(&denormalize_sample(sample).to_le_bytes());
        }
        Ok(take * 2)
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.converter.reset();
        self.pending.clear();
        self.stream
            .pause()
            .map_err(|e| WakelinkError::AudioStream(e.to_string()))
    }

    fn is_recording(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CpalCaptureDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        debug!(session_id = self.session.session_id, "input device released");
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Opens the preferred (or default) output device through cpal.
///
/// Volume is a software gain shared by every device this backend opens,
/// quantised to `volume_steps` like a platform stream-volume index.
pub struct CpalPlaybackBackend {
    preferred_device: Option<String>,
    ids: SessionIds,
    volume_index: Arc<AtomicU32>,
    volume_steps: u32,
}

impl CpalPlaybackBackend {
    pub fn new(preferred_device: Option<String>, volume_steps: u32) -> Self {
        let volume_steps = volume_steps.max(1);
        Self {
            preferred_device,
            ids: SessionIds::default(),
            volume_index: Arc::new(AtomicU32::new(volume_steps)),
            volume_steps,
        }
    }
}

impl PlaybackBackend for CpalPlaybackBackend {
    fn min_buffer_size(&self) -> Result<usize> {
        let host = cpal::default_host();
        let device = select_output_device(&host, self.preferred_device.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| WakelinkError::DeviceInit(e.to_string()))?;
        Ok(pipeline_bytes_for(
            supported.buffer_size(),
            supported.sample_rate().0,
        ))
    }

    fn open(&self, buffer_size: usize) -> Result<Box<dyn PlaybackDevice>> {
        let session = AudioSession::new(self.ids.next(), Direction::Playback);
        Ok(Box::new(CpalPlaybackDevice::open(
            self.preferred_device.clone(),
            buffer_size,
            session,
            Arc::clone(&self.volume_index),
            self.volume_steps,
        )?))
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

/// State shared between the output callback and the device handle.
#[derive(Default)]
struct OutputShared {
    playing: AtomicBool,
    /// Device-rate frames rendered from real (non-underrun) data.
    frames_played: AtomicU64,
    stream_error: Mutex<Option<String>>,
}

struct OpenedOutput {
    producer: SampleProducer,
    device_rate: u32,
}

/// An output stream fed with 16 kHz mono i16.
pub struct CpalPlaybackDevice {
    producer: SampleProducer,
    shared: Arc<OutputShared>,
    shutdown: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
    converter: RateConverter,
    device_rate: u32,
    session: AudioSession,
}

impl CpalPlaybackDevice {
    fn open(
        preferred: Option<String>,
        buffer_size: usize,
        session: AudioSession,
        volume_index: Arc<AtomicU32>,
        volume_steps: u32,
    ) -> Result<Self> {
        let shared = Arc::new(OutputShared::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<OpenedOutput>>();

        let thread_shared = Arc::clone(&shared);
        let thread_shutdown = Arc::clone(&shutdown);
        let stream_thread = thread::Builder::new()
            .name("wakelink-playback-stream".into())
            .spawn(move || {
                let stream = match open_output_stream(
                    preferred.as_deref(),
                    buffer_size,
                    thread_shared,
                    volume_index,
                    volume_steps,
                ) {
                    Ok((stream, opened)) => {
                        let _ = ready_tx.send(Ok(opened));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !thread_shutdown.load(Ordering::Acquire) {
                    thread::park_timeout(Duration::from_millis(100));
                }
                drop(stream);
            })
            .map_err(|e| WakelinkError::DeviceInit(format!("spawn playback thread: {e}")))?;

        let opened = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stream_thread.join();
                return Err(WakelinkError::DeviceInit(
                    "playback stream thread exited before reporting".into(),
                ));
            }
        };

        // 10 ms of pipeline audio per rubato call.
        let converter = RateConverter::new(SAMPLE_RATE, opened.device_rate, 160)?;
        info!(
            session_id = session.session_id,
            device_rate = opened.device_rate,
            "output device opened"
        );

        Ok(Self {
            producer: opened.producer,
            shared,
            shutdown,
            stream_thread: Some(stream_thread),
            converter,
            device_rate: opened.device_rate,
            session,
        })
    }
}

fn open_output_stream(
    preferred: Option<&str>,
    buffer_size: usize,
    shared: Arc<OutputShared>,
    volume_index: Arc<AtomicU32>,
    volume_steps: u32,
) -> Result<(Stream, OpenedOutput)> {
    let host = cpal::default_host();
    let device = select_output_device(&host, preferred)?;
    let supported = device
        .default_output_config()
        .map_err(|e| WakelinkError::DeviceInit(e.to_string()))?;
    let device_rate = supported.sample_rate().0;
    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let (producer, consumer) = create_sample_ring(ring_capacity_for(buffer_size, device_rate));
    let gain = OutputGain {
        index: volume_index,
        steps: volume_steps,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, shared, gain),
        SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, shared, gain),
        SampleFormat::U16 => build_output::<u16>(&device, &config, consumer, shared, gain),
        fmt => {
            return Err(WakelinkError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;
    stream
        .play()
        .map_err(|e| WakelinkError::AudioStream(e.to_string()))?;

    Ok((
        stream,
        OpenedOutput {
            producer,
            device_rate,
        },
    ))
}

struct OutputGain {
    index: Arc<AtomicU32>,
    steps: u32,
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: SampleConsumer,
    shared: Arc<OutputShared>,
    gain: OutputGain,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let error_shared = Arc::clone(&shared);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let level = gain.index.load(Ordering::Relaxed) as f32 / gain.steps as f32;
                let playing = shared.playing.load(Ordering::Relaxed);
                let mut played = 0u64;
                for frame in data.chunks_mut(channels) {
                    let sample = if playing {
                        match consumer.try_pop() {
                            Some(s) => {
                                played += 1;
                                s * level
                            }
                            None => 0.0,
                        }
                    } else {
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = T::from_sample(sample);
                    }
                }
                if played > 0 {
                    shared.frames_played.fetch_add(played, Ordering::Relaxed);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
                *error_shared.stream_error.lock() = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| WakelinkError::AudioStream(e.to_string()))
}

impl PlaybackDevice for CpalPlaybackDevice {
    fn session(&self) -> &AudioSession {
        &self.session
    }

    fn play(&mut self) -> Result<()> {
        self.shared.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.playing.store(false, Ordering::Release);
        self.converter.reset();
        Ok(())
    }

    fn play_state(&self) -> DevicePlayState {
        if self.shared.playing.load(Ordering::Acquire) {
            DevicePlayState::Playing
        } else {
            DevicePlayState::Stopped
        }
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        if let Some(err) = self.shared.stream_error.lock().take() {
            return Err(WakelinkError::TransientIo(err));
        }

        let samples: Vec<f32> = le_bytes_to_samples(pcm)
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect();
        let converted = self.converter.process(&samples);

        let mut offset = 0;
        let mut last_progress = Instant::now();
        while offset < converted.len() {
            let pushed = self.producer.push_slice(&converted[offset..]);
            if pushed > 0 {
                offset += pushed;
                last_progress = Instant::now();
                continue;
            }
            if last_progress.elapsed() >= WRITE_STALL {
                return Err(WakelinkError::TransientIo(format!(
                    "playback ring stalled with {} samples unwritten",
                    converted.len() - offset
                )));
            }
            thread::sleep(Duration::from_millis(device_poll_ms()));
        }
        Ok(pcm.len() & !1)
    }

    fn playback_head_position(&self) -> u64 {
        let device_frames = self.shared.frames_played.load(Ordering::Relaxed);
        device_frames * SAMPLE_RATE as u64 / self.device_rate.max(1) as u64
    }

    fn buffer_size_frames(&self) -> u64 {
        self.producer.capacity().get() as u64 * SAMPLE_RATE as u64 / self.device_rate.max(1) as u64
    }
}

impl Drop for CpalPlaybackDevice {
    fn drop(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.stream_thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("playback stream thread panicked during release");
            }
        }
        debug!(session_id = self.session.session_id, "output device released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_buffer_converts_device_frames_to_pipeline_bytes() {
        let range = SupportedBufferSize::Range { min: 480, max: 4096 };
        // 480 frames @ 48 kHz = 10 ms = 160 samples @ 16 kHz = 320 bytes
        assert_eq!(pipeline_bytes_for(&range, 48_000), 320);
        assert_eq!(
            pipeline_bytes_for(&SupportedBufferSize::Unknown, 48_000),
            BYTES_PER_FRAME
        );
    }

    #[test]
    fn ring_capacity_scales_with_device_rate() {
        assert_eq!(ring_capacity_for(1920, 16_000), 960);
        assert_eq!(ring_capacity_for(1920, 48_000), 2880);
    }
}
