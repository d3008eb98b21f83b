#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use wakelink_core::audio::{
    AudioSession, CaptureBackend, CaptureDevice, DevicePlayState, Direction, PermissionState,
    PlaybackBackend, PlaybackDevice, SessionIds,
};
use wakelink_core::codec::{
    raw::{RawBackend, RawCodec},
    CodecBackend, FrameDecoder, FrameEncoder,
};
use wakelink_core::config::BYTES_PER_FRAME;
use wakelink_core::effects::NoEffects;
use wakelink_core::{
    EngineBackends, PipelineConfig, StubSpotterFactory, WakelinkEngine, WakelinkError,
};

/// Amplitude of a "loud" scripted frame (0.5 full scale).
pub const LOUD_SAMPLE: i16 = 16_384;

pub enum Chunk {
    Loud,
    Silent,
    Fail,
}

#[derive(Default)]
pub struct CaptureProbe {
    pub opens: AtomicUsize,
    pub stops: AtomicUsize,
    pub drops: AtomicUsize,
    pub reads: AtomicUsize,
}

pub struct FakeCapture {
    pub permission: PermissionState,
    pub min_buffer: usize,
    pub read_delay: Duration,
    pub fail_min_buffer_once: AtomicBool,
    pub script: Arc<Mutex<VecDeque<Chunk>>>,
    pub probe: Arc<CaptureProbe>,
    pub sessions: SessionIds,
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self {
            permission: PermissionState::Granted,
            min_buffer: BYTES_PER_FRAME,
            read_delay: Duration::ZERO,
            fail_min_buffer_once: AtomicBool::new(false),
            script: Arc::new(Mutex::new(VecDeque::new())),
            probe: Arc::new(CaptureProbe::default()),
            sessions: SessionIds::default(),
        }
    }
}

impl FakeCapture {
    pub fn push(&self, chunk: Chunk, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(match chunk {
                Chunk::Loud => Chunk::Loud,
                Chunk::Silent => Chunk::Silent,
                Chunk::Fail => Chunk::Fail,
            });
        }
    }
}

impl CaptureBackend for FakeCapture {
    fn record_permission(&self) -> PermissionState {
        self.permission
    }

    fn min_buffer_size(&self) -> wakelink_core::Result<usize> {
        if self.fail_min_buffer_once.swap(false, Ordering::SeqCst) {
            return Err(WakelinkError::DeviceInit("device busy".into()));
        }
        Ok(self.min_buffer)
    }

    fn open(&self, _buffer_size: usize) -> wakelink_core::Result<Box<dyn CaptureDevice>> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCaptureDevice {
            session: AudioSession::new(self.sessions.next(), Direction::Capture),
            recording: false,
            read_delay: self.read_delay,
            script: Arc::clone(&self.script),
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct FakeCaptureDevice {
    session: AudioSession,
    recording: bool,
    read_delay: Duration,
    script: Arc<Mutex<VecDeque<Chunk>>>,
    probe: Arc<CaptureProbe>,
}

impl CaptureDevice for FakeCaptureDevice {
    fn session(&self) -> &AudioSession {
        &self.session
    }

    fn start(&mut self) -> wakelink_core::Result<()> {
        self.recording = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> wakelink_core::Result<usize> {
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            thread::sleep(self.read_delay);
        }
        let next = self.script.lock().pop_front();
        match next {
            Some(Chunk::Loud) => {
                for pair in buf.chunks_exact_mut(2) {
                    pair.copy_from_slice(&LOUD_SAMPLE.to_le_bytes());
                }
                Ok(buf.len())
            }
            Some(Chunk::Silent) => {
                buf.fill(0);
                Ok(buf.len())
            }
            Some(Chunk::Fail) => Err(WakelinkError::TransientIo("scripted read failure".into())),
            None => {
                thread::sleep(Duration::from_millis(2));
                Ok(0)
            }
        }
    }

    fn stop(&mut self) -> wakelink_core::Result<()> {
        self.recording = false;
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }
}

impl Drop for FakeCaptureDevice {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct PlaybackProbe {
    pub opens: AtomicUsize,
    pub bytes_written: AtomicUsize,
    pub writes: AtomicUsize,
    pub fail_next_write: AtomicBool,
    /// Forces the device to report `Stopped` (drained).
    pub drained: AtomicBool,
    pub head: AtomicU64,
    /// Every successful write, in device order.
    pub written: Mutex<Vec<Vec<u8>>>,
}

pub const FAKE_PLAYBACK_FRAMES: u64 = 4096;

pub struct FakePlayback {
    pub probe: Arc<PlaybackProbe>,
    pub max_volume: u32,
    pub volume: AtomicU32,
    pub sessions: SessionIds,
}

impl Default for FakePlayback {
    fn default() -> Self {
        Self {
            probe: Arc::new(PlaybackProbe::default()),
            max_volume: 15,
            volume: AtomicU32::new(15),
            sessions: SessionIds::default(),
        }
    }
}

impl PlaybackBackend for FakePlayback {
    fn min_buffer_size(&self) -> wakelink_core::Result<usize> {
        Ok(FAKE_PLAYBACK_FRAMES as usize * 2)
    }

    fn open(&self, _buffer_size: usize) -> wakelink_core::Result<Box<dyn PlaybackDevice>> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePlaybackDevice {
            session: AudioSession::new(self.sessions.next(), Direction::Playback),
            playing: false,
            probe: Arc::clone(&self.probe),
        }))
    }

    fn max_volume_index(&self) -> u32 {
        self.max_volume
    }

    fn volume_index(&self) -> wakelink_core::Result<u32> {
        Ok(self.volume.load(Ordering::SeqCst))
    }

    fn set_volume_index(&self, index: u32) -> wakelink_core::Result<()> {
        self.volume.store(index, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePlaybackDevice {
    session: AudioSession,
    playing: bool,
    probe: Arc<PlaybackProbe>,
}

impl PlaybackDevice for FakePlaybackDevice {
    fn session(&self) -> &AudioSession {
        &self.session
    }

    fn play(&mut self) -> wakelink_core::Result<()> {
        self.playing = true;
        Ok(())
    }

    fn stop(&mut self) -> wakelink_core::Result<()> {
        self.playing = false;
        Ok(())
    }

    fn play_state(&self) -> DevicePlayState {
        if self.playing && !self.probe.drained.load(Ordering::SeqCst) {
            DevicePlayState::Playing
        } else {
            DevicePlayState::Stopped
        }
    }

    fn write(&mut self, pcm: &[u8]) -> wakelink_core::Result<usize> {
        if self.probe.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(WakelinkError::AudioDevice("scripted write failure".into()));
        }
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.probe.bytes_written.fetch_add(pcm.len(), Ordering::SeqCst);
        self.probe.written.lock().push(pcm.to_vec());
        Ok(pcm.len())
    }

    fn playback_head_position(&self) -> u64 {
        self.probe.head.load(Ordering::SeqCst)
    }

    fn buffer_size_frames(&self) -> u64 {
        FAKE_PLAYBACK_FRAMES
    }
}

/// Engine plus the runtime it runs on. The engine is dropped first.
pub struct Harness {
    pub engine: WakelinkEngine,
    pub capture: Arc<FakeCapture>,
    pub playback: Arc<FakePlayback>,
    pub rt: Runtime,
}

pub fn harness(capture: FakeCapture) -> Harness {
    harness_with(capture, PipelineConfig::default())
}

pub fn harness_with(capture: FakeCapture, config: PipelineConfig) -> Harness {
    harness_with_codec(capture, config, Arc::new(RawBackend))
}

pub fn harness_with_codec(
    capture: FakeCapture,
    config: PipelineConfig,
    codec: Arc<dyn CodecBackend>,
) -> Harness {
    let rt = Runtime::new().expect("tokio runtime");
    let capture = Arc::new(capture);
    let playback = Arc::new(FakePlayback::default());
    let backends = EngineBackends {
        capture: Arc::clone(&capture) as Arc<dyn CaptureBackend>,
        playback: Arc::clone(&playback) as Arc<dyn PlaybackBackend>,
        codec,
        spotter: Arc::new(StubSpotterFactory::default()),
        effects: Arc::new(NoEffects),
    };
    let config = PipelineConfig {
        keywords: "hey link".into(),
        ..config
    };
    Harness {
        engine: WakelinkEngine::new(config, backends, rt.handle().clone()),
        capture,
        playback,
        rt,
    }
}

/// Samples per frame produced by [`CountingDecoder`].
pub const COUNTING_SAMPLES: usize = 4;

/// Codec whose decoder keeps a running count of frames decoded and writes
/// that count into every output sample. Encoding is raw PCM.
#[derive(Default)]
pub struct CountingBackend {
    pub decoders_created: AtomicUsize,
    pub decode_delay: Duration,
}

impl CodecBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn create_encoder(&self) -> wakelink_core::Result<Box<dyn FrameEncoder>> {
        Ok(Box::new(RawCodec))
    }

    fn create_decoder(&self) -> wakelink_core::Result<Box<dyn FrameDecoder>> {
        self.decoders_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingDecoder {
            history: 0,
            delay: self.decode_delay,
        }))
    }
}

pub struct CountingDecoder {
    history: i16,
    delay: Duration,
}

impl FrameDecoder for CountingDecoder {
    fn decode(&mut self, _frame: &[u8], out: &mut [i16]) -> wakelink_core::Result<usize> {
        self.history += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        out[..COUNTING_SAMPLES].fill(self.history);
        Ok(COUNTING_SAMPLES)
    }

    fn reset(&mut self) -> wakelink_core::Result<()> {
        self.history = 0;
        Ok(())
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
