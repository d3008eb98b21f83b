//! `WakelinkEngine`: the single entry point hosts call into.
//!
//! ## Lifecycle
//!
//! ```text
//! WakelinkEngine::new()                     status = Idle
//!     └─► initialize()    capture sized (one retry on device errors),
//!         │               keyword engine configured, transcoder built   → Ready
//!         └─► start_listening()   capture thread + encode worker         → Listening
//!             └─► stop_listening()   loop joined, bridge parked           → Stopped
//! release()  everything closed                                           → Idle
//! ```
//!
//! ## Locks
//!
//! - device lock (`DeviceLock`): capture open/close, every playback call
//!   (decode included), playback reinit.
//! - decoder lock: inside [`Transcoder`], always taken after the device lock.
//! - listen lock: serialises start/stop/reconfigure; never taken by the
//!   capture thread.
//!
//! ## Recovery
//!
//! A playback write or decode failure schedules one asynchronous reinit of the
//! playback device and the transcoder on the blocking pool. Only a failed
//! reinit is surfaced, as a `PipelineStatus::Error` event. The encode worker
//! rebuilds the codec itself on its first failure and retries the frame.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{CaptureBackend, DeviceLock, PlaybackBackend},
    capture::{CaptureEngine, StartError},
    codec::{CodecBackend, CodecFrame, DecodeOutcome, SelfTestReport, Transcoder},
    config::{clamp_threshold, PipelineConfig},
    detector::{DetectorBridge, SpotterFactory},
    effects::{EffectKind, EffectToggles, EffectsChain, EffectsProvider, EffectsStatus},
    error::{Result, WakelinkError},
    ipc::events::{DetectionEvent, PipelineStatus, PipelineStatusEvent},
    playback::{PlaybackEngine, PlaybackSettings, PlaybackState},
};

use pipeline::{
    run_encoder, CaptureCommand, CaptureSink, DiagnosticsSnapshot, PipelineDiagnostics,
};

/// Status broadcast capacity.
const STATUS_CAP: usize = 64;

/// Longest a keyword change waits for the capture thread to apply it.
const RECONFIGURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything platform-specific the engine is built from.
#[derive(Clone)]
pub struct EngineBackends {
    pub capture: Arc<dyn CaptureBackend>,
    pub playback: Arc<dyn PlaybackBackend>,
    pub codec: Arc<dyn CodecBackend>,
    pub spotter: Arc<dyn SpotterFactory>,
    pub effects: Arc<dyn EffectsProvider>,
}

impl EngineBackends {
    /// cpal devices, the build's default codec and software effects.
    #[cfg(feature = "audio-cpal")]
    pub fn cpal(config: &PipelineConfig, spotter: Arc<dyn SpotterFactory>) -> Self {
        use crate::audio::cpal_backend::{CpalCaptureBackend, CpalPlaybackBackend};

        Self {
            capture: Arc::new(CpalCaptureBackend::new(
                config.preferred_input_device.clone(),
            )),
            playback: Arc::new(CpalPlaybackBackend::new(
                config.preferred_output_device.clone(),
                config.volume_steps,
            )),
            codec: crate::codec::default_backend(),
            spotter,
            effects: Arc::new(crate::effects::SoftwareEffects::default()),
        }
    }
}

/// Capture-side state guarded by the listen lock.
struct ListenState {
    capture: CaptureEngine<CaptureSink>,
    /// Parked here while not listening; inside the capture thread otherwise.
    bridge: Option<DetectorBridge>,
    commands: Option<Sender<CaptureCommand>>,
    encoder: Option<JoinHandle<()>>,
}

impl ListenState {
    fn park(&mut self, sink: CaptureSink) {
        let mut bridge = sink.into_bridge();
        bridge.detach_events();
        self.bridge = Some(bridge);
    }

    fn is_listening(&self) -> bool {
        self.capture.is_running()
    }
}

/// Shared handles the playback recovery path needs off the caller's thread.
#[derive(Clone)]
struct Recovery {
    playback: Arc<Mutex<PlaybackEngine>>,
    device_lock: DeviceLock,
    status: Arc<Mutex<PipelineStatus>>,
    status_tx: broadcast::Sender<PipelineStatusEvent>,
    diagnostics: Arc<PipelineDiagnostics>,
    in_flight: Arc<AtomicBool>,
}

impl Recovery {
    /// Run at most one reinit at a time on the blocking pool.
    fn schedule(&self, runtime: &Handle, transcoder: Arc<Transcoder>, reason: String) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("playback reinit already in flight");
            return;
        }
        let recovery = self.clone();
        runtime.spawn_blocking(move || {
            recovery.run(&transcoder, &reason);
            recovery.in_flight.store(false, Ordering::Release);
        });
    }

    fn run(&self, transcoder: &Transcoder, reason: &str) {
        self.diagnostics
            .reinit_attempts
            .fetch_add(1, Ordering::Relaxed);
        warn!(reason, "reinitializing playback path");

        let result = {
            let _device = self.device_lock.lock();
            let mut playback = self.playback.lock();
            if let Err(e) = playback.stop() {
                debug!("stop before reinit failed: {e}");
            }
            playback
                .reinitialize()
                .and_then(|()| transcoder.reinitialize())
        };

        match result {
            Ok(()) => info!("playback path reinitialized"),
            Err(e) => {
                error!("playback reinit failed: {e}");
                set_status(
                    &self.status,
                    &self.status_tx,
                    PipelineStatus::Error,
                    Some(format!("playback recovery failed: {e}")),
                );
            }
        }
    }
}

fn set_status(
    status: &Mutex<PipelineStatus>,
    status_tx: &broadcast::Sender<PipelineStatusEvent>,
    new_status: PipelineStatus,
    detail: Option<String>,
) {
    *status.lock() = new_status;
    let _ = status_tx.send(PipelineStatusEvent {
        status: new_status,
        detail,
    });
}

/// The audio pipeline supervisor.
///
/// `Send + Sync`; share it behind an `Arc`. Construct one per process and
/// pass it to whatever needs it.
pub struct WakelinkEngine {
    config: Mutex<PipelineConfig>,
    runtime: Handle,
    backends: EngineBackends,
    effects: Arc<EffectsChain>,
    device_lock: DeviceLock,
    listen: Mutex<ListenState>,
    transcoder: Mutex<Option<Arc<Transcoder>>>,
    playback: Arc<Mutex<PlaybackEngine>>,
    initialized: AtomicBool,
    status: Arc<Mutex<PipelineStatus>>,
    status_tx: broadcast::Sender<PipelineStatusEvent>,
    encoded_tx: broadcast::Sender<CodecFrame>,
    detection_tx: Sender<DetectionEvent>,
    detection_rx: Receiver<DetectionEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
    recovery: Recovery,
}

impl WakelinkEngine {
    /// Build the engine. Nothing is opened until `initialize()`.
    ///
    /// `runtime` runs the encode worker, playback writes and recovery.
    pub fn new(mut config: PipelineConfig, backends: EngineBackends, runtime: Handle) -> Self {
        config.normalize();

        let device_lock: DeviceLock = Arc::new(Mutex::new(()));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let effects = Arc::new(EffectsChain::new(
            Arc::clone(&backends.effects),
            EffectToggles {
                aec: config.aec_enabled,
                ns: config.ns_enabled,
            },
        ));
        let capture = CaptureEngine::new(
            Arc::clone(&backends.capture),
            Arc::clone(&effects),
            Arc::clone(&device_lock),
            Arc::clone(&diagnostics),
            config.capture_buffer_multiplier,
        );
        let playback = Arc::new(Mutex::new(PlaybackEngine::new(
            Arc::clone(&backends.playback),
            PlaybackSettings::from(&config),
        )));

        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        let (encoded_tx, _) = broadcast::channel(config.encoded_channel_capacity);
        let (detection_tx, detection_rx) = bounded(config.detection_channel_capacity);
        let status = Arc::new(Mutex::new(PipelineStatus::Idle));

        let recovery = Recovery {
            playback: Arc::clone(&playback),
            device_lock: Arc::clone(&device_lock),
            status: Arc::clone(&status),
            status_tx: status_tx.clone(),
            diagnostics: Arc::clone(&diagnostics),
            in_flight: Arc::new(AtomicBool::new(false)),
        };

        Self {
            config: Mutex::new(config),
            runtime,
            backends,
            effects,
            device_lock,
            listen: Mutex::new(ListenState {
                capture,
                bridge: None,
                commands: None,
                encoder: None,
            }),
            transcoder: Mutex::new(None),
            playback,
            initialized: AtomicBool::new(false),
            status,
            status_tx,
            encoded_tx,
            detection_tx,
            detection_rx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics,
            recovery,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Size the capture buffer, configure the keyword engine and build the
    /// transcoder. Device errors get one retry. Idempotent once it succeeded.
    ///
    /// # Errors
    /// - `PermissionDenied` when the microphone grant is missing.
    /// - `EngineConfig` when the keyword engine returns a null stream.
    /// - Device or codec errors that survive the retry.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.set_status(PipelineStatus::Initializing, None);
        info!("initializing audio pipeline");

        match self.initialize_inner() {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                self.set_status(PipelineStatus::Ready, None);
                info!("audio pipeline ready");
                Ok(())
            }
            Err(e) => {
                error!("initialization failed: {e}");
                self.set_status(PipelineStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn initialize_inner(&self) -> Result<()> {
        let config = self.config.lock().clone();
        let mut listen = self.listen.lock();

        match listen.capture.initialize() {
            Err(e) if e.is_retryable() => {
                warn!("capture init failed ({e}), retrying once");
                self.diagnostics
                    .reinit_attempts
                    .fetch_add(1, Ordering::Relaxed);
                listen.capture.initialize()?;
            }
            other => {
                other?;
            }
        }

        let bridge = listen.bridge.get_or_insert_with(|| {
            DetectorBridge::new(
                Arc::clone(&self.backends.spotter),
                config.keywords_score,
                Arc::clone(&self.seq),
                Arc::clone(&self.diagnostics),
            )
        });
        bridge.configure(&config.keywords, config.threshold)?;

        let transcoder = Transcoder::new(
            Arc::clone(&self.backends.codec),
            config.decode_guards.clone(),
        )?;
        *self.transcoder.lock() = Some(Arc::new(transcoder));
        Ok(())
    }

    /// Start capture and detection.
    ///
    /// Returns the detection receiver. It is the same channel for the life of
    /// the engine, so a receiver obtained earlier keeps working across
    /// stop/start and threshold changes.
    pub fn start_listening(&self) -> Result<Receiver<DetectionEvent>> {
        if !self.is_initialized() {
            return Err(WakelinkError::NotInitialized);
        }
        let mut listen = self.listen.lock();
        if listen.is_listening() {
            return Err(WakelinkError::AlreadyRunning);
        }
        self.start_locked(&mut listen)?;
        Ok(self.detection_rx.clone())
    }

    fn start_locked(&self, listen: &mut ListenState) -> Result<()> {
        // A loop that ended on its own still holds the bridge.
        if let Some(sink) = listen.capture.stop() {
            listen.park(sink);
        }
        self.join_encoder(listen);

        let mut bridge = listen.bridge.take().ok_or(WakelinkError::NotInitialized)?;
        bridge.attach_events(self.detection_tx.clone());

        let config = self.config.lock().clone();
        let (command_tx, command_rx) = bounded(4);
        let (encode_tx, encode_rx) = bounded(config.encode_queue_capacity);
        let encoder = self.transcoder.lock().clone().map(|transcoder| {
            let encoded_tx = self.encoded_tx.clone();
            let diagnostics = Arc::clone(&self.diagnostics);
            let status = Arc::clone(&self.status);
            let status_tx = self.status_tx.clone();
            let on_unrecoverable = move |detail: String| {
                set_status(&status, &status_tx, PipelineStatus::Error, Some(detail));
            };
            self.runtime.spawn_blocking(move || {
                run_encoder(encode_rx, transcoder, encoded_tx, diagnostics, on_unrecoverable)
            })
        });
        let encode_tx = encoder.as_ref().map(|_| encode_tx);

        let sink = CaptureSink::new(bridge, command_rx, encode_tx, Arc::clone(&self.diagnostics));
        let started = match listen.capture.start(sink) {
            Err(StartError {
                error,
                sink: Some(sink),
            }) if error.is_retryable() => {
                warn!("capture start failed ({error}), retrying once");
                self.diagnostics
                    .reinit_attempts
                    .fetch_add(1, Ordering::Relaxed);
                listen.capture.start(sink)
            }
            other => other,
        };

        match started {
            Ok(()) => {
                listen.commands = Some(command_tx);
                listen.encoder = encoder;
                self.set_status(PipelineStatus::Listening, None);
                info!("listening");
                Ok(())
            }
            Err(StartError { error, sink }) => {
                match sink {
                    Some(sink) => listen.park(sink),
                    None => error!("detector bridge lost with the capture thread"),
                }
                listen.encoder = encoder;
                self.join_encoder(listen);
                self.set_status(PipelineStatus::Error, Some(error.to_string()));
                Err(error)
            }
        }
    }

    /// Stop capture and detection. Idempotent.
    ///
    /// Blocks until a read in flight returns and the device is released.
    pub fn stop_listening(&self) -> Result<()> {
        let mut listen = self.listen.lock();
        if self.stop_locked(&mut listen) {
            self.set_status(PipelineStatus::Stopped, None);
            info!("listening stopped");
        }
        Ok(())
    }

    /// Returns whether a capture loop was stopped.
    fn stop_locked(&self, listen: &mut ListenState) -> bool {
        listen.commands = None;
        let stopped = match listen.capture.stop() {
            Some(sink) => {
                listen.park(sink);
                true
            }
            None => false,
        };
        self.join_encoder(listen);
        stopped
    }

    /// The encode worker exits once the sink (its only sender) is gone, so it
    /// is detached rather than awaited.
    fn join_encoder(&self, listen: &mut ListenState) {
        if let Some(handle) = listen.encoder.take() {
            if !handle.is_finished() {
                debug!("encode worker draining in background");
            }
        }
    }

    /// Replace the keyword set.
    ///
    /// While listening the change is applied on the capture thread before its
    /// next read. On failure detection stays paused until a later call
    /// succeeds and an error status is published.
    pub fn set_keywords(&self, keywords: &str) -> Result<()> {
        let keywords = keywords.trim().to_string();
        self.config.lock().keywords = keywords.clone();

        let mut listen = self.listen.lock();
        let commands = if listen.is_listening() {
            listen.commands.clone()
        } else {
            None
        };
        let result = match commands {
            Some(commands) => {
                let (reply_tx, reply_rx) = bounded(1);
                let sent = commands.send(CaptureCommand::Reconfigure {
                    keywords: keywords.clone(),
                    reply: reply_tx,
                });
                match sent {
                    Ok(()) => reply_rx.recv_timeout(RECONFIGURE_TIMEOUT).unwrap_or_else(|_| {
                        Err(WakelinkError::Engine(
                            "capture thread did not apply the keyword change".into(),
                        ))
                    }),
                    Err(_) => Err(WakelinkError::Engine("capture thread is gone".into())),
                }
            }
            None => {
                if let Some(sink) = listen.capture.stop() {
                    listen.park(sink);
                }
                match listen.bridge.as_mut() {
                    Some(bridge) => bridge.reconfigure(&keywords),
                    None => Err(WakelinkError::NotInitialized),
                }
            }
        };

        if let Err(e) = &result {
            warn!(keywords = keywords.as_str(), "keyword change failed: {e}");
            self.set_status(PipelineStatus::Error, Some(e.to_string()));
        }
        result
    }

    /// Rebuild the keyword engine with a new threshold.
    ///
    /// Stops listening, releases and recreates the engine and its stream, then
    /// resumes listening if it was listening before, even when the rebuild
    /// failed. Blocks for up to one read; call it from a blocking context.
    pub fn set_threshold(&self, threshold: f32) -> Result<()> {
        let threshold = clamp_threshold(threshold);
        self.config.lock().threshold = threshold;

        let mut listen = self.listen.lock();
        let was_listening = listen.is_listening();
        self.stop_locked(&mut listen);

        let rebuilt = match listen.bridge.as_mut() {
            Some(bridge) => bridge.set_threshold(threshold),
            None => Err(WakelinkError::NotInitialized),
        };
        match &rebuilt {
            Ok(()) => info!(threshold, "keyword engine rebuilt"),
            Err(e) => warn!(threshold, "keyword engine rebuild failed: {e}"),
        }

        if was_listening {
            self.start_locked(&mut listen)?;
        } else if self.is_initialized() {
            self.set_status(PipelineStatus::Ready, None);
        }
        if let Err(e) = &rebuilt {
            self.set_status(PipelineStatus::Error, Some(e.to_string()));
        }
        rebuilt
    }

    /// Stop everything and close all devices. Safe to call repeatedly;
    /// `initialize()` may be called again afterwards.
    pub fn release(&self) {
        {
            let mut listen = self.listen.lock();
            self.stop_locked(&mut listen);
            if let Some(mut bridge) = listen.bridge.take() {
                bridge.release();
            }
        }
        self.effects.release();
        {
            let _device = self.device_lock.lock();
            self.playback.lock().release();
        }
        *self.transcoder.lock() = None;
        if self.initialized.swap(false, Ordering::AcqRel) {
            info!("audio pipeline released");
        }
        self.set_status(PipelineStatus::Idle, None);
    }

    // ── Effects ───────────────────────────────────────────────────────────

    pub fn set_aec_enabled(&self, enabled: bool) -> bool {
        self.effects.set_enabled(EffectKind::EchoCanceler, enabled)
    }

    pub fn set_ns_enabled(&self, enabled: bool) -> bool {
        self.effects.set_enabled(EffectKind::NoiseSuppressor, enabled)
    }

    pub fn is_aec_available(&self) -> bool {
        self.effects.is_available(EffectKind::EchoCanceler)
    }

    pub fn is_ns_available(&self) -> bool {
        self.effects.is_available(EffectKind::NoiseSuppressor)
    }

    pub fn is_aec_enabled(&self) -> bool {
        self.effects.is_enabled(EffectKind::EchoCanceler)
    }

    pub fn is_ns_enabled(&self) -> bool {
        self.effects.is_enabled(EffectKind::NoiseSuppressor)
    }

    pub fn effects_status(&self) -> EffectsStatus {
        self.effects.status()
    }

    // ── Playback ──────────────────────────────────────────────────────────

    fn current_transcoder(&self) -> Result<Arc<Transcoder>> {
        self.transcoder
            .lock()
            .clone()
            .ok_or(WakelinkError::NotInitialized)
    }

    /// Decode one incoming frame and write it to the output device.
    ///
    /// Runs on the blocking pool. Decode and write happen under the device
    /// lock, so concurrent calls queue rather than interleave. Returns `Ok(false)` when the frame produced
    /// no audio (rejected, undecodable, or the write failed and recovery was
    /// scheduled).
    pub async fn play_encoded_frame(&self, frame: CodecFrame) -> Result<bool> {
        let transcoder = self.current_transcoder()?;
        let playback = Arc::clone(&self.playback);
        let device_lock = Arc::clone(&self.device_lock);
        let diagnostics = Arc::clone(&self.diagnostics);
        let recovery = self.recovery.clone();
        let runtime = self.runtime.clone();

        let task = self.runtime.spawn_blocking(move || {
            // Held across decode and write so concurrent callers write in
            // the order they decoded.
            let _device = device_lock.lock();
            let pcm = match transcoder.decode_checked(frame.as_bytes()) {
                DecodeOutcome::Decoded(pcm) => {
                    diagnostics.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    pcm
                }
                DecodeOutcome::Rejected(_) => {
                    diagnostics.frames_rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                DecodeOutcome::NoOutput => {
                    diagnostics.decode_failures.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                DecodeOutcome::Failed(e) => {
                    diagnostics.decode_failures.fetch_add(1, Ordering::Relaxed);
                    recovery.schedule(&runtime, transcoder, format!("decode failed: {e}"));
                    return false;
                }
            };

            let written = playback.lock().write(&pcm.to_le_bytes());
            match written {
                Ok(_) => {
                    diagnostics.playback_writes.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    diagnostics
                        .playback_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("playback write failed: {e}");
                    recovery.schedule(&runtime, transcoder, format!("write failed: {e}"));
                    false
                }
            }
        });

        task.await
            .map_err(|e| WakelinkError::Other(anyhow::anyhow!("playback task failed: {e}")))
    }

    /// Open the playback device (and build the transcoder if needed) ahead of
    /// the first frame.
    pub fn prepare_playback(&self) -> Result<()> {
        {
            let mut slot = self.transcoder.lock();
            if slot.is_none() {
                let guards = self.config.lock().decode_guards.clone();
                *slot = Some(Arc::new(Transcoder::new(
                    Arc::clone(&self.backends.codec),
                    guards,
                )?));
            }
        }
        let _device = self.device_lock.lock();
        self.playback.lock().open()
    }

    /// Prime the output with silence and start it if it is not playing.
    pub fn warm_up_playback(&self) -> Result<bool> {
        let _device = self.device_lock.lock();
        self.playback.lock().warm_up()
    }

    pub fn stop_playback(&self) -> Result<()> {
        let _device = self.device_lock.lock();
        self.playback.lock().stop()
    }

    /// Best-effort natural-completion poll; see [`PlaybackEngine::check_finished`].
    pub fn check_playback_finished(&self) -> bool {
        let _device = self.device_lock.lock();
        self.playback.lock().check_finished()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback.lock().state()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.lock().is_playing()
    }

    /// Set the shared output volume (0.0..=1.0).
    pub fn set_volume(&self, level: f32) -> Result<()> {
        self.playback.lock().set_volume(level)
    }

    pub fn get_volume(&self) -> Result<f32> {
        self.playback.lock().volume()
    }

    /// Round-trip one second of silence through the configured codec.
    pub fn codec_self_test(&self) -> Result<SelfTestReport> {
        match self.current_transcoder() {
            Ok(transcoder) => transcoder.self_test(),
            Err(_) => {
                let guards = self.config.lock().decode_guards.clone();
                Transcoder::new(Arc::clone(&self.backends.codec), guards)?.self_test()
            }
        }
    }

    // ── Observation ───────────────────────────────────────────────────────

    pub fn subscribe_status(&self) -> broadcast::Receiver<PipelineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Outbound codec frames encoded from captured audio.
    pub fn subscribe_encoded(&self) -> broadcast::Receiver<CodecFrame> {
        self.encoded_tx.subscribe()
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_listening(&self) -> bool {
        self.listen.lock().is_listening()
    }

    pub fn keywords(&self) -> String {
        self.config.lock().keywords.clone()
    }

    pub fn threshold(&self) -> f32 {
        self.config.lock().threshold
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn set_status(&self, new_status: PipelineStatus, detail: Option<String>) {
        set_status(&self.status, &self.status_tx, new_status, detail);
    }
}

impl Drop for WakelinkEngine {
    fn drop(&mut self) {
        let mut listen = self.listen.lock();
        self.stop_locked(&mut listen);
    }
}
