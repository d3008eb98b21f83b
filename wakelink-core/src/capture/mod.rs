//! Capture engine: owns the input device and turns it into a stream of
//! [`PcmFrame`]s.
//!
//! ```text
//! initialize()  permission check, buffer = min_buffer_size × multiplier
//!     └─► start(sink)   spawn "wakelink-capture" thread
//!             │           open device under the device lock, attach effects
//!             │           loop { sink.on_idle(); read 1920 B; effects; sink.on_frame() }
//!             └─► stop()    clear flag, join, get the sink back
//! ```
//!
//! The device is created, read and dropped on the capture thread (cpal streams
//! are `!Send`). Stopping never interrupts a read in flight: the flag is
//! observed at the top of the next iteration. Effects are released before the
//! device, exactly once, when the loop exits.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::{
    audio::{CaptureBackend, CaptureDevice, DeviceLock},
    buffering::frame::PcmFrame,
    config::{device_poll_ms, BYTES_PER_FRAME},
    effects::EffectsChain,
    engine::pipeline::PipelineDiagnostics,
    error::{Result, WakelinkError},
};

/// Downstream consumer of captured frames. Runs on the capture thread.
pub trait FrameSink: Send + 'static {
    /// Called once per non-empty read. The frame is not retained by the loop.
    fn on_frame(&mut self, frame: &PcmFrame);

    /// Called at the top of every loop iteration, before the blocking read.
    fn on_idle(&mut self) {}
}

/// A failed `start`, handing the sink back so the caller keeps ownership of
/// whatever state it carries.
pub struct StartError<S> {
    pub error: WakelinkError,
    pub sink: Option<S>,
}

impl<S> std::fmt::Debug for StartError<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartError")
            .field("error", &self.error)
            .field("sink_returned", &self.sink.is_some())
            .finish()
    }
}

pub struct CaptureEngine<S: FrameSink> {
    backend: Arc<dyn CaptureBackend>,
    effects: Arc<EffectsChain>,
    device_lock: DeviceLock,
    diagnostics: Arc<PipelineDiagnostics>,
    buffer_multiplier: usize,
    buffer_size: Option<usize>,
    /// Cleared by `stop()` or by the loop itself when the device stops.
    recording: Arc<AtomicBool>,
    worker: Option<JoinHandle<S>>,
}

impl<S: FrameSink> CaptureEngine<S> {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        effects: Arc<EffectsChain>,
        device_lock: DeviceLock,
        diagnostics: Arc<PipelineDiagnostics>,
        buffer_multiplier: usize,
    ) -> Self {
        Self {
            backend,
            effects,
            device_lock,
            diagnostics,
            buffer_multiplier: buffer_multiplier.max(1),
            buffer_size: None,
            recording: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Check the record permission and size the capture buffer.
    ///
    /// # Errors
    /// - `PermissionDenied` when the platform reports a denied grant.
    /// - Backend errors from querying the minimum buffer size.
    pub fn initialize(&mut self) -> Result<usize> {
        if !self.backend.record_permission().allows_capture() {
            return Err(WakelinkError::PermissionDenied);
        }
        let min = self.backend.min_buffer_size()?;
        if min == 0 {
            return Err(WakelinkError::DeviceInit(
                "device reported a zero minimum buffer size".into(),
            ));
        }
        let size = min * self.buffer_multiplier;
        info!(min_buffer = min, buffer_size = size, "capture initialized");
        self.buffer_size = Some(size);
        Ok(size)
    }

    pub fn is_initialized(&self) -> bool {
        self.buffer_size.is_some()
    }

    pub fn buffer_size(&self) -> Option<usize> {
        self.buffer_size
    }

    /// True while the read loop is alive and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.recording.load(Ordering::Acquire)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Open the device on a fresh capture thread and start the read loop.
    ///
    /// Blocks until the device is confirmed open (or fails). Call `stop()`
    /// first if a previous loop may have ended on its own.
    pub fn start(&mut self, sink: S) -> std::result::Result<(), StartError<S>> {
        // A loop that ended on its own still holds its sink until `stop()`.
        if self.worker.is_some() {
            return Err(StartError {
                error: WakelinkError::AlreadyRunning,
                sink: Some(sink),
            });
        }
        let Some(buffer_size) = self.buffer_size else {
            return Err(StartError {
                error: WakelinkError::NotInitialized,
                sink: Some(sink),
            });
        };

        self.recording.store(true, Ordering::Release);
        let (open_tx, open_rx) = mpsc::channel::<Result<i32>>();
        let ctx = LoopContext {
            backend: Arc::clone(&self.backend),
            effects: Arc::clone(&self.effects),
            device_lock: Arc::clone(&self.device_lock),
            diagnostics: Arc::clone(&self.diagnostics),
            recording: Arc::clone(&self.recording),
            buffer_size,
        };

        let spawned = thread::Builder::new()
            .name("wakelink-capture".into())
            .spawn(move || run_loop(ctx, sink, open_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.recording.store(false, Ordering::Release);
                return Err(StartError {
                    error: WakelinkError::DeviceInit(format!("spawn capture thread: {e}")),
                    sink: None,
                });
            }
        };

        match open_rx.recv() {
            Ok(Ok(session_id)) => {
                info!(session_id, "capture started");
                self.worker = Some(handle);
                Ok(())
            }
            Ok(Err(error)) => {
                self.recording.store(false, Ordering::Release);
                Err(StartError {
                    error,
                    sink: handle.join().ok(),
                })
            }
            Err(_) => {
                self.recording.store(false, Ordering::Release);
                Err(StartError {
                    error: WakelinkError::DeviceInit("capture thread died during open".into()),
                    sink: handle.join().ok(),
                })
            }
        }
    }

    /// Stop the loop and wait for it to release the device.
    ///
    /// A read already in flight completes first. Returns the sink, or `None`
    /// when nothing was running. Idempotent.
    pub fn stop(&mut self) -> Option<S> {
        self.recording.store(false, Ordering::Release);
        let handle = self.worker.take()?;
        match handle.join() {
            Ok(sink) => {
                info!("capture stopped");
                Some(sink)
            }
            Err(_) => {
                error!("capture thread panicked");
                None
            }
        }
    }
}

impl<S: FrameSink> Drop for CaptureEngine<S> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct LoopContext {
    backend: Arc<dyn CaptureBackend>,
    effects: Arc<EffectsChain>,
    device_lock: DeviceLock,
    diagnostics: Arc<PipelineDiagnostics>,
    recording: Arc<AtomicBool>,
    buffer_size: usize,
}

/// Releases effects, then the device, when the loop exits by any path.
struct OpenDevice {
    device: Box<dyn CaptureDevice>,
    effects: Arc<EffectsChain>,
    device_lock: DeviceLock,
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        self.effects.release();
        let _guard = self.device_lock.lock();
        if self.device.is_recording() {
            if let Err(e) = self.device.stop() {
                warn!("capture device stop failed: {e}");
            }
        }
        debug!(session_id = self.device.session().session_id, "capture device closing");
    }
}

fn open_device(ctx: &LoopContext) -> Result<OpenDevice> {
    let _guard = ctx.device_lock.lock();
    let mut device = ctx.backend.open(ctx.buffer_size)?;
    device.start()?;
    Ok(OpenDevice {
        device,
        effects: Arc::clone(&ctx.effects),
        device_lock: Arc::clone(&ctx.device_lock),
    })
}

fn run_loop<S: FrameSink>(ctx: LoopContext, mut sink: S, open_tx: mpsc::Sender<Result<i32>>) -> S {
    let mut open = match open_device(&ctx) {
        Ok(open) => open,
        Err(e) => {
            ctx.recording.store(false, Ordering::Release);
            let _ = open_tx.send(Err(e));
            return sink;
        }
    };
    let session_id = open.device.session().session_id;
    ctx.effects.attach(session_id);
    let _ = open_tx.send(Ok(session_id));

    let span = info_span!("capture", session_id);
    let _enter = span.enter();
    let poll = Duration::from_millis(device_poll_ms());
    let mut buf = vec![0u8; BYTES_PER_FRAME];

    while ctx.recording.load(Ordering::Acquire) {
        sink.on_idle();

        match open.device.read(&mut buf) {
            Ok(0) => {
                if !open.device.is_recording() {
                    break;
                }
                thread::sleep(poll);
            }
            Ok(n) => {
                let mut frame = PcmFrame::from_le_bytes(&buf[..n]);
                ctx.effects.process(frame.samples_mut());
                ctx.diagnostics
                    .frames_captured
                    .fetch_add(1, Ordering::Relaxed);
                sink.on_frame(&frame);
            }
            Err(e) => {
                ctx.diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
                if !ctx.recording.load(Ordering::Acquire) {
                    break;
                }
                warn!("capture read failed: {e}");
                thread::sleep(poll);
            }
        }

        if !open.device.is_recording() {
            info!("capture device stopped recording");
            break;
        }
    }

    ctx.recording.store(false, Ordering::Release);
    drop(open);
    info!("capture loop exited");
    sink
}
