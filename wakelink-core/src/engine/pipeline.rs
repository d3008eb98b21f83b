//! What runs while listening.
//!
//! ```text
//! capture thread ──► CaptureSink::on_frame(frame)
//!                       ├─ try_send(frame) ──► encode queue ──► encode worker (blocking pool)
//!                       │                                          └─► broadcast<CodecFrame>
//!                       └─ DetectorBridge::submit(frame) ──► DetectionEvent channel
//!
//! CaptureSink::on_idle() applies queued CaptureCommands (keyword changes)
//! between reads, on the thread that owns the detector stream.
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    buffering::frame::PcmFrame,
    capture::FrameSink,
    codec::{CodecFrame, Transcoder},
    detector::DetectorBridge,
    error::Result,
};

/// Pipeline counters, shared by every stage.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub frames_captured: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    pub encode_failures: AtomicUsize,
    pub encode_queue_drops: AtomicUsize,
    pub frames_decoded: AtomicUsize,
    pub frames_rejected: AtomicUsize,
    pub decode_failures: AtomicUsize,
    pub detections: AtomicUsize,
    pub detections_dropped: AtomicUsize,
    pub engine_errors: AtomicUsize,
    pub playback_writes: AtomicUsize,
    pub playback_failures: AtomicUsize,
    pub reinit_attempts: AtomicUsize,
}

impl PipelineDiagnostics {
    fn counters(&self) -> [&AtomicUsize; 14] {
        [
            &self.frames_captured,
            &self.read_errors,
            &self.frames_encoded,
            &self.encode_failures,
            &self.encode_queue_drops,
            &self.frames_decoded,
            &self.frames_rejected,
            &self.decode_failures,
            &self.detections,
            &self.detections_dropped,
            &self.engine_errors,
            &self.playback_writes,
            &self.playback_failures,
            &self.reinit_attempts,
        ]
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            frames_captured: load(&self.frames_captured),
            read_errors: load(&self.read_errors),
            frames_encoded: load(&self.frames_encoded),
            encode_failures: load(&self.encode_failures),
            encode_queue_drops: load(&self.encode_queue_drops),
            frames_decoded: load(&self.frames_decoded),
            frames_rejected: load(&self.frames_rejected),
            decode_failures: load(&self.decode_failures),
            detections: load(&self.detections),
            detections_dropped: load(&self.detections_dropped),
            engine_errors: load(&self.engine_errors),
            playback_writes: load(&self.playback_writes),
            playback_failures: load(&self.playback_failures),
            reinit_attempts: load(&self.reinit_attempts),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub read_errors: usize,
    pub frames_encoded: usize,
    pub encode_failures: usize,
    pub encode_queue_drops: usize,
    pub frames_decoded: usize,
    pub frames_rejected: usize,
    pub decode_failures: usize,
    pub detections: usize,
    pub detections_dropped: usize,
    pub engine_errors: usize,
    pub playback_writes: usize,
    pub playback_failures: usize,
    pub reinit_attempts: usize,
}

/// Requests applied on the capture thread between reads.
pub enum CaptureCommand {
    Reconfigure {
        keywords: String,
        reply: Sender<Result<()>>,
    },
}

/// The capture loop's downstream: detector bridge plus encode dispatch.
pub struct CaptureSink {
    bridge: DetectorBridge,
    commands: Receiver<CaptureCommand>,
    encode_tx: Option<Sender<PcmFrame>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl CaptureSink {
    pub fn new(
        bridge: DetectorBridge,
        commands: Receiver<CaptureCommand>,
        encode_tx: Option<Sender<PcmFrame>>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            bridge,
            commands,
            encode_tx,
            diagnostics,
        }
    }

    /// Take the bridge back. Dropping the encode sender ends the encode worker.
    pub fn into_bridge(self) -> DetectorBridge {
        self.bridge
    }

    fn dispatch_encode(&mut self, frame: &PcmFrame) {
        let Some(tx) = self.encode_tx.as_ref() else {
            return;
        };
        match tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.diagnostics
                    .encode_queue_drops
                    .fetch_add(1, Ordering::Relaxed);
                debug!("encode queue full, frame dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("encode worker gone, outbound encoding disabled");
                self.encode_tx = None;
            }
        }
    }
}

impl FrameSink for CaptureSink {
    fn on_frame(&mut self, frame: &PcmFrame) {
        self.dispatch_encode(frame);
        self.bridge.submit(frame);
    }

    fn on_idle(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                CaptureCommand::Reconfigure { keywords, reply } => {
                    let result = self.bridge.reconfigure(&keywords);
                    let _ = reply.send(result);
                }
            }
        }
    }
}

/// Encode queued frames in capture order until every sender is dropped.
///
/// Frames are only encoded while someone subscribes to the outbound stream.
/// The first failure of a run rebuilds the codec and retries that frame once;
/// `on_unrecoverable` hears about it only when the rebuild itself fails.
/// Further failures are counted without another rebuild until an encode
/// succeeds.
pub fn run_encoder(
    frames: Receiver<PcmFrame>,
    transcoder: Arc<Transcoder>,
    encoded_tx: broadcast::Sender<CodecFrame>,
    diagnostics: Arc<PipelineDiagnostics>,
    on_unrecoverable: impl Fn(String),
) {
    info!(codec = transcoder.codec_name(), "encode worker started");
    let mut failing = false;
    for frame in frames.iter() {
        if encoded_tx.receiver_count() == 0 {
            continue;
        }
        let pcm = frame.to_le_bytes();
        let result = match transcoder.try_encode(&pcm) {
            Err(e) if !failing => {
                failing = true;
                diagnostics.encode_failures.fetch_add(1, Ordering::Relaxed);
                diagnostics.reinit_attempts.fetch_add(1, Ordering::Relaxed);
                warn!(samples = frame.len(), "encode failed, rebuilding codec: {e}");
                if let Err(e) = transcoder.reinitialize() {
                    error!("codec reinit after encode failure failed: {e}");
                    on_unrecoverable(format!("encoder recovery failed: {e}"));
                    continue;
                }
                transcoder.try_encode(&pcm)
            }
            other => other,
        };
        match result {
            Ok(Some(encoded)) => {
                failing = false;
                diagnostics.frames_encoded.fetch_add(1, Ordering::Relaxed);
                let _ = encoded_tx.send(encoded);
            }
            Ok(None) => {
                diagnostics.encode_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                diagnostics.encode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(samples = frame.len(), "encode failed: {e}");
            }
        }
    }
    info!("encode worker stopped");
}
