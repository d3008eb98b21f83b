//! Streaming keyword detection.
//!
//! The keyword engine itself is external; this module only speaks its
//! streaming contract ([`KeywordSpotter`]) and owns the per-frame protocol:
//!
//! ```text
//! submit(frame)
//!   └─► accept_waveform(samples / 32768.0)
//!         while is_ready { decode_step; get_result
//!             keyword? ──► emit DetectionEvent ──► reset(stream)   (before the next frame)
//!         }
//! ```
//!
//! A [`StreamSlot::Invalid`] stream is never fed audio. `configure` treats it as
//! fatal; `reconfigure` leaves the bridge paused until a later configure or
//! reconfigure succeeds.
//!
//! The bridge is not `Sync` and is moved onto the capture thread while
//! listening, so the engine's per-stream state is only touched from there.

pub mod stub;

use std::num::NonZeroU64;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::{
    buffering::frame::PcmFrame,
    config::{clamp_threshold, FEATURE_DIM, SAMPLE_RATE},
    engine::pipeline::PipelineDiagnostics,
    error::{Result, WakelinkError},
    ipc::events::DetectionEvent,
};

pub use stub::{StubSpotter, StubSpotterFactory};

/// A live, non-null engine stream reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(NonZeroU64);

impl StreamHandle {
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// What `create_stream` handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSlot {
    Valid(StreamHandle),
    /// The engine returned a null/zero reference.
    Invalid,
}

impl StreamSlot {
    /// Classify a raw engine reference; zero is the engine's null.
    pub fn from_raw(raw: u64) -> Self {
        match NonZeroU64::new(raw) {
            Some(id) => StreamSlot::Valid(StreamHandle(id)),
            None => StreamSlot::Invalid,
        }
    }

    pub fn handle(self) -> Option<StreamHandle> {
        match self {
            StreamSlot::Valid(handle) => Some(handle),
            StreamSlot::Invalid => None,
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, StreamSlot::Valid(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordResult {
    pub keyword: Option<String>,
}

/// Feature front-end settings passed to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    pub feature_dim: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            feature_dim: FEATURE_DIM,
        }
    }
}

/// Construction-time engine settings. The threshold cannot be changed on a
/// live engine; a new one has to be built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotterConfig {
    pub feat: FeatureConfig,
    pub threshold: f32,
    pub keywords_score: f32,
}

/// Streaming contract of the external keyword engine.
///
/// Every call may fail with an engine-internal error; the bridge handles
/// them per call.
pub trait KeywordSpotter: Send {
    fn create_stream(&mut self, keywords: &str) -> Result<StreamSlot>;

    fn accept_waveform(
        &mut self,
        stream: StreamHandle,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<()>;

    fn is_ready(&mut self, stream: StreamHandle) -> Result<bool>;

    fn decode_step(&mut self, stream: StreamHandle) -> Result<()>;

    fn get_result(&mut self, stream: StreamHandle) -> Result<KeywordResult>;

    fn reset(&mut self, stream: StreamHandle) -> Result<()>;

    fn release_stream(&mut self, stream: StreamHandle);
}

/// Builds keyword engines.
pub trait SpotterFactory: Send + Sync + 'static {
    fn create(&self, config: &SpotterConfig) -> Result<Box<dyn KeywordSpotter>>;
}

pub struct DetectorBridge {
    factory: Arc<dyn SpotterFactory>,
    engine: Option<Box<dyn KeywordSpotter>>,
    stream: StreamSlot,
    keywords: String,
    config: SpotterConfig,
    events: Option<Sender<DetectionEvent>>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl DetectorBridge {
    pub fn new(
        factory: Arc<dyn SpotterFactory>,
        keywords_score: f32,
        seq: Arc<AtomicU64>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            factory,
            engine: None,
            stream: StreamSlot::Invalid,
            keywords: String::new(),
            config: SpotterConfig {
                feat: FeatureConfig::default(),
                threshold: crate::config::DEFAULT_THRESHOLD,
                keywords_score,
            },
            events: None,
            seq,
            diagnostics,
        }
    }

    /// Build the engine with `threshold` and open one stream for `keywords`.
    ///
    /// # Errors
    /// `EngineConfig` when the engine hands back a null stream. The bridge is
    /// left unconfigured in that case. The keywords are recorded either way so
    /// a later rebuild retries the requested set.
    pub fn configure(&mut self, keywords: &str, threshold: f32) -> Result<()> {
        self.release();
        self.config.threshold = clamp_threshold(threshold);
        self.keywords = keywords.to_string();

        let mut engine = self.factory.create(&self.config)?;
        let created = engine.create_stream(keywords);
        // Kept without a stream so `reconfigure` can recover.
        self.engine = Some(engine);
        match created? {
            StreamSlot::Valid(handle) => {
                info!(
                    keywords,
                    threshold = self.config.threshold,
                    stream = handle.get(),
                    "keyword engine configured"
                );
                self.stream = StreamSlot::Valid(handle);
                Ok(())
            }
            StreamSlot::Invalid => Err(WakelinkError::EngineConfig(format!(
                "engine returned a null stream for keywords '{keywords}'"
            ))),
        }
    }

    /// Swap the stream for one bound to `keywords`, releasing the old stream.
    ///
    /// On failure the bridge stays alive with no stream: `submit` becomes a
    /// no-op until a later (re)configure succeeds.
    pub fn reconfigure(&mut self, keywords: &str) -> Result<()> {
        self.keywords = keywords.to_string();
        let Some(engine) = self.engine.as_mut() else {
            return self.configure(keywords, self.config.threshold);
        };
        let created = engine.create_stream(keywords);
        if let StreamSlot::Valid(old) = std::mem::replace(&mut self.stream, StreamSlot::Invalid) {
            engine.release_stream(old);
        }
        match created {
            Ok(StreamSlot::Valid(handle)) => {
                info!(keywords, stream = handle.get(), "keywords reconfigured");
                self.stream = StreamSlot::Valid(handle);
                Ok(())
            }
            Ok(StreamSlot::Invalid) => {
                warn!(keywords, "reconfigure produced a null stream, detection paused");
                Err(WakelinkError::EngineConfig(format!(
                    "engine returned a null stream for keywords '{keywords}'"
                )))
            }
            Err(e) => {
                warn!(keywords, "reconfigure failed, detection paused: {e}");
                Err(e)
            }
        }
    }

    /// Rebuild the engine with a new threshold for the last requested
    /// keywords, whether or not they configured successfully.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<()> {
        let keywords = self.keywords.clone();
        self.configure(&keywords, threshold)
    }

    pub fn set_keywords_score(&mut self, keywords_score: f32) {
        self.config.keywords_score = keywords_score;
    }

    /// Route detections into `tx`. Replaces any previous sender.
    pub fn attach_events(&mut self, tx: Sender<DetectionEvent>) {
        self.events = Some(tx);
    }

    pub fn detach_events(&mut self) {
        self.events = None;
    }

    pub fn is_configured(&self) -> bool {
        self.engine.is_some() && self.stream.is_valid()
    }

    pub fn stream(&self) -> StreamSlot {
        self.stream
    }

    pub fn keywords(&self) -> &str {
        &self.keywords
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Feed one captured frame and drain every ready result.
    ///
    /// Returns the number of detections emitted. Empty frames and an invalid
    /// stream are silent no-ops.
    pub fn submit(&mut self, frame: &PcmFrame) -> usize {
        if frame.is_empty() {
            return 0;
        }
        let (Some(engine), StreamSlot::Valid(handle)) = (self.engine.as_mut(), self.stream) else {
            return 0;
        };

        let samples = frame.to_normalized();
        if let Err(e) = engine.accept_waveform(handle, &samples, SAMPLE_RATE) {
            self.diagnostics.engine_errors.fetch_add(1, Ordering::Relaxed);
            warn!("accept_waveform failed: {e}");
            return 0;
        }

        let mut detections = 0;
        loop {
            match engine.is_ready(handle) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.diagnostics.engine_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("is_ready failed: {e}");
                    break;
                }
            }
            if let Err(e) = engine.decode_step(handle) {
                self.diagnostics.engine_errors.fetch_add(1, Ordering::Relaxed);
                warn!("decode_step failed: {e}");
                break;
            }
            let result = match engine.get_result(handle) {
                Ok(result) => result,
                Err(e) => {
                    self.diagnostics.engine_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("get_result failed: {e}");
                    break;
                }
            };
            let Some(keyword) = result.keyword.filter(|k| !k.trim().is_empty()) else {
                continue;
            };

            detections += 1;
            emit(
                self.events.as_ref(),
                &self.seq,
                &self.diagnostics,
                keyword,
            );
            // Detected → Listening: reset before anything else touches the stream.
            if let Err(e) = engine.reset(handle) {
                self.diagnostics.engine_errors.fetch_add(1, Ordering::Relaxed);
                warn!("stream reset after detection failed: {e}");
            }
        }
        detections
    }

    /// Release the stream and the engine. Idempotent.
    pub fn release(&mut self) {
        let stream = std::mem::replace(&mut self.stream, StreamSlot::Invalid);
        if let Some(mut engine) = self.engine.take() {
            if let StreamSlot::Valid(handle) = stream {
                engine.release_stream(handle);
            }
            debug!("keyword engine released");
        }
    }
}

impl Drop for DetectorBridge {
    fn drop(&mut self) {
        self.release();
    }
}

fn emit(
    events: Option<&Sender<DetectionEvent>>,
    seq: &AtomicU64,
    diagnostics: &PipelineDiagnostics,
    keyword: String,
) {
    let event = DetectionEvent {
        seq: seq.fetch_add(1, Ordering::Relaxed),
        keyword,
        timestamp: Utc::now(),
    };
    diagnostics.detections.fetch_add(1, Ordering::Relaxed);
    info!(keyword = event.keyword.as_str(), seq = event.seq, "keyword detected");

    let Some(tx) = events else {
        return;
    };
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            diagnostics
                .detections_dropped
                .fetch_add(1, Ordering::Relaxed);
            warn!(seq = event.seq, "detection channel full, event dropped");
        }
        Err(TrySendError::Disconnected(_)) => {
            debug!("detection receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_raw_reference_is_invalid() {
        assert_eq!(StreamSlot::from_raw(0), StreamSlot::Invalid);
        assert_eq!(StreamSlot::from_raw(5).handle().map(StreamHandle::get), Some(5));
    }

    #[test]
    fn feature_config_defaults_to_pipeline_format() {
        let feat = FeatureConfig::default();
        assert_eq!(feat.sample_rate, 16_000);
        assert_eq!(feat.feature_dim, 80);
    }
}
