//! `StubSpotter`: placeholder keyword engine driven by signal energy.
//!
//! Stands in for a neural keyword spotter so the full capture → detect →
//! event path can run end-to-end without model files. It "hears" its keyword
//! when enough consecutive 60 ms windows are loud; silence never triggers.
//!
//! Loudness is judged against `threshold × 0.4` RMS, so raising the
//! threshold makes the stub harder to trigger, like a real engine.

use std::collections::HashMap;

use tracing::debug;

use super::{
    KeywordResult, KeywordSpotter, SpotterConfig, SpotterFactory, StreamHandle, StreamSlot,
};
use crate::{
    config::SAMPLES_PER_FRAME,
    error::{Result, WakelinkError},
};

/// Loud windows in a row that count as one utterance (≈ 180 ms).
const DEFAULT_TRIGGER_WINDOWS: u32 = 3;

#[derive(Debug, Default)]
struct StubStream {
    keyword: String,
    pending: Vec<f32>,
    loud_run: u32,
    /// Set by `decode_step`, taken by `get_result`.
    hit: bool,
}

pub struct StubSpotter {
    config: SpotterConfig,
    trigger_windows: u32,
    next_id: u64,
    streams: HashMap<u64, StubStream>,
}

impl StubSpotter {
    pub fn new(config: SpotterConfig) -> Self {
        Self {
            config,
            trigger_windows: DEFAULT_TRIGGER_WINDOWS,
            next_id: 1,
            streams: HashMap::new(),
        }
    }

    pub fn with_trigger_windows(mut self, windows: u32) -> Self {
        self.trigger_windows = windows.max(1);
        self
    }

    fn trigger_rms(&self) -> f32 {
        self.config.threshold * 0.4
    }

    fn stream_mut(&mut self, handle: StreamHandle) -> Result<&mut StubStream> {
        self.streams
            .get_mut(&handle.get())
            .ok_or_else(|| WakelinkError::Engine(format!("unknown stream {}", handle.get())))
    }

    fn rms(window: &[f32]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        (window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32).sqrt()
    }
}

impl KeywordSpotter for StubSpotter {
    /// Blank keyword specs produce a null stream.
    fn create_stream(&mut self, keywords: &str) -> Result<StreamSlot> {
        let keyword = keywords.split('/').next().unwrap_or_default().trim();
        if keyword.is_empty() {
            return Ok(StreamSlot::from_raw(0));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.streams.insert(
            id,
            StubStream {
                keyword: keyword.to_string(),
                ..StubStream::default()
            },
        );
        debug!(stream = id, keyword, "stub stream created");
        Ok(StreamSlot::from_raw(id))
    }

    fn accept_waveform(
        &mut self,
        stream: StreamHandle,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<()> {
        if sample_rate != self.config.feat.sample_rate {
            return Err(WakelinkError::Engine(format!(
                "stub expects {} Hz, got {sample_rate}",
                self.config.feat.sample_rate
            )));
        }
        self.stream_mut(stream)?.pending.extend_from_slice(samples);
        Ok(())
    }

    fn is_ready(&mut self, stream: StreamHandle) -> Result<bool> {
        Ok(self.stream_mut(stream)?.pending.len() >= SAMPLES_PER_FRAME)
    }

    fn decode_step(&mut self, stream: StreamHandle) -> Result<()> {
        let trigger_rms = self.trigger_rms();
        let trigger_windows = self.trigger_windows;
        let state = self.stream_mut(stream)?;
        if state.pending.len() < SAMPLES_PER_FRAME {
            return Ok(());
        }
        let window: Vec<f32> = state.pending.drain(..SAMPLES_PER_FRAME).collect();
        if Self::rms(&window) >= trigger_rms {
            state.loud_run += 1;
        } else {
            state.loud_run = 0;
        }
        if state.loud_run >= trigger_windows {
            state.hit = true;
        }
        Ok(())
    }

    fn get_result(&mut self, stream: StreamHandle) -> Result<KeywordResult> {
        let state = self.stream_mut(stream)?;
        if std::mem::take(&mut state.hit) {
            Ok(KeywordResult {
                keyword: Some(state.keyword.clone()),
            })
        } else {
            Ok(KeywordResult::default())
        }
    }

    fn reset(&mut self, stream: StreamHandle) -> Result<()> {
        let state = self.stream_mut(stream)?;
        state.pending.clear();
        state.loud_run = 0;
        state.hit = false;
        Ok(())
    }

    fn release_stream(&mut self, stream: StreamHandle) {
        self.streams.remove(&stream.get());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StubSpotterFactory {
    pub trigger_windows: u32,
}

impl Default for StubSpotterFactory {
    fn default() -> Self {
        Self {
            trigger_windows: DEFAULT_TRIGGER_WINDOWS,
        }
    }
}

impl SpotterFactory for StubSpotterFactory {
    fn create(&self, config: &SpotterConfig) -> Result<Box<dyn KeywordSpotter>> {
        debug!(
            threshold = config.threshold,
            feature_dim = config.feat.feature_dim,
            "creating stub keyword spotter"
        );
        Ok(Box::new(
            StubSpotter::new(*config).with_trigger_windows(self.trigger_windows),
        ))
    }
}
