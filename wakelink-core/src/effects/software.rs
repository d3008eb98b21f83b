//! Portable software effects for hosts without platform processors.
//!
//! Only noise suppression is offered, as an RMS noise gate with hangover:
//!
//! 1. Compute RMS of the frame (normalised to [-1, 1)).
//! 2. RMS ≥ `threshold` → gate open, hangover counter reset.
//! 3. RMS < `threshold` and hangover counter > 0 → gate stays open, counter
//!    decremented (keeps syllable endings).
//! 4. Otherwise the frame is attenuated by `floor_gain`.
//!
//! Echo cancellation needs a far-end reference this layer never sees, so it is
//! reported as unavailable.

use tracing::debug;

use super::{AudioEffect, EffectKind, EffectsProvider};
use crate::error::{Result, WakelinkError};

#[derive(Debug, Clone)]
pub struct NoiseGate {
    /// RMS level at which the gate opens. Typical range: 0.005–0.03.
    threshold: f32,
    /// Below-threshold frames that still pass after the gate was open.
    hangover_frames: u32,
    hangover_counter: u32,
    /// Gain applied while the gate is closed.
    floor_gain: f32,
    enabled: bool,
}

impl NoiseGate {
    pub fn new(threshold: f32, hangover_frames: u32, floor_gain: f32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
            floor_gain: floor_gain.clamp(0.0, 1.0),
            enabled: true,
        }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples
            .iter()
            .map(|&s| {
                let v = s as f32 / 32768.0;
                v * v
            })
            .sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// Whether the next frame with this RMS passes unattenuated.
    fn open_for(&mut self, rms: f32) -> bool {
        if rms >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            true
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for NoiseGate {
    /// Hangover of 3 frames ≈ 180 ms at 60 ms per frame.
    fn default() -> Self {
        Self::new(0.008, 3, 0.125)
    }
}

impl AudioEffect for NoiseGate {
    fn kind(&self) -> EffectKind {
        EffectKind::NoiseSuppressor
    }

    fn process(&mut self, samples: &mut [i16]) {
        if !self.enabled || samples.is_empty() {
            return;
        }
        if self.open_for(Self::rms(samples)) {
            return;
        }
        for s in samples.iter_mut() {
            *s = (*s as f32 * self.floor_gain) as i16;
        }
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        self.enabled = enabled;
        if !enabled {
            self.hangover_counter = 0;
        }
        Ok(())
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn release(&mut self) {
        self.enabled = false;
        self.hangover_counter = 0;
    }
}

/// Provider backed by [`NoiseGate`].
#[derive(Debug, Clone)]
pub struct SoftwareEffects {
    gate: NoiseGate,
}

impl SoftwareEffects {
    pub fn new(gate: NoiseGate) -> Self {
        Self { gate }
    }
}

impl Default for SoftwareEffects {
    fn default() -> Self {
        Self::new(NoiseGate::default())
    }
}

impl EffectsProvider for SoftwareEffects {
    fn is_available(&self, kind: EffectKind) -> bool {
        kind == EffectKind::NoiseSuppressor
    }

    fn create(&self, kind: EffectKind, session_id: i32) -> Result<Box<dyn AudioEffect>> {
        match kind {
            EffectKind::NoiseSuppressor => {
                debug!(session_id, "creating software noise gate");
                Ok(Box::new(self.gate.clone()))
            }
            EffectKind::EchoCanceler => Err(WakelinkError::AudioDevice(
                "software echo cancellation is not supported".into(),
            )),
        }
    }
}
