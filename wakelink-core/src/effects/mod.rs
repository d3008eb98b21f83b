//! Acoustic echo cancellation / noise suppression side-chain.
//!
//! ```text
//! EffectsProvider ──attach(session_id)──► EffectsBinding { aec?, ns? }
//!                                              │ process(&mut [i16]) per captured frame
//! EffectsChain (engine-owned) ─────────────────┘ holds the live binding + desired toggles
//! ```
//!
//! Missing hardware never fails the pipeline: an unavailable or failed
//! processor is simply absent from the binding.

pub mod software;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;

pub use software::{NoiseGate, SoftwareEffects};

/// The two processor kinds the capture session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectKind {
    EchoCanceler,
    NoiseSuppressor,
}

impl EffectKind {
    pub const ALL: [EffectKind; 2] = [EffectKind::EchoCanceler, EffectKind::NoiseSuppressor];

    pub fn short_name(self) -> &'static str {
        match self {
            EffectKind::EchoCanceler => "AEC",
            EffectKind::NoiseSuppressor => "NS",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// One processor instance bound to a capture session.
pub trait AudioEffect: Send {
    fn kind(&self) -> EffectKind;

    /// Process one frame in place. Disabled processors leave it untouched.
    fn process(&mut self, samples: &mut [i16]);

    fn set_enabled(&mut self, enabled: bool) -> Result<()>;

    fn enabled(&self) -> bool;

    /// Free any device-side resources. Called at most once.
    fn release(&mut self);
}

/// Platform capability query and processor factory.
pub trait EffectsProvider: Send + Sync + 'static {
    fn is_available(&self, kind: EffectKind) -> bool;

    fn create(&self, kind: EffectKind, session_id: i32) -> Result<Box<dyn AudioEffect>>;
}

/// Provider for platforms with no effect processors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEffects;

impl EffectsProvider for NoEffects {
    fn is_available(&self, _kind: EffectKind) -> bool {
        false
    }

    fn create(&self, kind: EffectKind, _session_id: i32) -> Result<Box<dyn AudioEffect>> {
        Err(crate::error::WakelinkError::AudioDevice(format!(
            "{kind} is not available"
        )))
    }
}

/// Requested on/off state of each processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectToggles {
    pub aec: bool,
    pub ns: bool,
}

impl EffectToggles {
    fn get(self, kind: EffectKind) -> bool {
        match kind {
            EffectKind::EchoCanceler => self.aec,
            EffectKind::NoiseSuppressor => self.ns,
        }
    }

    fn set(&mut self, kind: EffectKind, enabled: bool) {
        match kind {
            EffectKind::EchoCanceler => self.aec = enabled,
            EffectKind::NoiseSuppressor => self.ns = enabled,
        }
    }
}

/// The processors attached to one capture session.
pub struct EffectsBinding {
    session_id: i32,
    aec: Option<Box<dyn AudioEffect>>,
    ns: Option<Box<dyn AudioEffect>>,
    released: bool,
}

impl EffectsBinding {
    /// Create and enable every available processor for `session_id`.
    ///
    /// A processor that is unavailable or fails to create is left out and the
    /// binding carries on with whatever succeeded.
    pub fn attach(provider: &dyn EffectsProvider, session_id: i32, toggles: EffectToggles) -> Self {
        let mut binding = Self {
            session_id,
            aec: None,
            ns: None,
            released: false,
        };
        for kind in EffectKind::ALL {
            if !provider.is_available(kind) {
                debug!(session_id, effect = %kind, "effect not available on this device");
                continue;
            }
            match provider.create(kind, session_id) {
                Ok(mut effect) => {
                    if let Err(e) = effect.set_enabled(toggles.get(kind)) {
                        warn!(session_id, effect = %kind, "failed to set initial state: {e}");
                    }
                    info!(session_id, effect = %kind, enabled = effect.enabled(), "effect attached");
                    *binding.slot_mut(kind) = Some(effect);
                }
                Err(e) => warn!(session_id, effect = %kind, "effect creation failed: {e}"),
            }
        }
        binding
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    fn slot(&self, kind: EffectKind) -> &Option<Box<dyn AudioEffect>> {
        match kind {
            EffectKind::EchoCanceler => &self.aec,
            EffectKind::NoiseSuppressor => &self.ns,
        }
    }

    fn slot_mut(&mut self, kind: EffectKind) -> &mut Option<Box<dyn AudioEffect>> {
        match kind {
            EffectKind::EchoCanceler => &mut self.aec,
            EffectKind::NoiseSuppressor => &mut self.ns,
        }
    }

    /// Whether a processor of this kind was attached.
    pub fn has(&self, kind: EffectKind) -> bool {
        self.slot(kind).is_some()
    }

    pub fn is_enabled(&self, kind: EffectKind) -> bool {
        self.slot(kind).as_ref().is_some_and(|e| e.enabled())
    }

    /// Toggle one processor. No-op when it was never attached.
    pub fn set_enabled(&mut self, kind: EffectKind, enabled: bool) {
        let session_id = self.session_id;
        if let Some(effect) = self.slot_mut(kind) {
            match effect.set_enabled(enabled) {
                Ok(()) => debug!(session_id, effect = %kind, enabled, "effect toggled"),
                Err(e) => warn!(session_id, effect = %kind, "effect toggle failed: {e}"),
            }
        }
    }

    /// Run the attached processors over one frame: echo cancellation first.
    pub fn process(&mut self, samples: &mut [i16]) {
        if let Some(aec) = self.aec.as_mut() {
            aec.process(samples);
        }
        if let Some(ns) = self.ns.as_mut() {
            ns.process(samples);
        }
    }

    /// Release both processors. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for kind in EffectKind::ALL {
            if let Some(mut effect) = self.slot_mut(kind).take() {
                effect.release();
            }
        }
        debug!(session_id = self.session_id, "effects released");
    }
}

impl Drop for EffectsBinding {
    fn drop(&mut self) {
        self.release();
    }
}

/// Human-readable state of one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectState {
    Unsupported,
    Enabled,
    Disabled,
}

impl fmt::Display for EffectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EffectState::Unsupported => "unsupported",
            EffectState::Enabled => "enabled",
            EffectState::Disabled => "disabled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectsStatus {
    pub echo_canceler: EffectState,
    pub noise_suppressor: EffectState,
}

impl fmt::Display for EffectsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AEC: {}, NS: {}", self.echo_canceler, self.noise_suppressor)
    }
}

/// Engine-side view of the effects: availability (queried once), the toggles
/// requested by the caller, and the binding of the currently open capture
/// session, if any.
///
/// The capture thread calls [`attach`](Self::attach), [`process`](Self::process)
/// and [`release`](Self::release); toggles may arrive from any thread.
pub struct EffectsChain {
    provider: Arc<dyn EffectsProvider>,
    aec_available: bool,
    ns_available: bool,
    toggles: Mutex<EffectToggles>,
    binding: Mutex<Option<EffectsBinding>>,
}

impl EffectsChain {
    pub fn new(provider: Arc<dyn EffectsProvider>, toggles: EffectToggles) -> Self {
        let aec_available = provider.is_available(EffectKind::EchoCanceler);
        let ns_available = provider.is_available(EffectKind::NoiseSuppressor);
        info!(aec_available, ns_available, "effects capability queried");
        Self {
            provider,
            aec_available,
            ns_available,
            toggles: Mutex::new(toggles),
            binding: Mutex::new(None),
        }
    }

    pub fn is_available(&self, kind: EffectKind) -> bool {
        match kind {
            EffectKind::EchoCanceler => self.aec_available,
            EffectKind::NoiseSuppressor => self.ns_available,
        }
    }

    /// The live processor's state while a session is attached; otherwise
    /// whether it is requested and available.
    pub fn is_enabled(&self, kind: EffectKind) -> bool {
        if let Some(binding) = self.binding.lock().as_ref() {
            return binding.is_enabled(kind);
        }
        self.is_available(kind) && self.toggles.lock().get(kind)
    }

    /// Record the toggle and apply it to the live binding. Returns `false`
    /// (and changes nothing) when the processor is unavailable.
    pub fn set_enabled(&self, kind: EffectKind, enabled: bool) -> bool {
        if !self.is_available(kind) {
            debug!(effect = %kind, enabled, "ignoring toggle for unavailable effect");
            return false;
        }
        self.toggles.lock().set(kind, enabled);
        if let Some(binding) = self.binding.lock().as_mut() {
            binding.set_enabled(kind, enabled);
        }
        true
    }

    /// Attach processors to a freshly opened capture session, replacing (and
    /// releasing) any previous binding.
    pub fn attach(&self, session_id: i32) {
        let toggles = *self.toggles.lock();
        let binding = EffectsBinding::attach(self.provider.as_ref(), session_id, toggles);
        if let Some(mut previous) = self.binding.lock().replace(binding) {
            previous.release();
        }
    }

    pub fn process(&self, samples: &mut [i16]) {
        if let Some(binding) = self.binding.lock().as_mut() {
            binding.process(samples);
        }
    }

    /// Release the live binding, if any. Idempotent.
    pub fn release(&self) {
        if let Some(mut binding) = self.binding.lock().take() {
            binding.release();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.binding.lock().is_some()
    }

    pub fn status(&self) -> EffectsStatus {
        let state = |kind| {
            if !self.is_available(kind) {
                EffectState::Unsupported
            } else if self.is_enabled(kind) {
                EffectState::Enabled
            } else {
                EffectState::Disabled
            }
        };
        EffectsStatus {
            echo_canceler: state(EffectKind::EchoCanceler),
            noise_suppressor: state(EffectKind::NoiseSuppressor),
        }
    }
}
