//! Event types delivered to the host (UI / state container).
//!
//! | Event | Delivery |
//! |-------|----------|
//! | `DetectionEvent` | bounded crossbeam channel from `start_listening` |
//! | `PipelineStatusEvent` | tokio broadcast from `subscribe_status` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One keyword detection. Emitted once per utterance; the detector stream is
/// reset before the next frame is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Monotonically increasing across the engine's lifetime.
    pub seq: u64,
    pub keyword: String,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when the pipeline changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatusEvent {
    pub status: PipelineStatus,
    /// Human-readable detail, e.g. the error a caller should display.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Constructed, `initialize()` not yet called.
    Idle,
    Initializing,
    /// Initialized and not listening.
    Ready,
    Listening,
    /// Listening stopped; may be restarted.
    Stopped,
    /// Initialization, reconfiguration or recovery failed.
    Error,
}
