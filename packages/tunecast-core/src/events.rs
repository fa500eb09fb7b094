//! Intent events consumed by the orchestrator.
//!
//! Intents express "please start/stop session X". They are published on the
//! in-process [`Bus`](crate::bus::Bus) by the intake layer and consumed by
//! the orchestrator's run loop; they carry ids only, never full records.

use serde::{Deserialize, Serialize};

/// Topic carrying [`Intent::Start`] events.
pub const TOPIC_START: &str = "start-session";
/// Topic carrying [`Intent::Stop`] events.
pub const TOPIC_STOP: &str = "stop-session";

/// Request to begin playback for an already-created session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartIntent {
    pub session_id: String,
}

/// Request to end playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopIntent {
    pub session_id: String,
    /// Free-form reason recorded on the session as `stop_reason`.
    pub reason: String,
}

/// A start or stop intent; both topics share the carrier type so a single
/// bus instance serves the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Intent {
    Start(StartIntent),
    Stop(StopIntent),
}

impl Intent {
    /// The session the intent refers to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Start(i) => &i.session_id,
            Self::Stop(i) => &i.session_id,
        }
    }
}
