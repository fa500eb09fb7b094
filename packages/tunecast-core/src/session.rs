//! Session data model.
//!
//! [`SessionRecord`] is the system of record for one playback attempt. It is
//! owned exclusively by the state store; every caller receives a defensive
//! copy and all mutations go through the store's atomic update closure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::reason::ReasonCode;
use crate::utils::now_unix;

/// Well-known keys in [`SessionRecord::context`].
pub mod context_keys {
    /// Playback mode: `LIVE` or `RECORDING`.
    pub const MODE: &str = "mode";
    /// Playback source for recordings (HTTP URL or absolute file path).
    pub const SOURCE: &str = "source";
    /// Coarse source classification for logs (`url`, `file`).
    pub const SOURCE_TYPE: &str = "source_type";
    /// Tuner slot held by a LIVE session, as a decimal integer.
    pub const TUNER_SLOT: &str = "tuner_slot";
    /// Optional start offset for seekable sources, in milliseconds.
    pub const START_MS: &str = "start_ms";
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    New,
    Starting,
    Priming,
    Ready,
    /// Completed VOD playback; output is retained for the DVR window.
    Draining,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Terminal states accept no further transitions except an idempotent
    /// re-entry of `Stopping`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Stable lowercase name used as a metric label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Priming => "priming",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// State of the external transcode pipeline attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    #[default]
    Idle,
    Running,
    StopRequested,
    Stopped,
    Fail,
}

/// Playback mode derived from the session context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Live,
    Recording,
}

impl SessionMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Recording => "RECORDING",
        }
    }
}

/// Output container for packaged segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    /// MPEG-TS segments (`.ts`), the legacy-compatible default.
    #[default]
    MpegTs,
    /// Fragmented MP4 segments (`.m4s` plus `init.mp4`).
    Fmp4,
}

/// Encoding and packaging parameters attached to a session.
///
/// Profiles are immutable once attached; the repair path swaps in a whole
/// replacement profile rather than mutating fields in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamProfile {
    /// Preset name (`hd`, `sd`, `copy`, ...). Folded through the metrics
    /// allowlist before use as a label.
    pub name: String,
    /// Target video codec when transcoding (`h264`, `hevc`).
    pub video_codec: String,
    pub container: Container,
    /// Segment duration in seconds.
    pub segment_duration_secs: u32,
    /// Trailing DVR window retained on disk, in seconds. 0 = event playlist.
    pub dvr_window_secs: u32,
    /// Finite recording played to completion (`#EXT-X-ENDLIST` expected).
    pub vod: bool,
    pub ll_hls: bool,
    pub deinterlace: bool,
    /// Re-encode video; when false the video stream is copied.
    pub transcode_video: bool,
    /// Re-encode audio to AAC; when false the audio stream is copied.
    pub transcode_audio: bool,
    pub audio_bitrate_k: u32,
    /// CRF used for software video encodes.
    pub crf: u32,
    /// Downscale bound; 0 = keep source width.
    pub video_max_width: u32,
}

impl StreamProfile {
    /// The `hd` preset: full H.264 transcode with AAC audio.
    #[must_use]
    pub fn hd() -> Self {
        Self {
            name: "hd".to_string(),
            video_codec: "h264".to_string(),
            container: Container::MpegTs,
            segment_duration_secs: 4,
            dvr_window_secs: 1800,
            vod: false,
            ll_hls: false,
            deinterlace: true,
            transcode_video: true,
            transcode_audio: true,
            audio_bitrate_k: 160,
            crf: 21,
            video_max_width: 1920,
        }
    }

    /// The `sd` preset: bandwidth-constrained transcode.
    #[must_use]
    pub fn sd() -> Self {
        Self {
            name: "sd".to_string(),
            video_max_width: 720,
            crf: 26,
            audio_bitrate_k: 128,
            ..Self::hd()
        }
    }

    /// The `copy` preset: passthrough video, transcoded AAC audio.
    #[must_use]
    pub fn copy() -> Self {
        Self {
            name: "copy".to_string(),
            transcode_video: false,
            deinterlace: false,
            ..Self::hd()
        }
    }

    /// The `vod_hd` preset: finite recording playback.
    #[must_use]
    pub fn vod_hd() -> Self {
        Self {
            name: "vod_hd".to_string(),
            vod: true,
            dvr_window_secs: 0,
            ..Self::hd()
        }
    }

    /// Segment file extension implied by the profile.
    #[must_use]
    pub fn segment_extension(&self) -> &'static str {
        if self.ll_hls || self.container == Container::Fmp4 {
            "m4s"
        } else {
            "ts"
        }
    }
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self::hd()
    }
}

/// System of record for one playback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque unique id. Validated against the safe charset before any
    /// filesystem path is derived from it.
    pub session_id: String,
    /// Receiver service reference, or a direct HTTP URL for recordings.
    pub service_ref: String,
    /// Propagated to logs and traces; never used as a metric label.
    pub correlation_id: String,
    pub profile: StreamProfile,
    pub state: SessionState,
    pub pipeline_state: PipelineState,
    pub reason: ReasonCode,
    /// Sanitized single-line detail safe to surface to API callers.
    pub reason_detail: String,
    /// Free-form reason carried by external stop events.
    pub stop_reason: String,
    /// Mode, recording source and tuner slot; see [`context_keys`].
    pub context: BTreeMap<String, String>,
    pub lease_expires_at_unix: i64,
    pub updated_at_unix: i64,
    pub last_access_unix: i64,
}

impl SessionRecord {
    /// Creates a fresh record in `NEW` with the given identity.
    pub fn new(session_id: impl Into<String>, service_ref: impl Into<String>, profile: StreamProfile) -> Self {
        let now = now_unix();
        Self {
            session_id: session_id.into(),
            service_ref: service_ref.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            profile,
            state: SessionState::New,
            pipeline_state: PipelineState::Idle,
            reason: ReasonCode::None,
            reason_detail: String::new(),
            stop_reason: String::new(),
            context: BTreeMap::new(),
            lease_expires_at_unix: 0,
            updated_at_unix: now,
            last_access_unix: now,
        }
    }

    /// Playback mode; absent or unrecognized context defaults to LIVE.
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        match self.context.get(context_keys::MODE).map(String::as_str) {
            Some("RECORDING") => SessionMode::Recording,
            _ => SessionMode::Live,
        }
    }

    /// Recording playback source, when one was provided by intake.
    #[must_use]
    pub fn recording_source(&self) -> Option<&str> {
        self.context
            .get(context_keys::SOURCE)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Start offset in milliseconds for seekable sources.
    #[must_use]
    pub fn start_ms(&self) -> u64 {
        self.context
            .get(context_keys::START_MS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Tuner slot recorded for a LIVE session, when held.
    #[must_use]
    pub fn tuner_slot(&self) -> Option<u32> {
        self.context
            .get(context_keys::TUNER_SLOT)
            .and_then(|v| v.parse().ok())
    }

    /// Stamps `updated_at_unix` with the current time.
    pub fn touch(&mut self) {
        self.updated_at_unix = now_unix();
    }
}
