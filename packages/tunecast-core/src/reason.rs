//! Failure classification.
//!
//! Every per-session failure is folded into the closed [`ReasonCode`] enum
//! plus a sanitized single-line detail string. The classifier probes typed
//! sentinel errors first and only falls back to string capture for truly
//! unknown failures, so downstream consumers never have to string-match.

use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transcoder::TranscodeError;
use crate::tuner::TunerError;

/// Maximum length of a stored or logged detail string.
pub const MAX_DETAIL_LEN: usize = 256;

/// Closed vocabulary of session failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    #[default]
    None,
    LeaseBusy,
    TuneTimeout,
    TuneFailed,
    FfmpegStartFailed,
    ProcessEnded,
    PackagerFailed,
    UpstreamCorrupt,
    ClientStop,
    IdleTimeout,
    LeaseExpired,
    InvariantViolation,
    NotFound,
    BadRequest,
    Unknown,
}

impl ReasonCode {
    /// Stable lowercase name used as a metric label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::LeaseBusy => "lease_busy",
            Self::TuneTimeout => "tune_timeout",
            Self::TuneFailed => "tune_failed",
            Self::FfmpegStartFailed => "ffmpeg_start_failed",
            Self::ProcessEnded => "process_ended",
            Self::PackagerFailed => "packager_failed",
            Self::UpstreamCorrupt => "upstream_corrupt",
            Self::ClientStop => "client_stop",
            Self::IdleTimeout => "idle_timeout",
            Self::LeaseExpired => "lease_expired",
            Self::InvariantViolation => "invariant_violation",
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a session that failed for this reason ends in `STOPPED`
    /// rather than `FAILED` (deliberate stops are not failures).
    #[must_use]
    pub fn stops_cleanly(&self) -> bool {
        matches!(self, Self::ClientStop | Self::IdleTimeout)
    }
}

/// A classified per-session failure.
///
/// `source` is retained for logs only; it is never persisted and never
/// surfaced to API callers.
#[derive(Debug, Error)]
#[error("{}: {detail}", code.as_str())]
pub struct ReasonError {
    pub code: ReasonCode,
    pub detail: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl ReasonError {
    pub fn new(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: sanitize_detail(&detail.into()),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Collapses control characters and bounds the length of a detail string.
///
/// Any run of `\r`, `\n` or `\t` becomes a single space, so details are
/// always safe to embed in a single log line or JSON response.
#[must_use]
pub fn sanitize_detail(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_DETAIL_LEN));
    let mut in_gap = false;
    for ch in raw.chars() {
        if matches!(ch, '\r' | '\n' | '\t') {
            if !in_gap {
                out.push(' ');
                in_gap = true;
            }
        } else {
            out.push(ch);
            in_gap = false;
        }
        if out.len() >= MAX_DETAIL_LEN {
            break;
        }
    }
    out.truncate(MAX_DETAIL_LEN);
    out
}

/// Maps a heterogeneous error to a reason code and sanitized detail.
///
/// Probes the error chain for typed sentinels (tuner readiness, upstream
/// availability, cancellation, process exit) before falling back to
/// `UNKNOWN` with the error's display string.
#[must_use]
pub fn classify(err: &(dyn StdError + 'static)) -> (ReasonCode, String) {
    let mut cursor: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cursor {
        if let Some(t) = e.downcast_ref::<TunerError>() {
            return classify_tuner(t);
        }
        if let Some(t) = e.downcast_ref::<TranscodeError>() {
            return classify_transcode(t);
        }
        if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return (ReasonCode::TuneTimeout, "deadline exceeded".to_string());
        }
        cursor = e.source();
    }
    (ReasonCode::Unknown, sanitize_detail(&err.to_string()))
}

fn classify_tuner(err: &TunerError) -> (ReasonCode, String) {
    match err {
        TunerError::ReadyTimeout => (
            ReasonCode::TuneTimeout,
            "tuner not ready within budget".to_string(),
        ),
        TunerError::UpstreamUnavailable(detail) => {
            (ReasonCode::TuneFailed, sanitize_detail(detail))
        }
        TunerError::Canceled => (ReasonCode::ClientStop, "tune canceled".to_string()),
        TunerError::Other(detail) => (ReasonCode::TuneFailed, sanitize_detail(detail)),
    }
}

fn classify_transcode(err: &TranscodeError) -> (ReasonCode, String) {
    match err {
        TranscodeError::ProcessExit(code) => {
            (ReasonCode::ProcessEnded, format!("process exit code {code}"))
        }
        TranscodeError::Spawn(detail) => {
            (ReasonCode::FfmpegStartFailed, sanitize_detail(detail))
        }
        other => (ReasonCode::Unknown, sanitize_detail(&other.to_string())),
    }
}
