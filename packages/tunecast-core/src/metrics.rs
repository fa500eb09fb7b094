//! Metrics sink.
//!
//! Typed facade over the `metrics` crate. The label vocabulary is closed:
//! every label name used anywhere in this module is listed in
//! `EMITTED_LABELS`, and a const assertion fails the build if that list
//! ever intersects the forbidden high-cardinality set. Label values are
//! normalized through allowlists so unknown strings fold to `unknown`.

use metrics::{counter, histogram};

use crate::reason::ReasonCode;
use crate::session::SessionState;
use crate::transcoder::ExitReason;

/// High-cardinality labels that must never be emitted.
pub const FORBIDDEN_LABELS: [&str; 4] =
    ["request_id", "session_id", "recording_id", "service_ref"];

/// Every label name this module emits.
const EMITTED_LABELS: [&str; 10] = [
    "result",
    "reason_class",
    "profile",
    "reason",
    "outcome",
    "topic",
    "state_from",
    "state_to",
    "op",
    "signal",
];

const fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn labels_disjoint() -> bool {
    let mut i = 0;
    while i < EMITTED_LABELS.len() {
        let mut j = 0;
        while j < FORBIDDEN_LABELS.len() {
            if bytes_eq(EMITTED_LABELS[i].as_bytes(), FORBIDDEN_LABELS[j].as_bytes()) {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(labels_disjoint(), "forbidden metric label in use");

/// Profile names accepted as label values; anything else folds to `unknown`.
const PROFILE_ALLOWLIST: [&str; 5] = ["hd", "sd", "copy", "vod_hd", "audio_only"];

/// Normalizes a profile name for use as a label value.
#[must_use]
pub fn normalize_profile(name: &str) -> &'static str {
    for known in PROFILE_ALLOWLIST {
        if known == name {
            return known;
        }
    }
    "unknown"
}

/// Outcome label for `session_starts_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    Success,
    Fail,
    Busy,
    Cancel,
}

impl StartResult {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Busy => "busy",
            Self::Cancel => "cancel",
        }
    }
}

/// Outcome label for readiness metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Success,
    Timeout,
    Canceled,
    Other,
}

impl ReadyOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Other => "other",
        }
    }
}

/// Why a bus message was dropped for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDropReason {
    Timeout,
    Canceled,
    ContextDone,
}

impl BusDropReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::ContextDone => "context_done",
        }
    }
}

/// Disposition of a transcoder termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    PoliteSent,
    AlreadyGone,
    ForceKill,
}

impl TermSignal {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PoliteSent => "polite_sent",
            Self::AlreadyGone => "already_gone",
            Self::ForceKill => "force_kill",
        }
    }
}

pub fn record_session_start(result: StartResult, reason: ReasonCode, profile: &str) {
    counter!(
        "session_starts_total",
        "result" => result.as_str(),
        "reason_class" => reason.as_str(),
        "profile" => normalize_profile(profile)
    )
    .increment(1);
}

/// Separate from `session_starts_total` so capacity pressure is visible
/// without being mixed into failure rates.
pub fn record_capacity_rejection(reason: ReasonCode, profile: &str) {
    counter!(
        "capacity_rejections_total",
        "reason" => reason.as_str(),
        "profile" => normalize_profile(profile)
    )
    .increment(1);
}

pub fn observe_ready_duration(outcome: ReadyOutcome, secs: f64) {
    histogram!("ready_duration_seconds", "outcome" => outcome.as_str()).record(secs);
    counter!("ready_outcome_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn observe_first_playlist(profile: &str, secs: f64) {
    histogram!(
        "time_to_first_playlist_seconds",
        "profile" => normalize_profile(profile)
    )
    .record(secs);
}

pub fn observe_first_segment(profile: &str, secs: f64) {
    histogram!(
        "time_to_first_segment_seconds",
        "profile" => normalize_profile(profile)
    )
    .record(secs);
}

pub fn record_session_end(reason: ReasonCode, profile: &str) {
    counter!(
        "session_end_total",
        "reason" => reason.as_str(),
        "profile" => normalize_profile(profile)
    )
    .increment(1);
}

pub fn record_fsm_transition(from: SessionState, to: SessionState) {
    counter!(
        "fsm_transitions_total",
        "state_from" => from.as_str(),
        "state_to" => to.as_str()
    )
    .increment(1);
}

pub fn record_bus_drop(topic: &'static str, reason: BusDropReason) {
    counter!("bus_drop_total", "topic" => topic).increment(1);
    counter!(
        "bus_dropped_total",
        "topic" => topic,
        "reason" => reason.as_str()
    )
    .increment(1);
}

pub fn record_lease_lost() {
    counter!("lease_lost_total").increment(1);
}

pub fn record_term_signal(signal: TermSignal) {
    counter!("transcoder_term_signal_total", "signal" => signal.as_str()).increment(1);
}

pub fn record_wait_outcome(reason: ExitReason) {
    counter!("transcoder_wait_total", "outcome" => reason.as_str()).increment(1);
}

pub fn record_store_op(op: &'static str, ok: bool, secs: f64) {
    counter!(
        "store_ops_total",
        "op" => op,
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
    histogram!("store_op_duration_seconds", "op" => op).record(secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_labels_avoid_forbidden_set() {
        for label in EMITTED_LABELS {
            assert!(
                !FORBIDDEN_LABELS.contains(&label),
                "{label} is a forbidden label"
            );
        }
    }

    #[test]
    fn unknown_profiles_fold() {
        assert_eq!(normalize_profile("hd"), "hd");
        assert_eq!(normalize_profile("vod_hd"), "vod_hd");
        assert_eq!(normalize_profile("session-12345"), "unknown");
        assert_eq!(normalize_profile(""), "unknown");
    }

    #[test]
    fn label_values_are_lowercase_tokens() {
        for v in [
            StartResult::Success.as_str(),
            ReadyOutcome::Timeout.as_str(),
            BusDropReason::ContextDone.as_str(),
            TermSignal::ForceKill.as_str(),
        ] {
            assert!(v
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn recording_metrics_does_not_panic_without_recorder() {
        record_session_start(StartResult::Fail, ReasonCode::TuneTimeout, "hd");
        record_capacity_rejection(ReasonCode::LeaseBusy, "hd");
        observe_ready_duration(ReadyOutcome::Success, 1.5);
        record_fsm_transition(SessionState::New, SessionState::Starting);
        record_bus_drop("start-session", BusDropReason::Timeout);
        record_lease_lost();
    }
}
