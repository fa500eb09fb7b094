//! Playlist readiness probing.
//!
//! A session becomes READY when its playlist is valid and at least one
//! referenced segment exists on disk with content. The checks are pure
//! functions over the output directory so the policy is testable without a
//! transcoder; the async poll loop wraps them with a budget and
//! cancellation.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::layout::{any_segment_on_disk, safe_segment_name, PLAYLIST_NAME};

const EXTM3U_HEADER: &str = "#EXTM3U";
const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("playlist not ready within budget")]
    TimedOut {
        /// Whether any non-empty segment file existed at the deadline;
        /// drives the corruption-vs-packager classification.
        any_segment: bool,
    },
    #[error("readiness poll canceled")]
    Canceled,
}

/// One probe of the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistCheck {
    /// The playlist file exists with content.
    pub playlist_seen: bool,
    /// The playlist is valid and a referenced segment is on disk.
    pub ready: bool,
}

/// Timing of a successful readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct ReadyStats {
    /// Elapsed time until the playlist first appeared on disk.
    pub first_playlist: Option<Duration>,
    /// Elapsed time until the readiness condition held.
    pub elapsed: Duration,
}

/// Extracts segment references (non-comment lines) from playlist text,
/// dropping anything that could escape the session directory.
#[must_use]
pub fn segment_refs(playlist: &str) -> Vec<&str> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| safe_segment_name(line))
        .collect()
}

/// Probes a session output directory once.
///
/// Non-VOD: the playlist must carry the `#EXTM3U` header and reference at
/// least one segment that exists on disk with size > 0. VOD additionally
/// requires `#EXT-X-ENDLIST` and checks the LAST referenced segment, since
/// earlier ones may already be rotated out of a long recording.
#[must_use]
pub fn check_playlist(dir: &Path, vod: bool) -> PlaylistCheck {
    let not_ready = |playlist_seen| PlaylistCheck {
        playlist_seen,
        ready: false,
    };

    let Ok(content) = std::fs::read_to_string(dir.join(PLAYLIST_NAME)) else {
        return not_ready(false);
    };
    if content.is_empty() {
        return not_ready(false);
    }
    if !content.contains(EXTM3U_HEADER) {
        return not_ready(true);
    }
    if vod && !content.contains(ENDLIST_TAG) {
        return not_ready(true);
    }

    let refs = segment_refs(&content);
    let candidates: Vec<&str> = if vod {
        refs.last().copied().into_iter().collect()
    } else {
        refs
    };

    let ready = candidates.iter().any(|name| {
        dir.join(name)
            .metadata()
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    });

    PlaylistCheck {
        playlist_seen: true,
        ready,
    }
}

/// Polls until the playlist is ready, the budget elapses, or `cancel`
/// fires.
pub async fn await_ready(
    dir: &Path,
    vod: bool,
    budget: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<ReadyStats, ReadinessError> {
    let started = Instant::now();
    let mut first_playlist = None;

    loop {
        if cancel.is_cancelled() {
            return Err(ReadinessError::Canceled);
        }

        let check = check_playlist(dir, vod);
        if check.playlist_seen && first_playlist.is_none() {
            first_playlist = Some(started.elapsed());
        }
        if check.ready {
            return Ok(ReadyStats {
                first_playlist,
                elapsed: started.elapsed(),
            });
        }
        if started.elapsed() >= budget {
            return Err(ReadinessError::TimedOut {
                any_segment: any_segment_on_disk(dir),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReadinessError::Canceled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Waits for the first non-empty segment to land, for the
/// time-to-first-segment observation. Returns `None` when cancelled first.
pub async fn await_first_segment(
    dir: &Path,
    poll: Duration,
    cancel: &CancellationToken,
) -> Option<Duration> {
    let started = Instant::now();
    loop {
        if any_segment_on_disk(dir) {
            return Some(started.elapsed());
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
