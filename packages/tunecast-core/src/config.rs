//! Core configuration.
//!
//! Groups the orchestrator's timing budgets, tuner inventory and filesystem
//! roots. All durations have sensible defaults; only `hls_root` is required.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outbound::OutboundPolicy;

/// Minimum heartbeat period regardless of lease TTL.
const MIN_HEARTBEAT: Duration = Duration::from_secs(5);
/// Floor for the sweeper tick.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Playlist readiness budgets per attempt kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadinessTimeouts {
    /// First attempt for a live session.
    pub live: Duration,
    /// Repair attempt after an upstream-corruption wipe.
    pub repair: Duration,
    /// VOD playback (the whole playlist must land, including `ENDLIST`).
    pub vod: Duration,
}

impl Default for ReadinessTimeouts {
    fn default() -> Self {
        Self {
            live: Duration::from_secs(45),
            repair: Duration::from_secs(20),
            vod: Duration::from_secs(120),
        }
    }
}

/// Configuration for the session orchestrator and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root under which `sessions/<id>/` output directories are created.
    /// Required; `validate` refuses an empty path.
    pub hls_root: PathBuf,

    /// Tuner slot inventory for LIVE sessions, probed in order.
    pub tuner_slots: Vec<u32>,

    /// TTL for tuner and dedup leases.
    pub lease_ttl: Duration,

    /// Lease renewal period. Zero means "derive from the TTL"
    /// (`lease_ttl / 3`, floored at 5 seconds).
    pub heartbeat_every: Duration,

    /// Budget for `Tuner::tune` on a LIVE start.
    pub tune_timeout: Duration,

    /// Grace between the polite and forceful transcoder kill signals.
    pub ffmpeg_kill_timeout: Duration,

    /// READY sessions idle longer than this are retired by the sweeper.
    pub idle_timeout: Duration,

    /// Terminal sessions and their output are deleted after this age.
    pub session_retention: Duration,

    /// Sweeper tick. Clamped by `sweep_interval()`.
    pub sweeper_interval: Duration,

    pub readiness: ReadinessTimeouts,

    /// Interval between readiness probes of the playlist on disk.
    pub readiness_poll: Duration,

    /// Allowlist applied to any URL handed to the transcoder.
    #[serde(default)]
    pub outbound: OutboundPolicy,
}

impl Config {
    /// Creates a config with defaults for everything but the HLS root.
    pub fn new(hls_root: impl Into<PathBuf>) -> Self {
        Self {
            hls_root: hls_root.into(),
            tuner_slots: vec![0],
            lease_ttl: Duration::from_secs(30),
            heartbeat_every: Duration::ZERO,
            tune_timeout: Duration::from_secs(5),
            ffmpeg_kill_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            session_retention: Duration::from_secs(24 * 3600),
            sweeper_interval: Duration::from_secs(30),
            readiness: ReadinessTimeouts::default(),
            readiness_poll: Duration::from_millis(200),
            outbound: OutboundPolicy::default(),
        }
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.hls_root.as_os_str().is_empty() {
            return Err("hls_root must be set".to_string());
        }
        if self.tuner_slots.is_empty() {
            return Err("tuner_slots must not be empty".to_string());
        }
        if self.lease_ttl.is_zero() {
            return Err("lease_ttl must be > 0".to_string());
        }
        if !self.heartbeat_every.is_zero() && self.heartbeat_every >= self.lease_ttl {
            return Err("heartbeat_every must be shorter than lease_ttl".to_string());
        }
        if self.readiness_poll.is_zero() {
            return Err("readiness_poll must be > 0".to_string());
        }
        if self.session_retention.is_zero() {
            return Err("session_retention must be > 0".to_string());
        }
        Ok(())
    }

    /// Effective heartbeat period: explicit value, or `lease_ttl / 3`
    /// floored at 5 seconds.
    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        if !self.heartbeat_every.is_zero() {
            return self.heartbeat_every;
        }
        (self.lease_ttl / 3).max(MIN_HEARTBEAT)
    }

    /// Effective sweeper tick: at least 10s, but no longer than half the
    /// idle timeout so idle sessions are retired promptly.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        let cap = (self.idle_timeout / 2).max(Duration::from_secs(1));
        self.sweeper_interval.max(MIN_SWEEP_INTERVAL).min(cap.max(MIN_SWEEP_INTERVAL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::new("/tmp/hls").validate().is_ok());
    }

    #[test]
    fn rejects_empty_hls_root() {
        assert!(Config::new("").validate().is_err());
    }

    #[test]
    fn rejects_empty_tuner_slots() {
        let mut cfg = Config::new("/tmp/hls");
        cfg.tuner_slots.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_longer_than_ttl() {
        let mut cfg = Config::new("/tmp/hls");
        cfg.heartbeat_every = Duration::from_secs(30);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn heartbeat_derives_from_ttl() {
        let mut cfg = Config::new("/tmp/hls");
        cfg.lease_ttl = Duration::from_secs(30);
        assert_eq!(cfg.heartbeat_period(), Duration::from_secs(10));

        // Short TTLs floor at 5s rather than hammering the store.
        cfg.lease_ttl = Duration::from_secs(6);
        assert_eq!(cfg.heartbeat_period(), Duration::from_secs(5));

        cfg.heartbeat_every = Duration::from_secs(7);
        assert_eq!(cfg.heartbeat_period(), Duration::from_secs(7));
    }

    #[test]
    fn sweep_interval_is_bounded_by_idle_timeout() {
        let mut cfg = Config::new("/tmp/hls");
        cfg.sweeper_interval = Duration::from_secs(300);
        cfg.idle_timeout = Duration::from_secs(60);
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(30));

        cfg.sweeper_interval = Duration::from_secs(2);
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(10));
    }
}
