//! Worker configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tunecast_core::{Config, OutboundPolicy, ReadinessTimeouts};

/// Worker configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory for the state database and the single-writer lock file.
    /// Override: `TUNECAST_DATA_DIR`
    pub data_dir: PathBuf,

    /// Root directory for HLS session output. Required.
    /// Override: `TUNECAST_HLS_ROOT`
    pub hls_root: PathBuf,

    /// Path to the ffmpeg binary.
    pub ffmpeg_path: PathBuf,

    /// Tuner slot inventory for LIVE sessions.
    pub tuner_slots: Vec<u32>,

    /// Address for the Prometheus scrape endpoint; omit to disable.
    pub metrics_addr: Option<SocketAddr>,

    pub lease_ttl_secs: u64,
    /// 0 derives the period from the lease TTL.
    pub heartbeat_every_secs: u64,
    pub tune_timeout_secs: u64,
    pub ffmpeg_kill_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub session_retention_secs: u64,
    pub sweeper_interval_secs: u64,

    pub readiness_live_secs: u64,
    pub readiness_repair_secs: u64,
    pub readiness_vod_secs: u64,

    /// Allowlist applied to any URL handed to ffmpeg.
    pub outbound: OutboundPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/tunecast"),
            hls_root: PathBuf::new(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            tuner_slots: vec![0],
            metrics_addr: None,
            lease_ttl_secs: 30,
            heartbeat_every_secs: 0,
            tune_timeout_secs: 5,
            ffmpeg_kill_timeout_secs: 5,
            idle_timeout_secs: 120,
            session_retention_secs: 24 * 3600,
            sweeper_interval_secs: 30,
            readiness_live_secs: 45,
            readiness_repair_secs: 20,
            readiness_vod_secs: 120,
            outbound: OutboundPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TUNECAST_HLS_ROOT") {
            if !val.is_empty() {
                self.hls_root = PathBuf::from(val);
            }
        }
        if let Ok(val) = std::env::var("TUNECAST_METRICS_ADDR") {
            if let Ok(addr) = val.parse() {
                self.metrics_addr = Some(addr);
            }
        }
        // Note: TUNECAST_DATA_DIR is handled by clap via #[arg(env = ...)].
    }

    /// Converts to tunecast-core's Config type.
    pub fn to_core_config(&self) -> Config {
        let mut config = Config::new(&self.hls_root);
        config.tuner_slots = self.tuner_slots.clone();
        config.lease_ttl = Duration::from_secs(self.lease_ttl_secs);
        config.heartbeat_every = Duration::from_secs(self.heartbeat_every_secs);
        config.tune_timeout = Duration::from_secs(self.tune_timeout_secs);
        config.ffmpeg_kill_timeout = Duration::from_secs(self.ffmpeg_kill_timeout_secs);
        config.idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        config.session_retention = Duration::from_secs(self.session_retention_secs);
        config.sweeper_interval = Duration::from_secs(self.sweeper_interval_secs);
        config.readiness = ReadinessTimeouts {
            live: Duration::from_secs(self.readiness_live_secs),
            repair: Duration::from_secs(self.readiness_repair_secs),
            vod: Duration::from_secs(self.readiness_vod_secs),
        };
        config.outbound = self.outbound.clone();
        config
    }
}
