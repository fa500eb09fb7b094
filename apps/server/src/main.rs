//! Tunecast Server - standalone transcoding worker.
//!
//! This binary wires the orchestrator core to its production
//! collaborators: the sled state store under a file-locked data directory,
//! the ffmpeg transcoder, the Prometheus exporter and the intent bus. The
//! HTTP API that creates intents and serves playlists runs elsewhere and
//! shares only the data directory contract.

mod config;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fs2::FileExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tunecast_core::{
    Bus, FfmpegConfig, FfmpegTranscoderFactory, HlsLayout, InstrumentedStore, Orchestrator,
    OutboundGuard, PassthroughTuner, SessionStore, SledStore, Sweeper,
};

use crate::config::ServerConfig;

const LOCK_FILE: &str = "LOCK";
const STATE_DB: &str = "state.db";

/// Tunecast Server - receiver-to-HLS transcoding worker.
#[derive(Parser, Debug)]
#[command(name = "tunecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TUNECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Data directory for the state database (overrides config file).
    #[arg(short = 'd', long, env = "TUNECAST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HLS output root (overrides config file).
    #[arg(long, env = "TUNECAST_HLS_ROOT")]
    hls_root: Option<PathBuf>,
}

/// Exclusive lock on the data directory; single worker per directory.
///
/// Held for the process lifetime. The orchestrator's startup lease flush is
/// only sound while this lock is held.
struct DataDirLock {
    _file: File,
}

fn lock_data_dir(dir: &Path) -> Result<DataDirLock> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    let path = dir.join(LOCK_FILE);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create lock file {}", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!(
            "data directory {} is locked by another worker",
            dir.display()
        );
    }
    Ok(DataDirLock { _file: file })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Tunecast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(hls_root) = args.hls_root {
        config.hls_root = hls_root;
    }

    let core_config = config.to_core_config();
    if let Err(err) = core_config.validate() {
        bail!("Invalid configuration: {err}");
    }

    // Single-writer assertion; everything else relies on it.
    let _lock = lock_data_dir(&config.data_dir)?;
    log::info!("Locked data directory {}", config.data_dir.display());

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        log::info!("Metrics exported on http://{addr}/metrics");
    }

    std::fs::create_dir_all(core_config.hls_root.join("sessions"))
        .context("Failed to create HLS output root")?;

    let store = SledStore::open(config.data_dir.join(STATE_DB))
        .context("Failed to open state store")?;
    let store: Arc<dyn SessionStore> =
        Arc::new(InstrumentedStore::new(Arc::new(store)));

    let outbound_guard = OutboundGuard::new(&core_config.outbound)
        .map_err(|e| anyhow::anyhow!("Invalid outbound allowlist: {e}"))?;
    let transcoders = Arc::new(FfmpegTranscoderFactory::new(
        FfmpegConfig {
            ffmpeg_path: config.ffmpeg_path.clone(),
            kill_timeout: core_config.ffmpeg_kill_timeout,
            ..FfmpegConfig::default()
        },
        HlsLayout::new(&core_config.hls_root),
        Some(Arc::new(outbound_guard)),
    ));

    let bus = Arc::new(Bus::new(64));
    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::new(PassthroughTuner),
        transcoders,
        core_config.clone(),
        shutdown.clone(),
    );
    let orchestrator_task = orchestrator.start();

    let sweeper = Sweeper::new(store, bus, core_config, shutdown.clone());
    let sweeper_task = sweeper.start();

    log::info!("Worker running; press Ctrl-C to stop");
    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    log::info!("Shutdown requested");

    shutdown.cancel();
    let _ = orchestrator_task.await;
    let _ = sweeper_task.await;
    log::info!("Shutdown complete");
    Ok(())
}
