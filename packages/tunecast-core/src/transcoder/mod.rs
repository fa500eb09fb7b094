//! Transcoder contract.
//!
//! A transcoder owns the lifecycle of one external media process and its
//! output directory. The orchestrator constructs a fresh instance per
//! attempt through [`TranscoderFactory`], starts it, polls the output
//! directory for readiness, and then blocks on [`Transcoder::wait`].

pub mod ffmpeg;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::session::StreamProfile;

pub use ffmpeg::{FfmpegConfig, FfmpegTranscoder, FfmpegTranscoderFactory};

#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The external process could not be launched.
    #[error("failed to launch transcoder: {0}")]
    Spawn(String),
    /// The process exited non-zero.
    #[error("process exit code {0}")]
    ProcessExit(i32),
    #[error("transcoder not started")]
    NotStarted,
    #[error("transcoder already started")]
    AlreadyStarted,
    #[error("transcoder i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the process tree ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Exit code zero.
    Clean,
    /// Non-zero exit or signal death.
    Error,
    /// The session's work context was cancelled before exit.
    CtxCancel,
}

impl ExitReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Error => "error",
            Self::CtxCancel => "ctx_cancel",
        }
    }
}

/// Terminal report for one transcoder run.
#[derive(Debug, Clone)]
pub struct ExitStatus {
    /// Process exit code; `None` when killed by signal.
    pub code: Option<i32>,
    pub reason: ExitReason,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
}

/// Lifecycle owner for one external media process.
#[async_trait]
pub trait Transcoder: Send {
    /// Launches the process writing HLS output into the session directory.
    /// Non-blocking: returns once the process is spawned.
    async fn start(
        &mut self,
        session_id: &str,
        source: &str,
        profile: &StreamProfile,
        start_ms: u64,
    ) -> Result<(), TranscodeError>;

    /// Blocks until the process tree exits or `cancel` fires. On
    /// cancellation the process is stopped (polite, then forceful) and the
    /// status carries [`ExitReason::CtxCancel`].
    async fn wait(&mut self, cancel: &CancellationToken) -> Result<ExitStatus, TranscodeError>;

    /// Requests shutdown of the process tree, respecting the configured
    /// kill grace. Idempotent.
    async fn stop(&mut self) -> Result<(), TranscodeError>;

    /// Best-effort tail of the process's stderr, newest last. Used for
    /// failure classification only.
    fn last_log_lines(&self, n: usize) -> Vec<String>;
}

/// Constructs a fresh transcoder per start attempt.
pub trait TranscoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transcoder>;
}
