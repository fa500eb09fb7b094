//! FFmpeg-backed transcoder.
//!
//! Spawns ffmpeg as its own process group so `stop` can terminate the whole
//! tree, tails stderr into a bounded ring buffer for failure classification,
//! and maps process exit into [`ExitStatus`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ExitReason, ExitStatus, TranscodeError, Transcoder, TranscoderFactory};
use crate::layout::{HlsLayout, INIT_SEGMENT_NAME};
use crate::metrics::{record_term_signal, record_wait_outcome, TermSignal};
use crate::outbound::OutboundGuard;
use crate::session::StreamProfile;

/// Default number of stderr lines retained for classification.
pub const LOG_RING_LINES: usize = 64;

/// Static configuration shared by all ffmpeg transcoders of one worker.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub ffmpeg_path: PathBuf,
    /// Grace between SIGTERM and SIGKILL on stop.
    pub kill_timeout: Duration,
    pub log_ring_lines: usize,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            kill_timeout: Duration::from_secs(5),
            log_ring_lines: LOG_RING_LINES,
        }
    }
}

/// Creates one [`FfmpegTranscoder`] per start attempt.
pub struct FfmpegTranscoderFactory {
    config: FfmpegConfig,
    layout: HlsLayout,
    guard: Option<Arc<OutboundGuard>>,
}

impl FfmpegTranscoderFactory {
    pub fn new(config: FfmpegConfig, layout: HlsLayout, guard: Option<Arc<OutboundGuard>>) -> Self {
        Self {
            config,
            layout,
            guard,
        }
    }
}

impl TranscoderFactory for FfmpegTranscoderFactory {
    fn create(&self) -> Box<dyn Transcoder> {
        Box::new(FfmpegTranscoder {
            config: self.config.clone(),
            layout: self.layout.clone(),
            guard: self.guard.clone(),
            child: None,
            group_pid: None,
            started_at: None,
            ring: Arc::new(Mutex::new(VecDeque::new())),
        })
    }
}

/// One ffmpeg process lifecycle.
pub struct FfmpegTranscoder {
    config: FfmpegConfig,
    layout: HlsLayout,
    guard: Option<Arc<OutboundGuard>>,
    child: Option<Child>,
    /// Process-group id (equals the child pid; the child calls `setsid`).
    group_pid: Option<i32>,
    started_at: Option<SystemTime>,
    ring: Arc<Mutex<VecDeque<String>>>,
}

/// Appends a line to a bounded ring, evicting the oldest.
fn push_ring(ring: &Mutex<VecDeque<String>>, cap: usize, line: String) {
    let mut ring = ring.lock();
    if ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(line);
}

/// Builds the ffmpeg argument list for one attempt.
///
/// Kept pure so the argument policy is unit-testable without spawning.
fn build_args(
    source: &str,
    profile: &StreamProfile,
    start_ms: u64,
    playlist: &std::path::Path,
    segment_pattern: &std::path::Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    if start_ms > 0 {
        args.extend(["-ss".into(), format!("{:.3}", start_ms as f64 / 1000.0)]);
    }

    args.extend(["-i".into(), source.to_string()]);

    if profile.transcode_video {
        let codec = match profile.video_codec.as_str() {
            "hevc" => "libx265",
            _ => "libx264",
        };
        args.extend([
            "-c:v".into(),
            codec.into(),
            "-preset".into(),
            "veryfast".into(),
            "-crf".into(),
            profile.crf.to_string(),
        ]);
        let mut filters = Vec::new();
        if profile.deinterlace {
            filters.push("yadif".to_string());
        }
        if profile.video_max_width > 0 {
            filters.push(format!(
                "scale='min({},iw)':-2",
                profile.video_max_width
            ));
        }
        if !filters.is_empty() {
            args.extend(["-vf".into(), filters.join(",")]);
        }
    } else {
        args.extend(["-c:v".into(), "copy".into()]);
    }

    if profile.transcode_audio {
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", profile.audio_bitrate_k),
        ]);
    } else {
        args.extend(["-c:a".into(), "copy".into()]);
    }

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        profile.segment_duration_secs.to_string(),
    ]);

    if profile.vod {
        args.extend(["-hls_playlist_type".into(), "vod".into()]);
    } else if profile.dvr_window_secs > 0 {
        let window_segments =
            (profile.dvr_window_secs / profile.segment_duration_secs.max(1)).max(1);
        args.extend([
            "-hls_list_size".into(),
            window_segments.to_string(),
            "-hls_flags".into(),
            "delete_segments+independent_segments".into(),
        ]);
    } else {
        args.extend(["-hls_playlist_type".into(), "event".into()]);
    }

    if profile.segment_extension() == "m4s" {
        args.extend([
            "-hls_segment_type".into(),
            "fmp4".into(),
            "-hls_fmp4_init_filename".into(),
            INIT_SEGMENT_NAME.into(),
        ]);
    }

    args.extend([
        "-hls_segment_filename".into(),
        segment_pattern.to_string_lossy().into_owned(),
        playlist.to_string_lossy().into_owned(),
    ]);

    args
}

impl FfmpegTranscoder {
    /// Sends the polite-then-forceful termination sequence to the group.
    async fn terminate_tree(&mut self, child: &mut Child) {
        if matches!(child.try_wait(), Ok(Some(_))) {
            record_term_signal(TermSignal::AlreadyGone);
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pgid) = self.group_pid {
                unsafe {
                    libc::kill(-pgid, libc::SIGTERM);
                }
                record_term_signal(TermSignal::PoliteSent);
                match tokio::time::timeout(self.config.kill_timeout, child.wait()).await {
                    Ok(_) => return,
                    Err(_) => {
                        warn!(pgid, "transcoder ignored SIGTERM, escalating to SIGKILL");
                        unsafe {
                            libc::kill(-pgid, libc::SIGKILL);
                        }
                        record_term_signal(TermSignal::ForceKill);
                        let _ = child.wait().await;
                        return;
                    }
                }
            }
        }

        // No group id (or non-unix): fall back to killing the direct child.
        record_term_signal(TermSignal::PoliteSent);
        if tokio::time::timeout(self.config.kill_timeout, child.wait())
            .await
            .is_err()
        {
            record_term_signal(TermSignal::ForceKill);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(
        &mut self,
        session_id: &str,
        source: &str,
        profile: &StreamProfile,
        start_ms: u64,
    ) -> Result<(), TranscodeError> {
        if self.child.is_some() {
            return Err(TranscodeError::AlreadyStarted);
        }

        let dir = self
            .layout
            .session_dir(session_id)
            .map_err(|e| TranscodeError::Spawn(e.to_string()))?;
        let playlist = self
            .layout
            .playlist_path(session_id)
            .map_err(|e| TranscodeError::Spawn(e.to_string()))?;
        let pattern = self
            .layout
            .segment_pattern(session_id, profile)
            .map_err(|e| TranscodeError::Spawn(e.to_string()))?;

        if source.starts_with("http://") || source.starts_with("https://") {
            if let Some(guard) = &self.guard {
                guard
                    .check(source)
                    .map_err(|e| TranscodeError::Spawn(format!("source refused: {e}")))?;
            }
        }

        tokio::fs::create_dir_all(&dir).await?;

        let args = build_args(source, profile, start_ms, &playlist, &pattern);
        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            // New session makes the child a process-group leader, so stop
            // can signal the whole tree.
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TranscodeError::Spawn(format!("spawn {:?}: {e}", self.config.ffmpeg_path)))?;

        self.group_pid = child.id().map(|pid| pid as i32);
        self.started_at = Some(SystemTime::now());

        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&self.ring);
            let cap = self.config.log_ring_lines.max(1);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_ring(&ring, cap, line);
                }
            });
        }

        debug!(pid = self.group_pid, "transcoder spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> Result<ExitStatus, TranscodeError> {
        let mut child = self.child.take().ok_or(TranscodeError::NotStarted)?;
        let started_at = self.started_at.unwrap_or_else(SystemTime::now);

        enum End {
            Exited(std::process::ExitStatus),
            Cancelled,
        }

        let end = tokio::select! {
            status = child.wait() => End::Exited(status?),
            _ = cancel.cancelled() => End::Cancelled,
        };

        let status = match end {
            End::Exited(status) => {
                let reason = if status.success() {
                    ExitReason::Clean
                } else {
                    ExitReason::Error
                };
                ExitStatus {
                    code: status.code(),
                    reason,
                    started_at,
                    ended_at: SystemTime::now(),
                }
            }
            End::Cancelled => {
                self.terminate_tree(&mut child).await;
                ExitStatus {
                    code: None,
                    reason: ExitReason::CtxCancel,
                    started_at,
                    ended_at: SystemTime::now(),
                }
            }
        };

        record_wait_outcome(status.reason);
        Ok(status)
    }

    async fn stop(&mut self) -> Result<(), TranscodeError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.terminate_tree(&mut child).await;
        Ok(())
    }

    fn last_log_lines(&self, n: usize) -> Vec<String> {
        let ring = self.ring.lock();
        ring.iter()
            .skip(ring.len().saturating_sub(n))
            .cloned()
            .collect()
    }
}
