//! End-to-end orchestrator scenarios with stubbed collaborators.
//!
//! A scripted transcoder writes (or withholds) HLS output under a temp
//! root, and a stub tuner either succeeds instantly or blocks forever.
//! Sessions are driven through the real bus, store and FSM.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tunecast_core::store::tuner_lease_key;
use tunecast_core::transcoder::{ExitReason, ExitStatus, TranscodeError};
use tunecast_core::{
    Bus, Config, Intent, MemoryStore, Orchestrator, PipelineState, ReadinessTimeouts, ReasonCode,
    SessionMode, SessionRecord, SessionState, SessionStore, StartRequest, StopIntent,
    StreamProfile, Transcoder, TranscoderFactory, Tuner, TunerError, TOPIC_START, TOPIC_STOP,
};

// ─────────────────────────────────────────────────────────────────────────
// Stub collaborators
// ─────────────────────────────────────────────────────────────────────────

enum TunerBehavior {
    Ready,
    Block,
}

struct StubTuner(TunerBehavior);

#[async_trait]
impl Tuner for StubTuner {
    async fn tune(&self, cancel: &CancellationToken, _service_ref: &str) -> Result<(), TunerError> {
        match self.0 {
            TunerBehavior::Ready => Ok(()),
            TunerBehavior::Block => {
                cancel.cancelled().await;
                Err(TunerError::Canceled)
            }
        }
    }

    async fn healthy(&self) -> Result<(), TunerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TunerError> {
        Ok(())
    }
}

#[derive(Clone)]
enum Script {
    /// Write a segment and a valid playlist after `delay`, then either
    /// run until cancelled or exit with `exit` = (after, code).
    Ready {
        delay: Duration,
        vod: bool,
        exit: Option<(Duration, i32)>,
    },
    /// Produce only stderr noise; the playlist never appears.
    Stall { stderr: Vec<&'static str> },
}

struct ScriptedTranscoder {
    root: PathBuf,
    script: Script,
    stderr: Vec<String>,
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn start(
        &mut self,
        session_id: &str,
        _source: &str,
        _profile: &StreamProfile,
        _start_ms: u64,
    ) -> Result<(), TranscodeError> {
        let dir = self.root.join("sessions").join(session_id);
        std::fs::create_dir_all(&dir)?;
        match &self.script {
            Script::Ready { delay, vod, .. } => {
                let delay = *delay;
                let vod = *vod;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = std::fs::write(dir.join("seg_00001.ts"), b"mpegts-data");
                    let mut playlist = String::from(
                        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_00001.ts\n",
                    );
                    if vod {
                        playlist.push_str("#EXT-X-ENDLIST\n");
                    }
                    let _ = std::fs::write(dir.join("index.m3u8"), playlist);
                });
            }
            Script::Stall { stderr } => {
                self.stderr = stderr.iter().map(|s| (*s).to_string()).collect();
            }
        }
        Ok(())
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> Result<ExitStatus, TranscodeError> {
        let started_at = SystemTime::now();
        let exit = match &self.script {
            Script::Ready { exit, .. } => *exit,
            Script::Stall { .. } => None,
        };
        let status = match exit {
            Some((after, code)) => {
                tokio::select! {
                    _ = cancel.cancelled() => ExitStatus {
                        code: None,
                        reason: ExitReason::CtxCancel,
                        started_at,
                        ended_at: SystemTime::now(),
                    },
                    _ = tokio::time::sleep(after) => ExitStatus {
                        code: Some(code),
                        reason: if code == 0 { ExitReason::Clean } else { ExitReason::Error },
                        started_at,
                        ended_at: SystemTime::now(),
                    },
                }
            }
            None => {
                cancel.cancelled().await;
                ExitStatus {
                    code: None,
                    reason: ExitReason::CtxCancel,
                    started_at,
                    ended_at: SystemTime::now(),
                }
            }
        };
        Ok(status)
    }

    async fn stop(&mut self) -> Result<(), TranscodeError> {
        Ok(())
    }

    fn last_log_lines(&self, n: usize) -> Vec<String> {
        self.stderr
            .iter()
            .skip(self.stderr.len().saturating_sub(n))
            .cloned()
            .collect()
    }
}

struct ScriptedFactory {
    root: PathBuf,
    scripts: Mutex<VecDeque<Script>>,
    created: AtomicUsize,
    started_profiles: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    fn new(root: PathBuf, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            root,
            scripts: Mutex::new(scripts.into()),
            created: AtomicUsize::new(0),
            started_profiles: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn attempts(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn profiles(&self) -> Vec<String> {
        self.started_profiles.lock().clone()
    }
}

/// Wrapper recording which profile each attempt was started with.
struct RecordingTranscoder {
    inner: ScriptedTranscoder,
    profiles: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transcoder for RecordingTranscoder {
    async fn start(
        &mut self,
        session_id: &str,
        source: &str,
        profile: &StreamProfile,
        start_ms: u64,
    ) -> Result<(), TranscodeError> {
        self.profiles.lock().push(profile.name.clone());
        self.inner.start(session_id, source, profile, start_ms).await
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> Result<ExitStatus, TranscodeError> {
        self.inner.wait(cancel).await
    }

    async fn stop(&mut self) -> Result<(), TranscodeError> {
        self.inner.stop().await
    }

    fn last_log_lines(&self, n: usize) -> Vec<String> {
        self.inner.last_log_lines(n)
    }
}

impl TranscoderFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn Transcoder> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(Script::Stall { stderr: Vec::new() });
        Box::new(RecordingTranscoder {
            inner: ScriptedTranscoder {
                root: self.root.clone(),
                script,
                stderr: Vec::new(),
            },
            profiles: Arc::clone(&self.started_profiles),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────

struct Harness {
    orch: Arc<Orchestrator>,
    store: Arc<MemoryStore>,
    bus: Arc<Bus<Intent>>,
    factory: Arc<ScriptedFactory>,
    shutdown: CancellationToken,
    dir: tempfile::TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn harness(
    tuner: TunerBehavior,
    scripts: Vec<Script>,
    mutate: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let bus: Arc<Bus<Intent>> = Arc::new(Bus::new(16));
    let factory = ScriptedFactory::new(dir.path().to_path_buf(), scripts);

    let mut config = Config::new(dir.path());
    config.tuner_slots = vec![1, 2];
    config.tune_timeout = Duration::from_millis(150);
    config.heartbeat_every = Duration::from_millis(100);
    config.readiness = ReadinessTimeouts {
        live: Duration::from_millis(400),
        repair: Duration::from_millis(200),
        vod: Duration::from_secs(1),
    };
    config.readiness_poll = Duration::from_millis(20);
    mutate(&mut config);
    config.validate().unwrap();

    let shutdown = CancellationToken::new();
    let orch = Orchestrator::new(
        store.clone() as Arc<dyn SessionStore>,
        bus.clone(),
        Arc::new(StubTuner(tuner)),
        factory.clone() as Arc<dyn TranscoderFactory>,
        config,
        shutdown.clone(),
    );
    orch.start();

    // The run loop must have subscribed before any intent is published.
    let deadline = Instant::now() + Duration::from_secs(2);
    while bus.subscriber_count(TOPIC_START) == 0 || bus.subscriber_count(TOPIC_STOP) == 0 {
        assert!(Instant::now() < deadline, "orchestrator never subscribed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    Harness {
        orch,
        store,
        bus,
        factory,
        shutdown,
        dir,
    }
}

fn live_request(sid: &str, service_ref: &str) -> StartRequest {
    StartRequest {
        session_id: sid.to_string(),
        service_ref: service_ref.to_string(),
        profile: StreamProfile::hd(),
        mode: SessionMode::Live,
        source: None,
        start_ms: 0,
        idempotency_key: None,
    }
}

async fn wait_for_state(
    store: &MemoryStore,
    sid: &str,
    state: SessionState,
) -> SessionRecord {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(rec) = store.get_session(sid).unwrap() {
            if rec.state == state {
                return rec;
            }
        }
        assert!(
            Instant::now() < deadline,
            "session {sid} never reached {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn live_session_reaches_ready_then_stops_on_event() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![Script::Ready {
            delay: Duration::from_millis(50),
            vod: false,
            exit: None,
        }],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s1", "svc-A")).await.unwrap();
    let ready = wait_for_state(&fx.store, "s1", SessionState::Ready).await;

    // Invariants: slot recorded, playlist on disk, lease held.
    assert_eq!(ready.tuner_slot(), Some(1));
    assert!(ready.lease_expires_at_unix > 0);
    let playlist = fx.dir.path().join("sessions/s1/index.m3u8");
    let body = std::fs::read_to_string(&playlist).unwrap();
    assert!(body.contains("#EXTM3U"));
    assert!(fx.dir.path().join("sessions/s1/seg_00001.ts").exists());

    // Clean stop via event.
    fx.orch.submit_stop("s1", "CLIENT_STOP").await;
    let stopped = wait_for_state(&fx.store, "s1", SessionState::Stopped).await;
    assert_eq!(stopped.reason, ReasonCode::ClientStop);
    assert_eq!(stopped.pipeline_state, PipelineState::Stopped);
    assert_eq!(stopped.stop_reason, "CLIENT_STOP");

    // Output removal follows the record settle; poll briefly.
    let deadline = Instant::now() + Duration::from_secs(2);
    while playlist.exists() {
        assert!(Instant::now() < deadline, "output never removed on stop");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The tuner slot is free again.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let free = fx
            .store
            .try_acquire_lease(&tuner_lease_key(1), "probe", Duration::from_secs(5))
            .unwrap()
            .is_some();
        if free {
            break;
        }
        assert!(Instant::now() < deadline, "tuner lease never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn concurrent_start_for_same_service_is_dedup_busy() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![Script::Ready {
            delay: Duration::from_millis(250),
            vod: false,
            exit: None,
        }],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s1", "svc-A")).await.unwrap();
    // Give s1 a head start so it holds the dedup lease but is not READY yet.
    tokio::time::sleep(Duration::from_millis(60)).await;
    fx.orch.submit_start(live_request("s2", "svc-A")).await.unwrap();

    wait_for_state(&fx.store, "s1", SessionState::Ready).await;

    // The loser's record must not be mutated beyond what intake wrote.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let loser = fx.store.get_session("s2").unwrap().unwrap();
    assert_eq!(loser.state, SessionState::New);
    assert_eq!(loser.reason, ReasonCode::None);
    assert_eq!(loser.tuner_slot(), None);

    fx.orch.submit_stop("s1", "test done").await;
    wait_for_state(&fx.store, "s1", SessionState::Stopped).await;
}

#[tokio::test]
async fn tune_timeout_fails_session_and_frees_the_slot() {
    let fx = harness(TunerBehavior::Block, Vec::new(), |cfg| {
        cfg.tune_timeout = Duration::from_millis(100);
    })
    .await;

    fx.orch.submit_start(live_request("s3", "svc-B")).await.unwrap();
    let failed = wait_for_state(&fx.store, "s3", SessionState::Failed).await;
    assert_eq!(failed.reason, ReasonCode::TuneTimeout);
    assert_eq!(failed.pipeline_state, PipelineState::Fail);
    assert_eq!(failed.lease_expires_at_unix, 0);

    // Slot released by the finalizer.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let free = fx
            .store
            .try_acquire_lease(&tuner_lease_key(1), "probe", Duration::from_secs(5))
            .unwrap()
            .is_some();
        if free {
            break;
        }
        assert!(Instant::now() < deadline, "tuner lease never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // No transcoder was ever constructed.
    assert_eq!(fx.factory.attempts(), 0);
}

#[tokio::test]
async fn vod_completion_reaches_draining_and_keeps_output() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![Script::Ready {
            delay: Duration::from_millis(50),
            vod: true,
            exit: Some((Duration::from_millis(100), 0)),
        }],
        |_| {},
    )
    .await;

    fx.orch
        .submit_start(StartRequest {
            session_id: "vod1".to_string(),
            service_ref: "rec-42".to_string(),
            profile: StreamProfile::vod_hd(),
            mode: SessionMode::Recording,
            source: Some("/media/movie.ts".to_string()),
            start_ms: 0,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let drained = wait_for_state(&fx.store, "vod1", SessionState::Draining).await;
    assert_eq!(drained.reason, ReasonCode::None);
    assert_eq!(drained.reason_detail, "recording completed");
    // Recordings never consume a tuner slot.
    assert_eq!(drained.tuner_slot(), None);
    // Output is retained for playback.
    let playlist = fx.dir.path().join("sessions/vod1/index.m3u8");
    assert!(playlist.exists());
    assert!(std::fs::read_to_string(&playlist)
        .unwrap()
        .contains("#EXT-X-ENDLIST"));
}

#[tokio::test]
async fn corruption_without_segments_gets_exactly_one_repair() {
    let corrupt = vec!["non-existing PPS 0 referenced", "decode_slice_header error"];
    let fx = harness(
        TunerBehavior::Ready,
        vec![
            Script::Stall {
                stderr: corrupt.clone(),
            },
            Script::Stall { stderr: corrupt },
        ],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s5", "svc-C")).await.unwrap();
    let failed = wait_for_state(&fx.store, "s5", SessionState::Failed).await;
    assert_eq!(failed.reason, ReasonCode::UpstreamCorrupt);

    // Exactly two attempts: the original and one repair, never a third.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fx.factory.attempts(), 2);
    // The repair attempt switched to the video-copy profile.
    assert_eq!(fx.factory.profiles(), vec!["hd", "copy"]);
    assert!(!fx.dir.path().join("sessions/s5/index.m3u8").exists());
}

#[tokio::test]
async fn repair_attempt_can_reach_ready() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![
            Script::Stall {
                stderr: vec!["no frame!"],
            },
            Script::Ready {
                delay: Duration::from_millis(30),
                vod: false,
                exit: None,
            },
        ],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s6", "svc-D")).await.unwrap();
    wait_for_state(&fx.store, "s6", SessionState::Ready).await;
    assert_eq!(fx.factory.attempts(), 2);

    fx.orch.submit_stop("s6", "test done").await;
    wait_for_state(&fx.store, "s6", SessionState::Stopped).await;
}

#[tokio::test]
async fn stall_without_signatures_is_packager_failure() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![Script::Stall {
            stderr: vec!["frame=0 fps=0.0 speed=0x"],
        }],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s7", "svc-E")).await.unwrap();
    let failed = wait_for_state(&fx.store, "s7", SessionState::Failed).await;
    assert_eq!(failed.reason, ReasonCode::PackagerFailed);
    // No repair for packager failures.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.factory.attempts(), 1);
}

#[tokio::test]
async fn lost_lease_fails_a_ready_session() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![Script::Ready {
            delay: Duration::from_millis(40),
            vod: false,
            exit: None,
        }],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s8", "svc-F")).await.unwrap();
    wait_for_state(&fx.store, "s8", SessionState::Ready).await;

    // Forcibly hand the slot to an intruder, as a crashed peer's recovery
    // would.
    fx.store.release_lease(&tuner_lease_key(1), "s8").unwrap();
    fx.store
        .try_acquire_lease(&tuner_lease_key(1), "intruder", Duration::from_secs(30))
        .unwrap()
        .unwrap();

    let failed = wait_for_state(&fx.store, "s8", SessionState::Failed).await;
    assert_eq!(failed.reason, ReasonCode::LeaseExpired);
    // The work context was cancelled and the output cleaned up.
    let deadline = Instant::now() + Duration::from_secs(2);
    while fx.dir.path().join("sessions/s8").exists() {
        assert!(Instant::now() < deadline, "output never cleaned up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn live_process_exit_zero_is_process_ended() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![Script::Ready {
            delay: Duration::from_millis(30),
            vod: false,
            exit: Some((Duration::from_millis(80), 0)),
        }],
        |_| {},
    )
    .await;

    fx.orch.submit_start(live_request("s9", "svc-G")).await.unwrap();
    let failed = wait_for_state(&fx.store, "s9", SessionState::Failed).await;
    assert_eq!(failed.reason, ReasonCode::ProcessEnded);
}

#[tokio::test]
async fn stop_event_on_new_session_short_circuits() {
    let fx = harness(TunerBehavior::Ready, Vec::new(), |_| {}).await;
    fx.store
        .put_session(&SessionRecord::new("fresh", "svc-H", StreamProfile::hd()))
        .unwrap();

    fx.bus
        .publish(
            TOPIC_STOP,
            Intent::Stop(StopIntent {
                session_id: "fresh".to_string(),
                reason: "user navigated away".to_string(),
            }),
            Duration::from_secs(1),
            &fx.shutdown,
        )
        .await;

    let stopped = wait_for_state(&fx.store, "fresh", SessionState::Stopped).await;
    assert_eq!(stopped.reason, ReasonCode::ClientStop);

    // A second stop leaves the terminal record untouched.
    let before = fx.store.get_session("fresh").unwrap().unwrap();
    fx.orch.submit_stop("fresh", "again").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = fx.store.get_session("fresh").unwrap().unwrap();
    assert_eq!(before.state, after.state);
    assert_eq!(before.reason, after.reason);
}

#[tokio::test]
async fn slots_exhausted_is_lease_busy() {
    let fx = harness(
        TunerBehavior::Ready,
        vec![
            Script::Ready {
                delay: Duration::from_millis(40),
                vod: false,
                exit: None,
            },
            Script::Ready {
                delay: Duration::from_millis(40),
                vod: false,
                exit: None,
            },
        ],
        |cfg| cfg.tuner_slots = vec![1],
    )
    .await;

    fx.orch.submit_start(live_request("a", "svc-1")).await.unwrap();
    wait_for_state(&fx.store, "a", SessionState::Ready).await;

    // Different service (dedup passes) but the only slot is taken.
    fx.orch.submit_start(live_request("b", "svc-2")).await.unwrap();
    let busy = wait_for_state(&fx.store, "b", SessionState::Failed).await;
    assert_eq!(busy.reason, ReasonCode::LeaseBusy);
    assert_eq!(busy.reason_detail, "no tuner slots available");

    fx.orch.submit_stop("a", "test done").await;
    wait_for_state(&fx.store, "a", SessionState::Stopped).await;
}
