//! Session orchestration.
//!
//! Responsibilities:
//! - Consume start/stop intents from the bus, one task per start
//! - Acquire dedup and tuner-slot leases for LIVE sessions
//! - Drive the session FSM: NEW -> STARTING -> PRIMING -> READY ->
//!   (DRAINING | STOPPED | FAILED)
//! - Supervise the transcoder: readiness polling, corruption repair, stop
//! - Always finalize: classify the outcome, settle the record, release
//!   leases, clean output, emit metrics

pub mod active;
pub mod heartbeat;
pub mod readiness;
pub mod repair;

use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::Bus;
use crate::config::Config;
use crate::events::{Intent, StartIntent, StopIntent, TOPIC_START, TOPIC_STOP};
use crate::layout::{valid_session_id, HlsLayout};
use crate::metrics::{
    observe_first_playlist, observe_first_segment, observe_ready_duration,
    record_capacity_rejection, record_fsm_transition, record_session_end, record_session_start,
    ReadyOutcome, StartResult,
};
use crate::reason::{classify, sanitize_detail, ReasonCode, ReasonError};
use crate::session::{
    context_keys, PipelineState, SessionMode, SessionRecord, SessionState, StreamProfile,
};
use crate::store::{svc_lease_key, tuner_lease_key, PutOutcome, SessionStore, StoreError};
use crate::transcoder::{ExitReason, ExitStatus, Transcoder, TranscoderFactory};
use crate::tuner::Tuner;
use crate::utils::now_unix;

use active::ActiveSessions;
use heartbeat::spawn_heartbeat;
use readiness::{await_first_segment, await_ready, ReadinessError};
use repair::{classify_stall, repair_profile};

/// Detail string marking a dedup-lease replay. The finalizer special-cases
/// it: the stored record belongs to the lease holder and must not be
/// touched.
pub const DEDUP_BUSY_DETAIL: &str = "dedup lease held";

const NO_SLOT_DETAIL: &str = "no tuner slots available";

/// TTL for intake idempotency keys.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(600);

/// Per-subscriber budget for intent publishes.
const PUBLISH_BUDGET: Duration = Duration::from_secs(1);

/// Intake parameters for a new session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: String,
    pub service_ref: String,
    pub profile: StreamProfile,
    pub mode: SessionMode,
    /// Playback source; required for RECORDING mode.
    pub source: Option<String>,
    pub start_ms: u64,
    /// Optional client retry key; replays return the original session id.
    pub idempotency_key: Option<String>,
}

/// Mutable bookkeeping shared between the start pipeline and its finalizer.
struct StartScratch {
    profile_name: String,
    vod: bool,
    started: Instant,
    start_recorded: bool,
    ready_observed: bool,
    dedup_key: Option<String>,
    tuner_key: Option<String>,
}

impl StartScratch {
    fn new() -> Self {
        Self {
            profile_name: String::new(),
            vod: false,
            started: Instant::now(),
            start_recorded: false,
            ready_observed: false,
            dedup_key: None,
            tuner_key: None,
        }
    }
}

/// The FSM driver for playback sessions.
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    bus: Arc<Bus<Intent>>,
    tuner: Arc<dyn Tuner>,
    transcoders: Arc<dyn TranscoderFactory>,
    layout: HlsLayout,
    config: Config,
    active: ActiveSessions,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        bus: Arc<Bus<Intent>>,
        tuner: Arc<dyn Tuner>,
        transcoders: Arc<dyn TranscoderFactory>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let layout = HlsLayout::new(&config.hls_root);
        Arc::new(Self {
            store,
            bus,
            tuner,
            transcoders,
            layout,
            config,
            active: ActiveSessions::new(),
            shutdown,
        })
    }

    /// Spawns the intent-consuming run loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let orch = Arc::clone(self);
        tokio::spawn(async move { orch.run().await })
    }

    /// Consumes the start/stop topics until shutdown. Each start runs to
    /// completion as its own task; stops are dispatched likewise so a
    /// stuck start can never block the loop.
    async fn run(self: Arc<Self>) {
        // Stale leases from a previous run are flushed wholesale; the data
        // directory file lock asserts single-worker ownership.
        match self.store.delete_all_leases() {
            Ok(0) => {}
            Ok(count) => info!(count, "flushed stale leases on startup"),
            Err(err) => error!(error = %err, "failed to flush leases on startup"),
        }

        let mut start_sub = self.bus.subscribe(TOPIC_START);
        let mut stop_sub = self.bus.subscribe(TOPIC_STOP);
        info!("orchestrator consuming intents");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                intent = start_sub.recv() => match intent {
                    Some(Intent::Start(start)) => {
                        let orch = Arc::clone(&self);
                        tokio::spawn(async move { orch.handle_start(start).await });
                    }
                    Some(_) => warn!("non-start intent on start topic"),
                    None => break,
                },
                intent = stop_sub.recv() => match intent {
                    Some(Intent::Stop(stop)) => {
                        let orch = Arc::clone(&self);
                        tokio::spawn(async move { orch.handle_stop(stop).await });
                    }
                    Some(_) => warn!("non-stop intent on stop topic"),
                    None => break,
                },
            }
        }
        info!("orchestrator stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────

    /// Creates the NEW session record (idempotently when a key is given)
    /// and publishes the start intent. Returns the authoritative session
    /// id, which differs from the requested one on an idempotent replay.
    pub async fn submit_start(&self, req: StartRequest) -> Result<String, ReasonError> {
        if !valid_session_id(&req.session_id) {
            return Err(ReasonError::new(ReasonCode::BadRequest, "unsafe session id"));
        }
        if req.mode == SessionMode::Recording && req.source.as_deref().unwrap_or("").is_empty() {
            return Err(ReasonError::new(
                ReasonCode::BadRequest,
                "recording start without source",
            ));
        }

        let mut rec = SessionRecord::new(&req.session_id, &req.service_ref, req.profile);
        rec.context
            .insert(context_keys::MODE.into(), req.mode.as_str().into());
        if let Some(source) = &req.source {
            let source_type = if source.starts_with('/') { "file" } else { "url" };
            rec.context
                .insert(context_keys::SOURCE.into(), source.clone());
            rec.context
                .insert(context_keys::SOURCE_TYPE.into(), source_type.into());
        }
        if req.start_ms > 0 {
            rec.context
                .insert(context_keys::START_MS.into(), req.start_ms.to_string());
        }

        let session_id = match &req.idempotency_key {
            Some(key) => {
                match self
                    .store
                    .put_session_with_idempotency(&rec, key, IDEMPOTENCY_TTL)
                    .map_err(|e| {
                        ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e)
                    })? {
                    PutOutcome::Stored => rec.session_id.clone(),
                    PutOutcome::Replayed(existing) => {
                        debug!(existing = %existing, "idempotent start replay");
                        return Ok(existing);
                    }
                }
            }
            None => {
                self.store.put_session(&rec).map_err(|e| {
                    ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e)
                })?;
                rec.session_id.clone()
            }
        };

        self.bus
            .publish(
                TOPIC_START,
                Intent::Start(StartIntent {
                    session_id: session_id.clone(),
                }),
                PUBLISH_BUDGET,
                &self.shutdown,
            )
            .await;
        Ok(session_id)
    }

    /// Publishes a stop intent.
    pub async fn submit_stop(&self, session_id: &str, reason: &str) {
        self.bus
            .publish(
                TOPIC_STOP,
                Intent::Stop(StopIntent {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                }),
                PUBLISH_BUDGET,
                &self.shutdown,
            )
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop path
    // ─────────────────────────────────────────────────────────────────────

    /// Applies a stop intent to the record and interrupts in-flight work.
    ///
    /// Terminal sessions are a no-op (stop is idempotent). A NEW session is
    /// finalized to STOPPED directly; anything else moves to STOPPING and
    /// relies on the registered cancel handle - or, if the start has not
    /// registered yet, on its transition predicates observing STOPPING.
    pub async fn handle_stop(&self, intent: StopIntent) {
        let sid = intent.session_id.clone();
        let prev = Cell::new(SessionState::New);

        let result = self.store.update_session(&sid, &|rec| {
            prev.set(rec.state);
            if rec.state.is_terminal() {
                return Ok(());
            }
            if rec.state == SessionState::New {
                rec.state = SessionState::Stopped;
                rec.pipeline_state = PipelineState::Stopped;
                rec.reason = ReasonCode::ClientStop;
                rec.reason_detail = "stopped before start".to_string();
            } else if rec.state != SessionState::Stopping {
                rec.state = SessionState::Stopping;
                rec.pipeline_state = PipelineState::StopRequested;
            }
            rec.stop_reason = sanitize_detail(&intent.reason);
            rec.updated_at_unix = now_unix();
            Ok(())
        });

        match result {
            Ok(updated) => {
                if prev.get() != updated.state {
                    record_fsm_transition(prev.get(), updated.state);
                }
                if prev.get() == SessionState::New && updated.state == SessionState::Stopped {
                    // Short-circuited before any work started.
                    self.remove_session_dir(&sid);
                    record_session_end(ReasonCode::ClientStop, &updated.profile.name);
                }
                debug!(state = updated.state.as_str(), "stop applied");
            }
            Err(StoreError::NotFound) => debug!("stop for unknown session"),
            Err(err) => warn!(error = %err, "stop update failed"),
        }

        if !self.active.cancel(&sid) {
            debug!("stop arrived before start registered");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start path
    // ─────────────────────────────────────────────────────────────────────

    /// Runs one start intent end to end. The finalizer always runs, even
    /// when the pipeline panics.
    async fn handle_start(self: Arc<Self>, intent: StartIntent) {
        let sid = intent.session_id.clone();
        let correlation_id = self
            .store
            .get_session(&sid)
            .ok()
            .flatten()
            .map(|rec| rec.correlation_id)
            .unwrap_or_default();
        let span = info_span!("session_start", correlation_id = %correlation_id);

        async {
            let token = self.shutdown.child_token();
            self.active.register(&sid, token.clone());

            let mut scratch = StartScratch::new();
            let outcome =
                match AssertUnwindSafe(self.run_start(&sid, &token, &mut scratch))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!("session task panicked");
                        Err(ReasonError::new(ReasonCode::Unknown, "session task panicked"))
                    }
                };

            // Stops the heartbeat and any observer still polling.
            token.cancel();
            self.finalize(&sid, outcome, &mut scratch).await;
            self.active.unregister(&sid);
        }
        .instrument(span)
        .await;
    }

    async fn run_start(
        &self,
        sid: &str,
        token: &CancellationToken,
        scratch: &mut StartScratch,
    ) -> Result<ExitStatus, ReasonError> {
        // 1. Resolve the record and derive mode + source.
        let rec = self
            .store
            .get_session(sid)
            .map_err(|e| ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e))?
            .ok_or_else(|| ReasonError::new(ReasonCode::NotFound, "unknown session"))?;

        scratch.profile_name = rec.profile.name.clone();
        scratch.vod = rec.profile.vod;

        if !valid_session_id(sid) {
            return Err(ReasonError::new(ReasonCode::BadRequest, "unsafe session id"));
        }

        let mode = rec.mode();
        let source = match mode {
            SessionMode::Live => rec.service_ref.clone(),
            SessionMode::Recording => rec
                .recording_source()
                .ok_or_else(|| {
                    ReasonError::new(ReasonCode::InvariantViolation, "missing recording source")
                })?
                .to_string(),
        };
        info!(
            mode = mode.as_str(),
            source_type = rec
                .context
                .get(context_keys::SOURCE_TYPE)
                .map(String::as_str)
                .unwrap_or("service"),
            source = %sanitize_detail(&source),
            profile = %rec.profile.name,
            "starting session"
        );

        // 2-4. Leases: dedup first, then a tuner slot, LIVE only.
        let mut slot = None;
        if mode == SessionMode::Live {
            let dedup_key = svc_lease_key(&rec.service_ref);
            let acquired = self
                .store
                .try_acquire_lease(&dedup_key, sid, self.config.lease_ttl)
                .map_err(|e| ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e))?;
            if acquired.is_none() {
                return Err(ReasonError::new(ReasonCode::LeaseBusy, DEDUP_BUSY_DETAIL));
            }
            scratch.dedup_key = Some(dedup_key);

            for candidate in &self.config.tuner_slots {
                let key = tuner_lease_key(*candidate);
                let acquired = self
                    .store
                    .try_acquire_lease(&key, sid, self.config.lease_ttl)
                    .map_err(|e| {
                        ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e)
                    })?;
                if acquired.is_some() {
                    slot = Some(*candidate);
                    scratch.tuner_key = Some(key);
                    break;
                }
            }
            if slot.is_none() {
                return Err(ReasonError::new(ReasonCode::LeaseBusy, NO_SLOT_DETAIL));
            }
        }

        // 6. NEW -> STARTING, recording the held slot and lease expiry.
        let lease_expires = now_unix() + self.config.lease_ttl.as_secs() as i64;
        let prev = Cell::new(SessionState::New);
        let transition = self.store.update_session(sid, &|rec| {
            if rec.state.is_terminal() || rec.state == SessionState::Stopping {
                return Err(StoreError::Rejected(rec.state.as_str().to_string()));
            }
            prev.set(rec.state);
            rec.state = SessionState::Starting;
            rec.pipeline_state = PipelineState::Idle;
            if let Some(slot) = slot {
                rec.context
                    .insert(context_keys::TUNER_SLOT.into(), slot.to_string());
                rec.lease_expires_at_unix = lease_expires;
            }
            rec.updated_at_unix = now_unix();
            Ok(())
        });
        match transition {
            Ok(_) => record_fsm_transition(prev.get(), SessionState::Starting),
            Err(StoreError::Rejected(_)) => {
                return Err(ReasonError::new(
                    ReasonCode::ClientStop,
                    "stop requested before start",
                ));
            }
            Err(e) => {
                return Err(ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e))
            }
        }

        // 5. Heartbeat keeps the tuner slot alive for the session's lifetime.
        if let Some(key) = &scratch.tuner_key {
            spawn_heartbeat(
                Arc::clone(&self.store),
                sid.to_string(),
                key.clone(),
                self.config.lease_ttl,
                self.config.heartbeat_period(),
                token.clone(),
            );
        }

        // 7. Tune. Recordings and local files need no receiver attention.
        if mode == SessionMode::Live && !source.starts_with('/') {
            let tune =
                tokio::time::timeout(self.config.tune_timeout, self.tuner.tune(token, &source))
                    .await;
            match tune {
                Err(_) => {
                    return Err(ReasonError::new(
                        ReasonCode::TuneTimeout,
                        "tuner not ready within budget",
                    ))
                }
                Ok(Err(err)) => {
                    if token.is_cancelled() {
                        return Err(ReasonError::new(ReasonCode::ClientStop, "tune canceled"));
                    }
                    let (code, detail) = classify(&err);
                    return Err(ReasonError::new(code, detail).with_source(err));
                }
                Ok(Ok(())) => debug!("tuner ready"),
            }
        }

        // 8. Execution loop: initial attempt plus at most one repair.
        let session_dir = self
            .layout
            .session_dir(sid)
            .map_err(|e| ReasonError::new(ReasonCode::BadRequest, e.to_string()))?;
        let start_ms = rec.start_ms();
        let mut profile = rec.profile.clone();
        let mut repair_attempted = false;

        let mut transcoder: Box<dyn Transcoder> = loop {
            let mut attempt = self.transcoders.create();
            attempt
                .start(sid, &source, &profile, start_ms)
                .await
                .map_err(|e| {
                    let (code, detail) = classify(&e);
                    ReasonError::new(code, detail).with_source(e)
                })?;

            if !repair_attempted {
                // First attempt: surface PRIMING and watch for the first
                // segment to land.
                self.transition_priming(sid)?;
                let dir = session_dir.clone();
                let poll = self.config.readiness_poll;
                let observer_token = token.clone();
                let profile_name = scratch.profile_name.clone();
                tokio::spawn(async move {
                    if let Some(elapsed) =
                        await_first_segment(&dir, poll, &observer_token).await
                    {
                        observe_first_segment(&profile_name, elapsed.as_secs_f64());
                    }
                });
            }

            let budget = if repair_attempted {
                self.config.readiness.repair
            } else if profile.vod {
                self.config.readiness.vod
            } else {
                self.config.readiness.live
            };

            match await_ready(
                &session_dir,
                profile.vod,
                budget,
                self.config.readiness_poll,
                token,
            )
            .await
            {
                Ok(stats) => {
                    if let Some(first) = stats.first_playlist {
                        observe_first_playlist(&scratch.profile_name, first.as_secs_f64());
                    }
                    observe_ready_duration(
                        ReadyOutcome::Success,
                        scratch.started.elapsed().as_secs_f64(),
                    );
                    scratch.ready_observed = true;
                    self.transition_ready(sid, &mut attempt).await?;
                    record_session_start(
                        StartResult::Success,
                        ReasonCode::None,
                        &scratch.profile_name,
                    );
                    scratch.start_recorded = true;
                    info!(elapsed_ms = stats.elapsed.as_millis() as u64, "session ready");
                    break attempt;
                }
                Err(ReadinessError::Canceled) => {
                    let _ = attempt.stop().await;
                    return Err(ReasonError::new(ReasonCode::ClientStop, "start canceled"));
                }
                Err(ReadinessError::TimedOut { any_segment }) => {
                    let lines = attempt.last_log_lines(crate::transcoder::ffmpeg::LOG_RING_LINES);
                    let code = classify_stall(&lines, any_segment);
                    if let Err(err) = attempt.stop().await {
                        warn!(error = %err, "failed to stop stalled transcoder");
                    }

                    if code == ReasonCode::UpstreamCorrupt && !repair_attempted && !profile.vod {
                        repair_attempted = true;
                        profile = repair_profile(&rec.profile);
                        warn!(
                            repair_profile = %profile.name,
                            "upstream corrupt before first segment, retrying once"
                        );
                        if let Err(err) = std::fs::remove_dir_all(&session_dir) {
                            if err.kind() != std::io::ErrorKind::NotFound {
                                warn!(error = %err, "failed to wipe session output for repair");
                            }
                        }
                        continue;
                    }

                    let detail = match code {
                        ReasonCode::UpstreamCorrupt => "corrupt upstream stream",
                        _ => "playlist never became valid",
                    };
                    return Err(ReasonError::new(code, detail));
                }
            }
        };

        // 9. The dedup lease only guards concurrent starts; the tuner lease
        // remains as the session's resource hold.
        if let Some(key) = scratch.dedup_key.take() {
            if let Err(err) = self.store.release_lease(&key, sid) {
                warn!(error = %err, "failed to release dedup lease");
            }
        }

        // 10. Block until the transcoder exits or the session is cancelled.
        transcoder.wait(token).await.map_err(|e| {
            let (code, detail) = classify(&e);
            ReasonError::new(code, detail).with_source(e)
        })
    }

    fn transition_priming(&self, sid: &str) -> Result<(), ReasonError> {
        let prev = Cell::new(SessionState::Starting);
        let result = self.store.update_session(sid, &|rec| {
            if rec.state.is_terminal() || rec.state == SessionState::Stopping {
                return Err(StoreError::Rejected(rec.state.as_str().to_string()));
            }
            prev.set(rec.state);
            rec.state = SessionState::Priming;
            rec.pipeline_state = PipelineState::Running;
            rec.updated_at_unix = now_unix();
            Ok(())
        });
        match result {
            Ok(_) => {
                record_fsm_transition(prev.get(), SessionState::Priming);
                Ok(())
            }
            Err(StoreError::Rejected(_)) => Err(ReasonError::new(
                ReasonCode::ClientStop,
                "stop requested while priming",
            )),
            Err(e) => Err(ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e)),
        }
    }

    async fn transition_ready(
        &self,
        sid: &str,
        transcoder: &mut Box<dyn Transcoder>,
    ) -> Result<(), ReasonError> {
        let prev = Cell::new(SessionState::Priming);
        let result = self.store.update_session(sid, &|rec| {
            if rec.state.is_terminal() || rec.state == SessionState::Stopping {
                return Err(StoreError::Rejected(rec.state.as_str().to_string()));
            }
            prev.set(rec.state);
            rec.state = SessionState::Ready;
            rec.last_access_unix = now_unix();
            rec.updated_at_unix = now_unix();
            Ok(())
        });
        match result {
            Ok(_) => {
                record_fsm_transition(prev.get(), SessionState::Ready);
                Ok(())
            }
            Err(StoreError::Rejected(_)) => {
                let _ = transcoder.stop().await;
                Err(ReasonError::new(
                    ReasonCode::ClientStop,
                    "stop requested before ready",
                ))
            }
            Err(e) => Err(ReasonError::new(ReasonCode::Unknown, e.to_string()).with_source(e)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Finalizer
    // ─────────────────────────────────────────────────────────────────────

    /// Settles a finished session: classifies the outcome, writes the
    /// terminal record, removes output, releases leases and emits metrics.
    async fn finalize(
        &self,
        sid: &str,
        outcome: Result<ExitStatus, ReasonError>,
        scratch: &mut StartScratch,
    ) {
        let (code, detail, state_on_clean) = match &outcome {
            Ok(status) => match status.reason {
                ExitReason::CtxCancel => (
                    ReasonCode::ClientStop,
                    "stopped".to_string(),
                    SessionState::Stopped,
                ),
                ExitReason::Clean if scratch.vod => (
                    ReasonCode::None,
                    "recording completed".to_string(),
                    SessionState::Draining,
                ),
                ExitReason::Clean => (
                    ReasonCode::ProcessEnded,
                    "process exited before stop".to_string(),
                    SessionState::Failed,
                ),
                ExitReason::Error => (
                    ReasonCode::ProcessEnded,
                    format!("process exit code {}", status.code.unwrap_or(-1)),
                    SessionState::Failed,
                ),
            },
            Err(err) => {
                let state = if err.code.stops_cleanly() {
                    SessionState::Stopped
                } else {
                    SessionState::Failed
                };
                (err.code, err.detail.clone(), state)
            }
        };

        if let Err(err) = &outcome {
            info!(reason = err.code.as_str(), detail = %err.detail, "session finished with error");
        }

        // Start and readiness outcomes are recorded exactly once.
        if !scratch.start_recorded {
            let result = match code {
                ReasonCode::LeaseBusy => StartResult::Busy,
                ReasonCode::ClientStop | ReasonCode::IdleTimeout => StartResult::Cancel,
                _ => StartResult::Fail,
            };
            record_session_start(result, code, &scratch.profile_name);
            scratch.start_recorded = true;
        }
        if !scratch.ready_observed {
            let ready_outcome = match code {
                ReasonCode::TuneTimeout
                | ReasonCode::PackagerFailed
                | ReasonCode::UpstreamCorrupt => ReadyOutcome::Timeout,
                ReasonCode::ClientStop | ReasonCode::IdleTimeout => ReadyOutcome::Canceled,
                _ => ReadyOutcome::Other,
            };
            observe_ready_duration(ready_outcome, scratch.started.elapsed().as_secs_f64());
            scratch.ready_observed = true;
        }
        if code == ReasonCode::LeaseBusy {
            record_capacity_rejection(ReasonCode::LeaseBusy, &scratch.profile_name);
        }

        // A dedup-busy replay belongs to another worker's session; leave
        // the stored record and its output strictly alone.
        if code == ReasonCode::LeaseBusy && detail == DEDUP_BUSY_DETAIL {
            debug!("dedup replay, skipping finalizer side effects");
            return;
        }

        let prev = Cell::new(SessionState::New);
        let settled = self.store.update_session(sid, &|rec| {
            if rec.state.is_terminal() {
                return Err(StoreError::Rejected("terminal".to_string()));
            }
            prev.set(rec.state);

            // A reason already set by the heartbeat or sweeper wins over
            // our classification of the resulting teardown.
            let (eff_code, eff_detail) =
                if !matches!(rec.reason, ReasonCode::None | ReasonCode::Unknown) {
                    (rec.reason, rec.reason_detail.clone())
                } else {
                    (code, detail.clone())
                };

            let eff_state = if eff_code == ReasonCode::None {
                state_on_clean
            } else if eff_code.stops_cleanly() {
                SessionState::Stopped
            } else {
                SessionState::Failed
            };

            rec.state = eff_state;
            rec.reason = eff_code;
            rec.reason_detail = eff_detail;
            rec.pipeline_state = match eff_state {
                SessionState::Failed => PipelineState::Fail,
                _ => PipelineState::Stopped,
            };
            rec.lease_expires_at_unix = 0;
            rec.updated_at_unix = now_unix();
            Ok(())
        });

        let (final_state, final_code, profile_name) = match settled {
            Ok(updated) => {
                record_fsm_transition(prev.get(), updated.state);
                (updated.state, updated.reason, updated.profile.name.clone())
            }
            Err(StoreError::Rejected(_)) => {
                // Another path (stop-on-NEW, sweeper) already settled it.
                debug!("record already terminal at finalize");
                (SessionState::Stopped, code, scratch.profile_name.clone())
            }
            Err(StoreError::NotFound) => {
                (state_on_clean, code, scratch.profile_name.clone())
            }
            Err(err) => {
                error!(error = %err, "failed to settle session record");
                (state_on_clean, code, scratch.profile_name.clone())
            }
        };

        // Completed VOD output stays for playback; everything else goes.
        if final_state != SessionState::Draining {
            self.remove_session_dir(sid);
        }

        // Belt and suspenders: release both leases even if the normal
        // release path did not run.
        for key in [scratch.tuner_key.take(), scratch.dedup_key.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.store.release_lease(&key, sid) {
                warn!(error = %err, lease_key = %key, "failed to release lease");
            }
        }

        record_session_end(final_code, &profile_name);
        info!(
            state = final_state.as_str(),
            reason = final_code.as_str(),
            "session finalized"
        );
    }

    fn remove_session_dir(&self, sid: &str) {
        let Ok(dir) = self.layout.session_dir(sid) else {
            return;
        };
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!("session output removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = %err, "failed to remove session output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::transcoder::TranscodeError;
    use crate::tuner::PassthroughTuner;
    use async_trait::async_trait;

    struct NeverTranscoder;

    #[async_trait]
    impl Transcoder for NeverTranscoder {
        async fn start(
            &mut self,
            _session_id: &str,
            _source: &str,
            _profile: &StreamProfile,
            _start_ms: u64,
        ) -> Result<(), TranscodeError> {
            Err(TranscodeError::Spawn("unused in these tests".to_string()))
        }

        async fn wait(
            &mut self,
            _cancel: &CancellationToken,
        ) -> Result<ExitStatus, TranscodeError> {
            Err(TranscodeError::NotStarted)
        }

        async fn stop(&mut self) -> Result<(), TranscodeError> {
            Ok(())
        }

        fn last_log_lines(&self, _n: usize) -> Vec<String> {
            Vec::new()
        }
    }

    struct NeverFactory;

    impl TranscoderFactory for NeverFactory {
        fn create(&self) -> Box<dyn Transcoder> {
            Box::new(NeverTranscoder)
        }
    }

    fn orchestrator(dir: &std::path::Path) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(Bus::new(16));
        let config = Config::new(dir);
        let orch = Orchestrator::new(
            store.clone() as Arc<dyn SessionStore>,
            bus,
            Arc::new(PassthroughTuner),
            Arc::new(NeverFactory),
            config,
            CancellationToken::new(),
        );
        (orch, store)
    }

    fn start_request(sid: &str) -> StartRequest {
        StartRequest {
            session_id: sid.to_string(),
            service_ref: "svc-A".to_string(),
            profile: StreamProfile::hd(),
            mode: SessionMode::Live,
            source: None,
            start_ms: 0,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn submit_start_rejects_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(dir.path());
        let mut req = start_request("ok");
        req.session_id = "../escape".to_string();
        let err = orch.submit_start(req).await.unwrap_err();
        assert_eq!(err.code, ReasonCode::BadRequest);
    }

    #[tokio::test]
    async fn submit_start_requires_recording_source() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(dir.path());
        let mut req = start_request("s1");
        req.mode = SessionMode::Recording;
        req.source = None;
        let err = orch.submit_start(req).await.unwrap_err();
        assert_eq!(err.code, ReasonCode::BadRequest);
    }

    #[tokio::test]
    async fn submit_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, store) = orchestrator(dir.path());

        let mut req = start_request("s1");
        req.idempotency_key = Some("retry-key".to_string());
        assert_eq!(orch.submit_start(req).await.unwrap(), "s1");

        let mut replay = start_request("s2");
        replay.idempotency_key = Some("retry-key".to_string());
        assert_eq!(orch.submit_start(replay).await.unwrap(), "s1");
        assert!(store.get_session("s2").unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_on_new_session_short_circuits_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, store) = orchestrator(dir.path());
        store
            .put_session(&SessionRecord::new("s1", "svc-A", StreamProfile::hd()))
            .unwrap();

        orch.handle_stop(StopIntent {
            session_id: "s1".to_string(),
            reason: "user".to_string(),
        })
        .await;

        let rec = store.get_session("s1").unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Stopped);
        assert_eq!(rec.reason, ReasonCode::ClientStop);
        assert_eq!(rec.stop_reason, "user");
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_terminal_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, store) = orchestrator(dir.path());
        let mut rec = SessionRecord::new("s1", "svc-A", StreamProfile::hd());
        rec.state = SessionState::Failed;
        rec.reason = ReasonCode::TuneTimeout;
        store.put_session(&rec).unwrap();

        for _ in 0..2 {
            orch.handle_stop(StopIntent {
                session_id: "s1".to_string(),
                reason: "late".to_string(),
            })
            .await;
        }

        let after = store.get_session("s1").unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        assert_eq!(after.reason, ReasonCode::TuneTimeout);
    }

    #[tokio::test]
    async fn stop_on_running_session_sets_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, store) = orchestrator(dir.path());
        let mut rec = SessionRecord::new("s1", "svc-A", StreamProfile::hd());
        rec.state = SessionState::Ready;
        store.put_session(&rec).unwrap();

        let token = CancellationToken::new();
        orch.active.register("s1", token.clone());

        orch.handle_stop(StopIntent {
            session_id: "s1".to_string(),
            reason: "CLIENT_STOP".to_string(),
        })
        .await;

        let after = store.get_session("s1").unwrap().unwrap();
        assert_eq!(after.state, SessionState::Stopping);
        assert_eq!(after.pipeline_state, PipelineState::StopRequested);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn start_for_unknown_session_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(dir.path());
        let mut scratch = StartScratch::new();
        let token = CancellationToken::new();
        let err = orch
            .run_start("ghost", &token, &mut scratch)
            .await
            .unwrap_err();
        assert_eq!(err.code, ReasonCode::NotFound);
    }
}
