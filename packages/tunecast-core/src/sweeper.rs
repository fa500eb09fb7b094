//! Background garbage collection.
//!
//! Periodic tasks over the store and the output root:
//! - retire idle READY sessions (`IDLE_TIMEOUT`)
//! - expire sessions whose lease ran out behind the heartbeat's back
//! - delete terminal sessions past retention, along with their output
//! - remove orphan output directories that have no record
//!
//! A failed pass is logged and retried on the next tick; the sweeper never
//! takes the worker down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::Config;
use crate::events::{Intent, StopIntent, TOPIC_STOP};
use crate::layout::HlsLayout;
use crate::metrics::record_fsm_transition;
use crate::reason::ReasonCode;
use crate::session::{PipelineState, SessionState};
use crate::store::{SessionFilter, SessionStore, StoreError};
use crate::utils::now_unix;

const STOP_PUBLISH_BUDGET: Duration = Duration::from_secs(1);

/// Background GC for sessions, leases and output directories.
pub struct Sweeper {
    store: Arc<dyn SessionStore>,
    bus: Arc<Bus<Intent>>,
    layout: HlsLayout,
    config: Config,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn SessionStore>,
        bus: Arc<Bus<Intent>>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let layout = HlsLayout::new(&config.hls_root);
        Arc::new(Self {
            store,
            bus,
            layout,
            config,
            shutdown,
        })
    }

    /// Spawns the ticker task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                interval_secs = sweeper.config.sweep_interval().as_secs(),
                "sweeper running"
            );
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => break,
                    _ = ticker.tick() => sweeper.run_once().await,
                }
            }
            info!("sweeper stopped");
        })
    }

    /// One full pass. Public so tests can drive the sweeper synchronously.
    pub async fn run_once(&self) {
        self.stop_idle_sessions().await;
        self.expire_stale_leases().await;
        self.retire_terminal_sessions();
        self.remove_orphan_output();
    }

    /// READY sessions idle past the timeout move to STOPPING; the stop
    /// event lets the orchestrator's registered cancel interrupt the work.
    /// VOD sessions are exempt - they end by reaching DRAINING.
    async fn stop_idle_sessions(&self) {
        let cutoff = now_unix() - self.config.idle_timeout.as_secs() as i64;
        let ready = match self
            .store
            .query_sessions(&SessionFilter::states(&[SessionState::Ready]))
        {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "idle query failed");
                return;
            }
        };

        for rec in ready {
            if rec.profile.vod || rec.last_access_unix > cutoff {
                continue;
            }
            let sid = rec.session_id.clone();
            let result = self.store.update_session(&sid, &|r| {
                if r.state != SessionState::Ready {
                    return Err(StoreError::Rejected(r.state.as_str().to_string()));
                }
                r.state = SessionState::Stopping;
                r.pipeline_state = PipelineState::StopRequested;
                r.reason = ReasonCode::IdleTimeout;
                r.reason_detail = "no access within idle timeout".to_string();
                r.updated_at_unix = now_unix();
                Ok(())
            });
            match result {
                Ok(_) => {
                    record_fsm_transition(SessionState::Ready, SessionState::Stopping);
                    info!(idle_secs = now_unix() - rec.last_access_unix, "stopping idle session");
                    self.publish_stop(&sid, "IDLE_TIMEOUT").await;
                }
                Err(StoreError::Rejected(_)) => {}
                Err(err) => warn!(error = %err, "idle stop update failed"),
            }
        }
    }

    /// Belt for the heartbeat: sessions still nominally running whose
    /// recorded lease expiry passed are force-stopped.
    async fn expire_stale_leases(&self) {
        let mut filter = SessionFilter::states(&[
            SessionState::New,
            SessionState::Starting,
            SessionState::Ready,
        ]);
        filter.lease_expires_before = now_unix();

        let expired = match self.store.query_sessions(&filter) {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "lease expiry query failed");
                return;
            }
        };

        for rec in expired {
            let sid = rec.session_id.clone();
            let was_ready = rec.state == SessionState::Ready;
            let prev = rec.state;
            let result = self.store.update_session(&sid, &|r| {
                if r.state.is_terminal() {
                    return Err(StoreError::Rejected("terminal".to_string()));
                }
                r.state = SessionState::Stopped;
                r.pipeline_state = PipelineState::Stopped;
                r.reason = ReasonCode::LeaseExpired;
                r.reason_detail = "lease expired without renewal".to_string();
                r.lease_expires_at_unix = 0;
                r.updated_at_unix = now_unix();
                Ok(())
            });
            match result {
                Ok(_) => {
                    record_fsm_transition(prev, SessionState::Stopped);
                    warn!(state = prev.as_str(), "retired session with expired lease");
                    if was_ready {
                        self.publish_stop(&sid, "LEASE_EXPIRED").await;
                    }
                }
                Err(StoreError::Rejected(_)) => {}
                Err(err) => warn!(error = %err, "lease expiry update failed"),
            }
        }
    }

    /// Deletes terminal (and drained VOD) sessions past retention together
    /// with their output directories.
    fn retire_terminal_sessions(&self) {
        let cutoff = now_unix() - self.config.session_retention.as_secs() as i64;
        let mut retired = Vec::new();
        let scan = self.store.scan_sessions(&mut |rec| {
            let done = rec.state.is_terminal() || rec.state == SessionState::Draining;
            if done && rec.updated_at_unix <= cutoff {
                retired.push(rec.session_id);
            }
            true
        });
        if let Err(err) = scan {
            warn!(error = %err, "retention scan failed");
            return;
        }

        for sid in retired {
            if let Err(err) = self.store.delete_session(&sid) {
                warn!(error = %err, "retention delete failed");
                continue;
            }
            if let Ok(dir) = self.layout.session_dir(&sid) {
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(error = %err, "retention output removal failed"),
                }
            }
            debug!("retired terminal session");
        }
    }

    /// Removes `sessions/` entries old enough to be past retention that
    /// have no record. Entries younger than retention are skipped so a
    /// directory being created right now is never raced.
    fn remove_orphan_output(&self) {
        let root = self.layout.sessions_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(error = %err, "orphan scan failed");
                return;
            }
        };

        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let old_enough = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|age| age >= self.config.session_retention);
            if !old_enough {
                continue;
            }
            let known = matches!(self.store.get_session(&name), Ok(Some(_)));
            if known {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => info!(entry = %name, "removed orphan output"),
                Err(err) => warn!(error = %err, entry = %name, "orphan removal failed"),
            }
        }
    }

    async fn publish_stop(&self, session_id: &str, reason: &str) {
        self.bus
            .publish(
                TOPIC_STOP,
                Intent::Stop(StopIntent {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                }),
                STOP_PUBLISH_BUDGET,
                &self.shutdown,
            )
            .await;
    }
}
