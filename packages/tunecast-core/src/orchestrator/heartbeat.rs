//! Lease heartbeat renewer.
//!
//! One task per live session renews the tuner lease ahead of its TTL and
//! mirrors the new expiry onto the session record so the sweeper's expiry
//! belt stays accurate. A lost lease is unrecoverable for the session: it
//! is marked FAILED and the work context is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::record_lease_lost;
use crate::reason::ReasonCode;
use crate::session::{PipelineState, SessionState};
use crate::store::{SessionStore, StoreError};
use crate::utils::now_unix;

/// Spawns the renewer for one session's tuner lease.
///
/// Exits when the token fires or the lease is lost. On loss the session is
/// transitioned to `FAILED(LEASE_EXPIRED)` (unless already terminal) and
/// `token` is cancelled so the in-flight work unwinds.
pub fn spawn_heartbeat(
    store: Arc<dyn SessionStore>,
    session_id: String,
    lease_key: String,
    ttl: Duration,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; skip it so the lease acquired
        // moments ago is not renewed twice in a row.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match store.renew_lease(&lease_key, &session_id, ttl) {
                Ok(Some(lease)) => {
                    debug!(lease_key = %lease_key, "lease renewed");
                    let expires = lease.expires_at_unix;
                    let refresh = store.update_session(&session_id, &|rec| {
                        if rec.state.is_terminal() {
                            return Err(StoreError::Rejected("terminal".to_string()));
                        }
                        rec.lease_expires_at_unix = expires;
                        rec.updated_at_unix = now_unix();
                        Ok(())
                    });
                    if let Err(StoreError::Rejected(_)) = refresh {
                        // Session finished in the meantime; nothing to renew for.
                        return;
                    }
                }
                Ok(None) => {
                    warn!(lease_key = %lease_key, "lease lost, failing session");
                    record_lease_lost();
                    let _ = store.update_session(&session_id, &|rec| {
                        if rec.state.is_terminal() {
                            return Err(StoreError::Rejected("terminal".to_string()));
                        }
                        rec.state = SessionState::Failed;
                        rec.pipeline_state = PipelineState::Fail;
                        rec.reason = ReasonCode::LeaseExpired;
                        rec.reason_detail = "tuner lease lost".to_string();
                        rec.updated_at_unix = now_unix();
                        Ok(())
                    });
                    token.cancel();
                    return;
                }
                Err(err) => {
                    // Transient store trouble; the lease may still be live.
                    // Retry on the next tick rather than killing the session.
                    warn!(error = %err, lease_key = %lease_key, "lease renew errored");
                }
            }
        }
    })
}
