//! Tuner contract.
//!
//! The orchestrator acquires receiver attention through this trait and
//! nothing else; the concrete OpenWebIF protocol (stream URL resolution,
//! retries, signal-lock probing) lives behind it. Errors are typed
//! sentinels so the reason classifier never string-matches.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TunerError {
    /// The receiver did not produce a playable stream within the budget.
    #[error("tuner not ready within budget")]
    ReadyTimeout,
    /// The upstream source is unreachable or refused the service.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("tune canceled")]
    Canceled,
    #[error("{0}")]
    Other(String),
}

/// Acquires receiver attention for a service reference.
#[async_trait]
pub trait Tuner: Send + Sync {
    /// Blocks until the receiver emits a playable stream for `service_ref`,
    /// the token is cancelled, or an unrecoverable error occurs.
    ///
    /// Implementations may short-circuit for direct HTTP URL "service
    /// references" (recordings, IPTV).
    async fn tune(&self, cancel: &CancellationToken, service_ref: &str) -> Result<(), TunerError>;

    /// Liveness probe, optionally consulted by the lease heartbeat.
    async fn healthy(&self) -> Result<(), TunerError>;

    async fn close(&self) -> Result<(), TunerError>;
}

/// Tuner for deployments without a receiver in the loop.
///
/// Direct URLs and local files need no tuning, so `tune` short-circuits
/// for them and refuses genuine receiver service references.
pub struct PassthroughTuner;

#[async_trait]
impl Tuner for PassthroughTuner {
    async fn tune(&self, cancel: &CancellationToken, service_ref: &str) -> Result<(), TunerError> {
        if cancel.is_cancelled() {
            return Err(TunerError::Canceled);
        }
        let direct = service_ref.starts_with("http://")
            || service_ref.starts_with("https://")
            || service_ref.starts_with('/');
        if direct {
            Ok(())
        } else {
            Err(TunerError::UpstreamUnavailable(format!(
                "no receiver configured for service reference ({} chars)",
                service_ref.len()
            )))
        }
    }

    async fn healthy(&self) -> Result<(), TunerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TunerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_accepts_direct_sources() {
        let tuner = PassthroughTuner;
        let cancel = CancellationToken::new();
        assert!(tuner.tune(&cancel, "http://host/rec.ts").await.is_ok());
        assert!(tuner.tune(&cancel, "/media/rec.ts").await.is_ok());
    }

    #[tokio::test]
    async fn passthrough_refuses_service_refs() {
        let tuner = PassthroughTuner;
        let cancel = CancellationToken::new();
        let err = tuner.tune(&cancel, "1:0:19:283D:3FB:1:C00000:0:0:0:").await;
        assert!(matches!(err, Err(TunerError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn passthrough_honors_cancellation() {
        let tuner = PassthroughTuner;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            tuner.tune(&cancel, "http://host/rec.ts").await,
            Err(TunerError::Canceled)
        ));
    }
}
