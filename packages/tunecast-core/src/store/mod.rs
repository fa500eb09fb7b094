//! Durable session state.
//!
//! [`SessionStore`] is the single write path for session records, the
//! idempotency table and the lease table. Two backends honor identical
//! semantics: [`sled::SledStore`] (durable, canonical) and
//! [`memory::MemoryStore`] (tests). [`instrumented::InstrumentedStore`]
//! wraps either with per-operation latency metrics.
//!
//! All methods are synchronous and thread-safe; callers run them from async
//! tasks and rely on them being short. Records returned are defensive
//! copies - mutating one has no effect until it is written back.

pub mod instrumented;
pub mod memory;
pub mod sled;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{SessionRecord, SessionState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("invalid ttl")]
    InvalidTtl,
    /// Reserved for intake layers that want replay to be an error rather
    /// than an outcome.
    #[error("idempotent replay")]
    IdempotentReplay,
    /// An `update_session` closure refused the update; the stored record is
    /// unchanged.
    #[error("update rejected: {0}")]
    Rejected(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of the transactional "create session + reserve idempotency key".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record and key were written.
    Stored,
    /// A fresh key already existed; nothing was written. Carries the
    /// session id the key points at.
    Replayed(String),
}

/// `(key) -> (session_id, expires_at)`; lazily deleted on read-past-expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub session_id: String,
    pub expires_at_unix: i64,
}

/// Single-writer TTL reservation for a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub owner: String,
    pub expires_at_unix: i64,
}

impl LeaseRecord {
    #[must_use]
    pub fn expired_at(&self, now_unix: i64) -> bool {
        self.expires_at_unix <= now_unix
    }
}

/// Dedup lease key: one concurrent start per service reference.
#[must_use]
pub fn svc_lease_key(service_ref: &str) -> String {
    format!("svc:{service_ref}")
}

/// Tuner slot lease key: one session per physical slot.
#[must_use]
pub fn tuner_lease_key(slot: u32) -> String {
    format!("tuner:{slot}")
}

/// Filter for [`SessionStore::query_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Match any of these states; empty = all states.
    pub states: Vec<SessionState>,
    /// When > 0, match only records holding a lease
    /// (`lease_expires_at_unix > 0`) that expires at or before this
    /// threshold. Zero means no lease bound.
    pub lease_expires_before: i64,
}

impl SessionFilter {
    #[must_use]
    pub fn states(states: &[SessionState]) -> Self {
        Self {
            states: states.to_vec(),
            lease_expires_before: 0,
        }
    }

    #[must_use]
    pub fn matches(&self, rec: &SessionRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&rec.state) {
            return false;
        }
        if self.lease_expires_before > 0 {
            if rec.lease_expires_at_unix == 0 {
                return false;
            }
            if rec.lease_expires_at_unix > self.lease_expires_before {
                return false;
            }
        }
        true
    }
}

/// Converts a TTL into an absolute expiry, refusing zero TTLs.
pub(crate) fn expiry_from_ttl(now_unix: i64, ttl: Duration) -> StoreResult<i64> {
    if ttl.is_zero() {
        return Err(StoreError::InvalidTtl);
    }
    Ok(now_unix + ttl.as_secs().max(1) as i64)
}

/// Durable persistence of session records, idempotency keys and leases.
pub trait SessionStore: Send + Sync {
    /// Unconditional upsert; full replacement of the stored record.
    fn put_session(&self, rec: &SessionRecord) -> StoreResult<()>;

    /// Atomic "create session + reserve idempotency key". If `idem_key`
    /// exists and has not expired, returns [`PutOutcome::Replayed`] without
    /// writing anything; otherwise writes both the record and the key.
    fn put_session_with_idempotency(
        &self,
        rec: &SessionRecord,
        idem_key: &str,
        ttl: Duration,
    ) -> StoreResult<PutOutcome>;

    /// Returns `Ok(None)` when the id is unknown.
    fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Atomic read-modify-write on one record. `apply` receives a writable
    /// copy and may reject by returning an error, in which case the stored
    /// record is left unchanged and the error is surfaced. Returns the
    /// updated copy.
    fn update_session(
        &self,
        id: &str,
        apply: &dyn Fn(&mut SessionRecord) -> StoreResult<()>,
    ) -> StoreResult<SessionRecord>;

    /// Filtered query. Backends without an index scan and filter (O(N)).
    fn query_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<SessionRecord>>;

    /// Snapshot iteration; `visit` runs outside any store lock and returns
    /// `false` to stop early.
    fn scan_sessions(&self, visit: &mut dyn FnMut(SessionRecord) -> bool) -> StoreResult<()>;

    fn delete_session(&self, id: &str) -> StoreResult<()>;

    fn put_idempotency(&self, key: &str, session_id: &str, ttl: Duration) -> StoreResult<()>;

    /// Lazily deletes expired keys on read.
    fn get_idempotency(&self, key: &str) -> StoreResult<Option<String>>;

    /// Acquires if the key is free, the current record has expired, or the
    /// current owner equals `owner` (renewal via acquire). Returns `None`
    /// when another live owner holds the lease.
    fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseRecord>>;

    /// Renews only a live lease held by `owner`. Expired leases are not
    /// renewed; the caller must go through recovery.
    fn renew_lease(&self, key: &str, owner: &str, ttl: Duration)
        -> StoreResult<Option<LeaseRecord>>;

    /// No-op when the owner does not match.
    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()>;

    /// Flushes every lease; only sound while the data directory is held
    /// under the single-writer file lock.
    fn delete_all_leases(&self) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamProfile;

    #[test]
    fn lease_keys_have_stable_shape() {
        assert_eq!(svc_lease_key("1:0:19:ABC"), "svc:1:0:19:ABC");
        assert_eq!(tuner_lease_key(3), "tuner:3");
    }

    #[test]
    fn filter_skips_leaseless_records_when_bounded() {
        let mut rec = SessionRecord::new("s1", "svc", StreamProfile::hd());
        rec.state = SessionState::Ready;
        rec.lease_expires_at_unix = 0;

        let mut filter = SessionFilter::states(&[SessionState::Ready]);
        filter.lease_expires_before = 1_000;
        assert!(!filter.matches(&rec));

        rec.lease_expires_at_unix = 900;
        assert!(filter.matches(&rec));

        rec.lease_expires_at_unix = 1_001;
        assert!(!filter.matches(&rec));
    }

    #[test]
    fn filter_without_bounds_matches_state() {
        let mut rec = SessionRecord::new("s1", "svc", StreamProfile::hd());
        rec.state = SessionState::Failed;
        assert!(SessionFilter::default().matches(&rec));
        assert!(SessionFilter::states(&[SessionState::Failed]).matches(&rec));
        assert!(!SessionFilter::states(&[SessionState::Ready]).matches(&rec));
    }

    #[test]
    fn zero_ttl_is_invalid() {
        assert!(matches!(
            expiry_from_ttl(100, Duration::ZERO),
            Err(StoreError::InvalidTtl)
        ));
        assert_eq!(expiry_from_ttl(100, Duration::from_secs(30)).unwrap(), 130);
    }
}
