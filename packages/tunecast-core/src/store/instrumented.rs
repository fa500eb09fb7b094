//! Metrics adapter for the store.
//!
//! Wraps any [`SessionStore`] and records per-operation latency histograms
//! and result counters. Operation names are static, so the label set stays
//! closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{LeaseRecord, PutOutcome, SessionFilter, SessionStore, StoreResult};
use crate::metrics::record_store_op;
use crate::session::SessionRecord;

/// [`SessionStore`] decorator that observes every operation.
pub struct InstrumentedStore {
    inner: Arc<dyn SessionStore>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn SessionStore>) -> Self {
        Self { inner }
    }

    fn observe<T>(&self, op: &'static str, run: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        let started = Instant::now();
        let result = run();
        record_store_op(op, result.is_ok(), started.elapsed().as_secs_f64());
        result
    }
}

impl SessionStore for InstrumentedStore {
    fn put_session(&self, rec: &SessionRecord) -> StoreResult<()> {
        self.observe("put_session", || self.inner.put_session(rec))
    }

    fn put_session_with_idempotency(
        &self,
        rec: &SessionRecord,
        idem_key: &str,
        ttl: Duration,
    ) -> StoreResult<PutOutcome> {
        self.observe("put_session_with_idempotency", || {
            self.inner.put_session_with_idempotency(rec, idem_key, ttl)
        })
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        self.observe("get_session", || self.inner.get_session(id))
    }

    fn update_session(
        &self,
        id: &str,
        apply: &dyn Fn(&mut SessionRecord) -> StoreResult<()>,
    ) -> StoreResult<SessionRecord> {
        self.observe("update_session", || self.inner.update_session(id, apply))
    }

    fn query_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<SessionRecord>> {
        self.observe("query_sessions", || self.inner.query_sessions(filter))
    }

    fn scan_sessions(&self, visit: &mut dyn FnMut(SessionRecord) -> bool) -> StoreResult<()> {
        self.observe("scan_sessions", || self.inner.scan_sessions(visit))
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.observe("delete_session", || self.inner.delete_session(id))
    }

    fn put_idempotency(&self, key: &str, session_id: &str, ttl: Duration) -> StoreResult<()> {
        self.observe("put_idempotency", || {
            self.inner.put_idempotency(key, session_id, ttl)
        })
    }

    fn get_idempotency(&self, key: &str) -> StoreResult<Option<String>> {
        self.observe("get_idempotency", || self.inner.get_idempotency(key))
    }

    fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseRecord>> {
        self.observe("try_acquire_lease", || {
            self.inner.try_acquire_lease(key, owner, ttl)
        })
    }

    fn renew_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseRecord>> {
        self.observe("renew_lease", || self.inner.renew_lease(key, owner, ttl))
    }

    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()> {
        self.observe("release_lease", || self.inner.release_lease(key, owner))
    }

    fn delete_all_leases(&self) -> StoreResult<usize> {
        self.observe("delete_all_leases", || self.inner.delete_all_leases())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamProfile;
    use crate::store::memory::MemoryStore;

    #[test]
    fn delegates_to_inner() {
        let store = InstrumentedStore::new(Arc::new(MemoryStore::new()));
        let rec = SessionRecord::new("s1", "svc", StreamProfile::hd());
        store.put_session(&rec).unwrap();
        assert_eq!(store.get_session("s1").unwrap().unwrap(), rec);
        assert!(store
            .try_acquire_lease("tuner:0", "s1", Duration::from_secs(10))
            .unwrap()
            .is_some());
        assert_eq!(store.delete_all_leases().unwrap(), 1);
    }
}
