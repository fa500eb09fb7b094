//! In-memory store backend for tests and embedded use.
//!
//! A single mutex guards all three tables, which trivially provides the
//! per-id atomicity the trait demands. Queries scan and filter (O(N)).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    expiry_from_ttl, IdempotencyRecord, LeaseRecord, PutOutcome, SessionFilter, SessionStore,
    StoreError, StoreResult,
};
use crate::session::SessionRecord;
use crate::utils::now_unix;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    idempotency: HashMap<String, IdempotencyRecord>,
    leases: HashMap<String, LeaseRecord>,
}

/// Volatile [`SessionStore`] with the same semantics as the sled backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn put_session(&self, rec: &SessionRecord) -> StoreResult<()> {
        self.inner
            .lock()
            .sessions
            .insert(rec.session_id.clone(), rec.clone());
        Ok(())
    }

    fn put_session_with_idempotency(
        &self,
        rec: &SessionRecord,
        idem_key: &str,
        ttl: Duration,
    ) -> StoreResult<PutOutcome> {
        let now = now_unix();
        let expires = expiry_from_ttl(now, ttl)?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.idempotency.get(idem_key) {
            if existing.expires_at_unix > now {
                return Ok(PutOutcome::Replayed(existing.session_id.clone()));
            }
        }
        inner
            .sessions
            .insert(rec.session_id.clone(), rec.clone());
        inner.idempotency.insert(
            idem_key.to_string(),
            IdempotencyRecord {
                session_id: rec.session_id.clone(),
                expires_at_unix: expires,
            },
        );
        Ok(PutOutcome::Stored)
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    fn update_session(
        &self,
        id: &str,
        apply: &dyn Fn(&mut SessionRecord) -> StoreResult<()>,
    ) -> StoreResult<SessionRecord> {
        let mut inner = self.inner.lock();
        let stored = inner.sessions.get(id).ok_or(StoreError::NotFound)?;
        let mut candidate = stored.clone();
        apply(&mut candidate)?;
        inner.sessions.insert(id.to_string(), candidate.clone());
        Ok(candidate)
    }

    fn query_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<SessionRecord>> {
        Ok(self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|rec| filter.matches(rec))
            .cloned()
            .collect())
    }

    fn scan_sessions(&self, visit: &mut dyn FnMut(SessionRecord) -> bool) -> StoreResult<()> {
        // Snapshot first so the callback never runs under the lock.
        let snapshot: Vec<SessionRecord> =
            self.inner.lock().sessions.values().cloned().collect();
        for rec in snapshot {
            if !visit(rec) {
                break;
            }
        }
        Ok(())
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.inner.lock().sessions.remove(id);
        Ok(())
    }

    fn put_idempotency(&self, key: &str, session_id: &str, ttl: Duration) -> StoreResult<()> {
        let expires = expiry_from_ttl(now_unix(), ttl)?;
        self.inner.lock().idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                session_id: session_id.to_string(),
                expires_at_unix: expires,
            },
        );
        Ok(())
    }

    fn get_idempotency(&self, key: &str) -> StoreResult<Option<String>> {
        let now = now_unix();
        let mut inner = self.inner.lock();
        match inner.idempotency.get(key) {
            Some(rec) if rec.expires_at_unix > now => Ok(Some(rec.session_id.clone())),
            Some(_) => {
                inner.idempotency.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseRecord>> {
        let now = now_unix();
        let expires = expiry_from_ttl(now, ttl)?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.leases.get(key) {
            if !existing.expired_at(now) && existing.owner != owner {
                return Ok(None);
            }
        }
        let lease = LeaseRecord {
            key: key.to_string(),
            owner: owner.to_string(),
            expires_at_unix: expires,
        };
        inner.leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    fn renew_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Option<LeaseRecord>> {
        let now = now_unix();
        let expires = expiry_from_ttl(now, ttl)?;
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(key) {
            Some(lease) if lease.owner == owner && !lease.expired_at(now) => {
                lease.expires_at_unix = expires;
                Ok(Some(lease.clone()))
            }
            _ => Ok(None),
        }
    }

    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner
            .leases
            .get(key)
            .is_some_and(|lease| lease.owner == owner)
        {
            inner.leases.remove(key);
        }
        Ok(())
    }

    fn delete_all_leases(&self) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let count = inner.leases.len();
        inner.leases.clear();
        Ok(count)
    }
}
