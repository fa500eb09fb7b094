//! Durable store backend on sled.
//!
//! Three trees in one single-file database: `sessions`, `idempotency`,
//! `leases`. Values are JSON-encoded records. Writers are serialized by a
//! coarse mutex, which satisfies the per-id atomicity contract; reads go
//! straight to sled. Queries scan and filter (O(N) - sled has no secondary
//! index over record fields).

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use sled::{Db, Tree};

use super::{
    expiry_from_ttl, IdempotencyRecord, LeaseRecord, PutOutcome, SessionFilter, SessionStore,
    StoreError, StoreResult,
};
use crate::session::SessionRecord;
use crate::utils::now_unix;

const SESSIONS_TREE: &str = "sessions";
const IDEMPOTENCY_TREE: &str = "idempotency";
const LEASES_TREE: &str = "leases";

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Durable [`SessionStore`] backed by a sled database.
pub struct SledStore {
    _db: Db,
    sessions: Tree,
    idempotency: Tree,
    leases: Tree,
    /// Serializes read-modify-write sequences across all writers.
    write_lock: Mutex<()>,
}

impl SledStore {
    /// Opens (or creates) the database under `path`.
    ///
    /// The caller is responsible for holding the single-writer file lock on
    /// the enclosing data directory before opening.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            sessions: db.open_tree(SESSIONS_TREE)?,
            idempotency: db.open_tree(IDEMPOTENCY_TREE)?,
            leases: db.open_tree(LEASES_TREE)?,
            _db: db,
            write_lock: Mutex::new(()),
        })
    }

    fn read_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        match self.sessions.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_session(&self, rec: &SessionRecord) -> StoreResult<()> {
        let raw = serde_json::to_vec(rec)?;
        self.sessions.insert(rec.session_id.as_bytes(), raw)?;
        Ok(())
    }

    fn read_lease(&self, key: &str) -> StoreResult<Option<LeaseRecord>> {
        match self.leases.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_lease(&self, lease: &LeaseRecord) -> StoreResult<()> {
        let raw = serde_json::to_vec(lease)?;
        self.leases.insert(lease.key.as_bytes(), raw)?;
        Ok(())
    }
}

impl SessionStore for SledStore {
    fn put_session(&self, rec: &SessionRecord) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.write_session(rec)
    }

    fn put_session_with_idempotency(
        &self,
        rec: &SessionRecord,
        idem_key: &str,
        ttl: Duration,
    ) -> StoreResult<PutOutcome> {
        let now = now_unix();
        let expires = expiry_from_ttl(now, ttl)?;
        let _guard = self.write_lock.lock();

        if let Some(raw) = self.idempotency.get(idem_key.as_bytes())? {
            let existing: IdempotencyRecord = serde_json::from_slice(&raw)?;
            if existing.expires_at_unix > now {
                return Ok(PutOutcome::Replayed(existing.session_id));
            }
        }

        self.write_session(rec)?;
        let idem = IdempotencyRecord {
            session_id: rec.session_id.clone(),
            expires_at_unix: expires,
        };
        self.idempotency
            .insert(idem_key.as_bytes(), serde_json::to_vec(&idem)?)?;
        Ok(PutOutcome::Stored)
    }

    fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        self.read_session(id)
    }

    fn update_session(
        &self,
        id: &str,
        apply: &dyn Fn(&mut SessionRecord) -> StoreResult<()>,
    ) -> StoreResult<SessionRecord> {
        let _guard = self.write_lock.lock();
        let stored = self.read_session(id)?.ok_or(StoreError::NotFound)?;
        let mut candidate = stored;
        apply(&mut candidate)?;
        self.write_session(&candidate)?;
        Ok(candidate)
    }

    fn query_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<SessionRecord>> {
        let mut hits = Vec::new();
        for entry in self.sessions.iter() {
            let (_, raw) = entry?;
            let rec: SessionRecord = serde_json::from_slice(&raw)?;
            if filter.matches(&rec) {
                hits.push(rec);
            }
        }
        Ok(hits)
    }

    fn scan_sessions(&self, visit: &mut dyn FnMut(SessionRecord) -> bool) -> StoreResult<()> {
        for entry in self.sessions.iter() {
            let (_, raw) = entry?;
            let rec: SessionRecord = serde_json::from_slice(&raw)?;
            if !visit(rec) {
                break;
            }
        }
        Ok(())
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.sessions.remove(id.as_bytes())?;
        Ok(())
    }

    fn put_idempotency(&self, key: &str, session_id: &str, ttl: Duration) -> StoreResult<()> {
        let expires = expiry_from_ttl(now_unix(), ttl)?;
        let _guard = self.write_lock.lock();
        let rec = IdempotencyRecord {
            session_id: session_id.to_string(),
            expires_at_unix: expires,
        };
        self.idempotency
            .insert(key.as_bytes(), serde_json::to_vec(&rec)?)?;
        Ok(())
    }

    fn get_idempotency(&self, key: &str) -> StoreResult<Option<String>> {
        let now = now_unix();
        let _guard = self.write_lock.lock();
        match self.idempotency.get(key.as_bytes())? {
            Some(raw) => {
                let rec: IdempotencyRecord = serde_json::from_slice(&raw)?;
                if rec.expires_at_unix > now {
                    Ok(Some(rec.session_id))
                } else {
                    self.idempotency.remove(key.as_bytes())?;
                    Ok(None)
                }
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
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.read_lease(key)? {
            if !existing.expired_at(now) && existing.owner != owner {
                return Ok(None);
            }
        }
        let lease = LeaseRecord {
            key: key.to_string(),
            owner: owner.to_string(),
            expires_at_unix: expires,
        };
        self.write_lease(&lease)?;
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
        let _guard = self.write_lock.lock();

        match self.read_lease(key)? {
            Some(mut lease) if lease.owner == owner && !lease.expired_at(now) => {
                lease.expires_at_unix = expires;
                self.write_lease(&lease)?;
                Ok(Some(lease))
            }
            _ => Ok(None),
        }
    }

    fn release_lease(&self, key: &str, owner: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        if let Some(lease) = self.read_lease(key)? {
            if lease.owner == owner {
                self.leases.remove(key.as_bytes())?;
            }
        }
        Ok(())
    }

    fn delete_all_leases(&self) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        let count = self.leases.len();
        self.leases.clear()?;
        Ok(count)
    }
}
