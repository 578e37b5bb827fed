//! Assignment registry — at-most-once credential issuance per peer.
//!
//! One mutex guards the pool, the assignment map, and the issuance RNG
//! together. Every mutation (peer requests and admin pool edits) runs its
//! whole read-modify-write under that lock, so the existence check and the
//! record insert in [`Registry::request_assignment`] cannot interleave with
//! another request, for the same peer or any other. The write-through to
//! the state store also happens under the lock, before the in-memory
//! mutation, so a persistence failure leaves memory untouched.
//!
//! The lock is never held across network I/O. Callers that need to talk to
//! the billing API (revocation, provisioning) take a snapshot, release,
//! then call out.

use crate::error::{PoolError, RequestError};
use crate::pool::{Credential, CredentialPool, CredentialState};
use crate::store::{AssignmentRow, StateStore};
use anyhow::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;

/// The permanent record binding a peer to its issued credential.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub peer_id: String,
    pub credential: String,
    pub issued_at: i64,
}

/// Outcome of a peer credential request.
#[derive(Debug, Clone)]
pub struct Issued {
    pub credential: String,
    /// False when the peer already held an assignment and the call was a
    /// side-effect-free repeat.
    pub fresh: bool,
}

/// Read-only snapshot of one credential plus its derived peer list.
#[derive(Debug, Clone)]
pub struct CredentialView {
    pub value: String,
    pub state: CredentialState,
    pub created_at: i64,
    pub retired_at: Option<i64>,
    pub remote_id: Option<String>,
    pub peers: Vec<String>,
}

struct Inner {
    pool: CredentialPool,
    assignments: HashMap<String, AssignmentRecord>,
    rng: StdRng,
}

/// Process-wide registry. Cheap to share via `Arc`.
pub struct Registry {
    inner: Mutex<Inner>,
    store: Arc<StateStore>,
}

impl Registry {
    /// Load prior state from the store and build the registry around it.
    pub fn open(store: Arc<StateStore>) -> Result<Self> {
        Self::open_with_seed(store, rand::random())
    }

    /// Same as [`Registry::open`] with a fixed RNG seed, for deterministic
    /// issuance in tests.
    pub fn open_with_seed(store: Arc<StateStore>, seed: u64) -> Result<Self> {
        let credentials = store.load_credentials()?.into_iter().map(|row| {
            let state = CredentialState::parse(&row.state).unwrap_or(CredentialState::Deleted);
            Credential {
                value: row.value,
                state,
                created_at: row.created_at,
                retired_at: row.retired_at,
                remote_id: row.remote_id,
            }
        });
        let pool = CredentialPool::from_rows(credentials);

        let assignments = store
            .load_assignments()?
            .into_iter()
            .map(|row: AssignmentRow| {
                (
                    row.peer_id.clone(),
                    AssignmentRecord {
                        peer_id: row.peer_id,
                        credential: row.credential,
                        issued_at: row.issued_at,
                    },
                )
            })
            .collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                pool,
                assignments,
                rng: StdRng::seed_from_u64(seed),
            }),
            store,
        })
    }

    // ── Peer path ───────────────────────────────────────────────────

    /// Issue a credential to `peer_id`, or return the one it already holds.
    ///
    /// Idempotent: any number of calls for the same peer — concurrent or
    /// repeated — yields the same credential and exactly one record.
    /// `NoCredentialsAvailable` propagates without creating any record.
    pub fn request_assignment(&self, peer_id: &str, now: i64) -> Result<Issued, RequestError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(existing) = inner.assignments.get(peer_id) {
            return Ok(Issued {
                credential: existing.credential.clone(),
                fresh: false,
            });
        }

        let credential = inner.pool.select_for_issuance(&mut inner.rng)?;

        // Persist first: a store failure must not leave a memory-only record.
        self.store
            .insert_assignment(peer_id, &credential, now)
            .map_err(|e| RequestError::Store(e.to_string()))?;

        let previous = inner.assignments.insert(
            peer_id.to_string(),
            AssignmentRecord {
                peer_id: peer_id.to_string(),
                credential: credential.clone(),
                issued_at: now,
            },
        );
        debug_assert!(previous.is_none(), "duplicate assignment for {peer_id}");

        tracing::info!(peer = peer_id, "issued credential to peer");
        Ok(Issued {
            credential,
            fresh: true,
        })
    }

    // ── Admin pool operations ───────────────────────────────────────

    /// Add a credential to the active set.
    pub fn add_credential(
        &self,
        value: &str,
        now: i64,
        remote_id: Option<String>,
    ) -> Result<(), RequestError> {
        let mut inner = self.inner.lock();
        // Validate against the full map before touching the store.
        if inner.pool.get(value).is_some() {
            return Err(PoolError::AlreadyExists.into());
        }
        self.store
            .insert_credential(value, now, remote_id.as_deref())
            .map_err(|e| RequestError::Store(e.to_string()))?;
        inner
            .pool
            .add(value, now, remote_id)
            .expect("pool add after existence check");
        Ok(())
    }

    /// Retire an active credential.
    pub fn retire_credential(&self, value: &str, now: i64) -> Result<(), RequestError> {
        let mut inner = self.inner.lock();
        match inner.pool.get(value) {
            Some(c) if c.state == CredentialState::Active => {}
            _ => return Err(PoolError::NotActive.into()),
        }
        self.store
            .mark_retired(value, now)
            .map_err(|e| RequestError::Store(e.to_string()))?;
        inner.pool.retire(value, now).expect("retire after state check");
        Ok(())
    }

    /// Delete an active or retired credential. Returns its billing-side id,
    /// if known, so the caller can request best-effort remote revocation
    /// after releasing the registry.
    pub fn delete_credential(&self, value: &str) -> Result<Option<String>, RequestError> {
        let mut inner = self.inner.lock();
        match inner.pool.get(value) {
            Some(c) if c.state != CredentialState::Deleted => {}
            _ => return Err(PoolError::NotFound.into()),
        }
        self.store
            .mark_deleted(value)
            .map_err(|e| RequestError::Store(e.to_string()))?;
        let remote_id = inner.pool.delete(value).expect("delete after state check");
        Ok(remote_id)
    }

    // ── Consistent read snapshots ───────────────────────────────────

    /// The credential a peer holds, if any.
    pub fn assignment_for(&self, peer_id: &str) -> Option<AssignmentRecord> {
        self.inner.lock().assignments.get(peer_id).cloned()
    }

    /// Peers assigned to a credential — derived from the assignment
    /// records, never stored separately.
    pub fn peers_for(&self, credential: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut peers: Vec<String> = inner
            .assignments
            .values()
            .filter(|r| r.credential == credential)
            .map(|r| r.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Every non-deleted credential with its derived peer list.
    pub fn list_credentials(&self) -> Vec<CredentialView> {
        let inner = self.inner.lock();
        inner
            .pool
            .iter_all()
            .filter(|c| c.state != CredentialState::Deleted)
            .map(|c| {
                let mut peers: Vec<String> = inner
                    .assignments
                    .values()
                    .filter(|r| r.credential == c.value)
                    .map(|r| r.peer_id.clone())
                    .collect();
                peers.sort();
                CredentialView {
                    value: c.value.clone(),
                    state: c.state,
                    created_at: c.created_at,
                    retired_at: c.retired_at,
                    remote_id: c.remote_id.clone(),
                    peers,
                }
            })
            .collect()
    }

    /// One credential's view regardless of state, including deleted.
    pub fn credential_view(&self, value: &str) -> Option<CredentialView> {
        let inner = self.inner.lock();
        inner.pool.get(value).map(|c| {
            let mut peers: Vec<String> = inner
                .assignments
                .values()
                .filter(|r| r.credential == c.value)
                .map(|r| r.peer_id.clone())
                .collect();
            peers.sort();
            CredentialView {
                value: c.value.clone(),
                state: c.state,
                created_at: c.created_at,
                retired_at: c.retired_at,
                remote_id: c.remote_id.clone(),
                peers,
            }
        })
    }

    /// Full issuance history, oldest first.
    pub fn assignment_history(&self) -> Vec<AssignmentRecord> {
        let inner = self.inner.lock();
        let mut records: Vec<AssignmentRecord> = inner.assignments.values().cloned().collect();
        records.sort_by(|a, b| (a.issued_at, &a.peer_id).cmp(&(b.issued_at, &b.peer_id)));
        records
    }

    /// Active ∪ retired credential values for cost queries.
    pub fn queryable_credentials(&self) -> Vec<String> {
        self.inner.lock().pool.queryable()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().pool.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn registry() -> Registry {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        Registry::open_with_seed(store, 42).unwrap()
    }

    #[test]
    fn repeat_requests_return_same_credential() {
        let reg = registry();
        reg.add_credential("K1", 10, None).unwrap();
        reg.add_credential("K2", 10, None).unwrap();

        let first = reg.request_assignment("alice.os", 100).unwrap();
        assert!(first.fresh);

        let second = reg.request_assignment("alice.os", 200).unwrap();
        assert!(!second.fresh);
        assert_eq!(first.credential, second.credential);

        let history = reg.assignment_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].issued_at, 100);
    }

    #[test]
    fn exhausted_pool_creates_no_record() {
        let reg = registry();
        let err = reg.request_assignment("carol.os", 100).unwrap_err();
        assert!(err.is_exhausted());
        assert!(reg.assignment_for("carol.os").is_none());
        assert!(reg.assignment_history().is_empty());
    }

    #[test]
    fn last_credential_is_shared_not_reissued() {
        let reg = registry();
        reg.add_credential("K1", 10, None).unwrap();

        let a = reg.request_assignment("alice.os", 100).unwrap();
        let b = reg.request_assignment("bob.os", 101).unwrap();
        assert_eq!(a.credential, "K1");
        assert_eq!(b.credential, "K1");

        let peers = reg.peers_for("K1");
        assert_eq!(peers, vec!["alice.os".to_string(), "bob.os".to_string()]);
    }

    #[test]
    fn retirement_keeps_existing_assignment() {
        let reg = registry();
        reg.add_credential("K1", 10, None).unwrap();
        reg.request_assignment("alice.os", 100).unwrap();

        reg.retire_credential("K1", 200).unwrap();

        // The peer keeps its credential; no re-issuance happens.
        let repeat = reg.request_assignment("alice.os", 300).unwrap();
        assert_eq!(repeat.credential, "K1");
        assert!(!repeat.fresh);

        // A new peer finds the pool empty.
        let err = reg.request_assignment("bob.os", 301).unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn deletion_retains_audit_trail() {
        let reg = registry();
        reg.add_credential("K1", 10, Some("id_1".into())).unwrap();
        reg.request_assignment("alice.os", 100).unwrap();

        let remote = reg.delete_credential("K1").unwrap();
        assert_eq!(remote.as_deref(), Some("id_1"));

        // Assignment history survives deletion.
        assert_eq!(reg.assignment_history().len(), 1);
        assert_eq!(reg.peers_for("K1"), vec!["alice.os".to_string()]);
        assert!(reg.queryable_credentials().is_empty());
    }

    #[test]
    fn concurrent_same_peer_requests_issue_once() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = Arc::new(Registry::open_with_seed(store, 7).unwrap());
        reg.add_credential("K1", 10, None).unwrap();
        reg.add_credential("K2", 10, None).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                reg.request_assignment("alice.os", 100).unwrap().credential
            }));
        }

        let issued: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(issued.len(), 1, "all concurrent calls must agree");
        assert_eq!(reg.assignment_history().len(), 1);
    }

    #[test]
    fn concurrent_distinct_peers_never_overissue() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = Arc::new(Registry::open_with_seed(store, 7).unwrap());
        reg.add_credential("K1", 10, None).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                reg.request_assignment(&format!("peer-{i}.os"), 100)
                    .map(|issued| issued.credential)
            }));
        }

        for handle in handles {
            // Every peer gets the single remaining credential.
            assert_eq!(handle.join().unwrap().unwrap(), "K1");
        }
        assert_eq!(reg.peers_for("K1").len(), 8);
    }

    #[test]
    fn state_survives_restart() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        {
            let reg = Registry::open_with_seed(Arc::clone(&store), 1).unwrap();
            reg.add_credential("K1", 10, None).unwrap();
            reg.add_credential("K2", 20, None).unwrap();
            reg.retire_credential("K2", 30).unwrap();
            reg.request_assignment("alice.os", 100).unwrap();
        }

        let reopened = Registry::open_with_seed(store, 2).unwrap();
        assert_eq!(reopened.active_count(), 1);
        assert_eq!(
            reopened.queryable_credentials(),
            vec!["K1".to_string(), "K2".to_string()]
        );
        let repeat = reopened.request_assignment("alice.os", 200).unwrap();
        assert!(!repeat.fresh, "assignment history must survive restart");
    }
}
