//! Credential pool — the issuable (active) and historical (retired) sets.
//!
//! Lifecycle states move one way only: `Active -> Retired -> Deleted`.
//! Deleted credentials stay in the map so their values can never be
//! re-added, but they are excluded from issuance and from cost queries.
//!
//! Issuance draws uniformly from a deterministically ordered snapshot of
//! the active set (insertion order), with the RNG injected by the owner,
//! so a seeded generator makes draws reproducible in tests.

use crate::error::PoolError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle position of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialState {
    Active,
    Retired,
    Deleted,
}

impl CredentialState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Retired => "retired",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A managed credential. Identity is the secret value itself.
#[derive(Debug, Clone)]
pub struct Credential {
    pub value: String,
    pub state: CredentialState,
    pub created_at: i64,
    pub retired_at: Option<i64>,
    /// Billing-side id for this credential, when known. Used for
    /// best-effort remote revocation on deletion.
    pub remote_id: Option<String>,
}

/// In-memory credential pool. Owned and serialized by the registry.
#[derive(Debug, Default)]
pub struct CredentialPool {
    credentials: HashMap<String, Credential>,
    /// Active values in insertion order — the ordered snapshot issuance
    /// draws from.
    active_order: Vec<String>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted rows. Rows are expected in creation order.
    pub fn from_rows(rows: impl IntoIterator<Item = Credential>) -> Self {
        let mut pool = Self::new();
        for credential in rows {
            if credential.state == CredentialState::Active {
                pool.active_order.push(credential.value.clone());
            }
            pool.credentials.insert(credential.value.clone(), credential);
        }
        pool
    }

    /// Insert a new active credential.
    pub fn add(
        &mut self,
        value: &str,
        created_at: i64,
        remote_id: Option<String>,
    ) -> Result<(), PoolError> {
        if self.credentials.contains_key(value) {
            return Err(PoolError::AlreadyExists);
        }
        self.credentials.insert(
            value.to_string(),
            Credential {
                value: value.to_string(),
                state: CredentialState::Active,
                created_at,
                retired_at: None,
                remote_id,
            },
        );
        self.active_order.push(value.to_string());
        Ok(())
    }

    /// Move an active credential to the retired set. It stops being
    /// issuable but remains valid for cost queries and keeps its peers.
    pub fn retire(&mut self, value: &str, retired_at: i64) -> Result<(), PoolError> {
        let credential = self
            .credentials
            .get_mut(value)
            .filter(|c| c.state == CredentialState::Active)
            .ok_or(PoolError::NotActive)?;
        credential.state = CredentialState::Retired;
        credential.retired_at = Some(retired_at);
        self.active_order.retain(|v| v != value);
        Ok(())
    }

    /// Move an active or retired credential to the terminal deleted state.
    /// Returns the remote id, if any, so the caller can request revocation.
    pub fn delete(&mut self, value: &str) -> Result<Option<String>, PoolError> {
        let credential = self
            .credentials
            .get_mut(value)
            .filter(|c| c.state != CredentialState::Deleted)
            .ok_or(PoolError::NotFound)?;
        credential.state = CredentialState::Deleted;
        self.active_order.retain(|v| v != value);
        Ok(credential.remote_id.clone())
    }

    /// Draw one credential uniformly at random from the active set.
    pub fn select_for_issuance<R: Rng>(&self, rng: &mut R) -> Result<String, PoolError> {
        if self.active_order.is_empty() {
            return Err(PoolError::NoCredentialsAvailable);
        }
        let idx = rng.random_range(0..self.active_order.len());
        Ok(self.active_order[idx].clone())
    }

    pub fn get(&self, value: &str) -> Option<&Credential> {
        self.credentials.get(value)
    }

    pub fn active_count(&self) -> usize {
        self.active_order.len()
    }

    /// All credentials in creation order, including deleted ones.
    pub fn iter_all(&self) -> impl Iterator<Item = &Credential> {
        let mut all: Vec<&Credential> = self.credentials.values().collect();
        all.sort_by(|a, b| (a.created_at, &a.value).cmp(&(b.created_at, &b.value)));
        all.into_iter()
    }

    /// Active ∪ retired values — the set new cost queries cover.
    pub fn queryable(&self) -> Vec<String> {
        self.iter_all()
            .filter(|c| c.state != CredentialState::Deleted)
            .map(|c| c.value.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn add_rejects_any_known_value() {
        let mut pool = CredentialPool::new();
        pool.add("K1", 10, None).unwrap();
        assert_eq!(pool.add("K1", 20, None), Err(PoolError::AlreadyExists));

        pool.retire("K1", 30).unwrap();
        assert_eq!(pool.add("K1", 40, None), Err(PoolError::AlreadyExists));

        pool.delete("K1").unwrap();
        assert_eq!(pool.add("K1", 50, None), Err(PoolError::AlreadyExists));
    }

    #[test]
    fn lifecycle_is_one_directional() {
        let mut pool = CredentialPool::new();
        pool.add("K1", 10, None).unwrap();

        pool.retire("K1", 20).unwrap();
        // Retiring twice fails: the credential is no longer active.
        assert_eq!(pool.retire("K1", 30), Err(PoolError::NotActive));

        pool.delete("K1").unwrap();
        assert_eq!(pool.delete("K1"), Err(PoolError::NotFound));
        assert_eq!(pool.retire("K1", 40), Err(PoolError::NotActive));
        assert_eq!(pool.get("K1").unwrap().state, CredentialState::Deleted);
    }

    #[test]
    fn delete_works_from_active_and_retired() {
        let mut pool = CredentialPool::new();
        pool.add("K1", 10, Some("id_1".into())).unwrap();
        pool.add("K2", 10, None).unwrap();
        pool.retire("K2", 20).unwrap();

        assert_eq!(pool.delete("K1").unwrap(), Some("id_1".to_string()));
        assert_eq!(pool.delete("K2").unwrap(), None);
        assert_eq!(pool.delete("K3"), Err(PoolError::NotFound));
    }

    #[test]
    fn select_fails_on_empty_active_set() {
        let mut pool = CredentialPool::new();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            pool.select_for_issuance(&mut rng),
            Err(PoolError::NoCredentialsAvailable)
        );

        pool.add("K1", 10, None).unwrap();
        pool.retire("K1", 20).unwrap();
        assert_eq!(
            pool.select_for_issuance(&mut rng),
            Err(PoolError::NoCredentialsAvailable)
        );
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let mut pool = CredentialPool::new();
        pool.add("K1", 10, None).unwrap();
        pool.add("K2", 20, None).unwrap();
        pool.add("K3", 30, None).unwrap();

        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..16 {
            assert_eq!(
                pool.select_for_issuance(&mut a).unwrap(),
                pool.select_for_issuance(&mut b).unwrap()
            );
        }
    }

    #[test]
    fn queryable_excludes_deleted() {
        let mut pool = CredentialPool::new();
        pool.add("K1", 10, None).unwrap();
        pool.add("K2", 20, None).unwrap();
        pool.add("K3", 30, None).unwrap();
        pool.retire("K2", 40).unwrap();
        pool.delete("K3").unwrap();

        assert_eq!(pool.queryable(), vec!["K1".to_string(), "K2".to_string()]);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn restore_from_rows_preserves_order_and_states() {
        let rows = vec![
            Credential {
                value: "K1".into(),
                state: CredentialState::Retired,
                created_at: 10,
                retired_at: Some(50),
                remote_id: None,
            },
            Credential {
                value: "K2".into(),
                state: CredentialState::Active,
                created_at: 20,
                retired_at: None,
                remote_id: Some("id_2".into()),
            },
        ];
        let pool = CredentialPool::from_rows(rows);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.get("K1").unwrap().state, CredentialState::Retired);
        assert_eq!(pool.get("K2").unwrap().remote_id.as_deref(), Some("id_2"));
    }
}
