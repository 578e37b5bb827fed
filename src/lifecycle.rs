//! Credential lifecycle scans.
//!
//! Each scan walks every non-deleted credential and applies the operator's
//! policy: active credentials past the retirement TTL are retired, retired
//! ones past the deletion grace are deleted. Transitions apply one at a
//! time and are individually fault-isolated — one failure is logged and
//! the scan moves on.
//!
//! Deletion asks the billing system to deactivate the credential remotely.
//! That call is best-effort: the local transition has already committed,
//! and a failed revocation only logs a warning (the next operator-driven
//! deletion attempt or manual remote cleanup picks it up).

use crate::billing::BillingApi;
use crate::config::LifecycleConfig;
use crate::pool::CredentialState;
use crate::registry::Registry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// What one policy scan did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub retired: usize,
    pub deleted: usize,
    pub revocation_failures: usize,
}

/// Applies retirement/deletion policy on a timer.
pub struct LifecycleManager {
    registry: Arc<Registry>,
    billing: Arc<dyn BillingApi>,
    policy: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<Registry>,
        billing: Arc<dyn BillingApi>,
        policy: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            billing,
            policy,
        }
    }

    /// Evaluate every non-deleted credential against policy at logical
    /// time `now`.
    pub async fn scan_at(&self, now: i64) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        // Snapshot outside any network call; each transition re-takes the
        // registry lock on its own so a slow revocation never holds it.
        let views = self.registry.list_credentials();

        for view in views {
            match view.state {
                CredentialState::Active => {
                    let Some(ttl) = self.policy.retirement_ttl_secs else {
                        continue;
                    };
                    if now - view.created_at < ttl as i64 {
                        continue;
                    }
                    match self.registry.retire_credential(&view.value, now) {
                        Ok(()) => {
                            outcome.retired += 1;
                            tracing::info!(
                                created_at = view.created_at,
                                "credential retired by TTL policy"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "TTL retirement failed; continuing scan");
                        }
                    }
                }
                CredentialState::Retired => {
                    let Some(grace) = self.policy.deletion_grace_secs else {
                        continue;
                    };
                    let retired_at = view.retired_at.unwrap_or(view.created_at);
                    if now - retired_at < grace as i64 {
                        continue;
                    }
                    match self.registry.delete_credential(&view.value) {
                        Ok(remote_id) => {
                            outcome.deleted += 1;
                            tracing::info!(retired_at, "credential deleted by grace policy");
                            if let Some(remote_id) = remote_id {
                                if !self.revoke_remote(&remote_id).await {
                                    outcome.revocation_failures += 1;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "grace deletion failed; continuing scan");
                        }
                    }
                }
                CredentialState::Deleted => {}
            }
        }

        outcome
    }

    /// Deactivate a credential at the billing system. Returns false on
    /// failure; the caller has already committed the local transition.
    async fn revoke_remote(&self, remote_id: &str) -> bool {
        match self.billing.update_credential_status(remote_id, false).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(remote_id, error = %e, "remote revocation failed");
                false
            }
        }
    }

    /// Scheduled loop, independent of the aggregation timer.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.policy.scan_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let outcome = self.scan_at(Utc::now().timestamp()).await;
            if outcome.retired > 0 || outcome.deleted > 0 {
                tracing::info!(
                    retired = outcome.retired,
                    deleted = outcome.deleted,
                    revocation_failures = outcome.revocation_failures,
                    "lifecycle scan applied transitions"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{CostReportPage, RemoteCredential};
    use crate::error::BillingError;
    use crate::store::StateStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Billing stub that records revocations and optionally fails them.
    struct RevocationLog {
        fail: bool,
        revoked: Mutex<Vec<String>>,
    }

    impl RevocationLog {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                revoked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BillingApi for RevocationLog {
        async fn fetch_cost_report(
            &self,
            _: i64,
            _: i64,
            _: Option<&str>,
        ) -> Result<CostReportPage, BillingError> {
            Ok(CostReportPage::default())
        }

        async fn create_credential(&self, _: &str) -> Result<RemoteCredential, BillingError> {
            Err(BillingError::Rejected("not scripted".into()))
        }

        async fn list_credentials(
            &self,
            _: Option<&str>,
        ) -> Result<Vec<RemoteCredential>, BillingError> {
            Ok(Vec::new())
        }

        async fn update_credential_status(
            &self,
            credential_id: &str,
            _active: bool,
        ) -> Result<(), BillingError> {
            if self.fail {
                return Err(BillingError::RemoteUnavailable("down".into()));
            }
            self.revoked.lock().push(credential_id.to_string());
            Ok(())
        }
    }

    fn registry() -> Arc<Registry> {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        Arc::new(Registry::open_with_seed(store, 42).unwrap())
    }

    fn policy(ttl: Option<u64>, grace: Option<u64>) -> LifecycleConfig {
        LifecycleConfig {
            retirement_ttl_secs: ttl,
            deletion_grace_secs: grace,
            scan_interval_secs: 600,
        }
    }

    #[tokio::test]
    async fn ttl_retires_only_expired_credentials() {
        let reg = registry();
        reg.add_credential("old", 0, None).unwrap();
        reg.add_credential("new", 900, None).unwrap();

        let manager = LifecycleManager::new(Arc::clone(&reg), RevocationLog::new(false), policy(Some(100), None));
        let outcome = manager.scan_at(1000).await;

        assert_eq!(outcome.retired, 1);
        assert_eq!(reg.credential_view("old").unwrap().state, CredentialState::Retired);
        assert_eq!(reg.credential_view("new").unwrap().state, CredentialState::Active);
    }

    #[tokio::test]
    async fn grace_deletes_and_revokes_remotely() {
        let reg = registry();
        reg.add_credential("K1", 0, Some("apikey_01".into())).unwrap();
        reg.retire_credential("K1", 100).unwrap();

        let billing = RevocationLog::new(false);
        let manager =
            LifecycleManager::new(Arc::clone(&reg), Arc::clone(&billing) as Arc<dyn BillingApi>, policy(None, Some(50)));
        let outcome = manager.scan_at(200).await;

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.revocation_failures, 0);
        assert_eq!(reg.credential_view("K1").unwrap().state, CredentialState::Deleted);
        assert_eq!(*billing.revoked.lock(), vec!["apikey_01".to_string()]);
    }

    #[tokio::test]
    async fn zero_grace_deletes_on_next_scan() {
        let reg = registry();
        reg.add_credential("K1", 0, None).unwrap();
        reg.retire_credential("K1", 100).unwrap();

        let manager = LifecycleManager::new(Arc::clone(&reg), RevocationLog::new(false), policy(None, Some(0)));
        let outcome = manager.scan_at(100).await;
        assert_eq!(outcome.deleted, 1);
    }

    #[tokio::test]
    async fn failed_revocation_does_not_block_local_deletion() {
        let reg = registry();
        reg.add_credential("K1", 0, Some("apikey_01".into())).unwrap();
        reg.add_credential("K2", 0, Some("apikey_02".into())).unwrap();
        reg.retire_credential("K1", 10).unwrap();
        reg.retire_credential("K2", 10).unwrap();

        let manager = LifecycleManager::new(Arc::clone(&reg), RevocationLog::new(true), policy(None, Some(0)));
        let outcome = manager.scan_at(100).await;

        // Both local transitions applied even though every remote call failed.
        assert_eq!(outcome.deleted, 2);
        assert_eq!(outcome.revocation_failures, 2);
        assert_eq!(reg.credential_view("K1").unwrap().state, CredentialState::Deleted);
        assert_eq!(reg.credential_view("K2").unwrap().state, CredentialState::Deleted);
    }

    #[tokio::test]
    async fn no_policy_means_no_transitions() {
        let reg = registry();
        reg.add_credential("K1", 0, None).unwrap();
        reg.retire_credential("K1", 1).unwrap();
        reg.add_credential("K2", 0, None).unwrap();

        let manager = LifecycleManager::new(Arc::clone(&reg), RevocationLog::new(false), policy(None, None));
        let outcome = manager.scan_at(i64::MAX / 2).await;

        assert_eq!(outcome, ScanOutcome::default());
        assert_eq!(reg.credential_view("K1").unwrap().state, CredentialState::Retired);
        assert_eq!(reg.credential_view("K2").unwrap().state, CredentialState::Active);
    }

    #[tokio::test]
    async fn full_ttl_then_grace_progression() {
        let reg = registry();
        reg.add_credential("K1", 0, None).unwrap();

        let manager = LifecycleManager::new(
            Arc::clone(&reg),
            RevocationLog::new(false),
            policy(Some(100), Some(100)),
        );

        // First scan: past TTL, retires.
        let first = manager.scan_at(150).await;
        assert_eq!(first.retired, 1);
        assert_eq!(first.deleted, 0);

        // Second scan: grace not yet elapsed since retirement at t=150.
        let second = manager.scan_at(200).await;
        assert_eq!(second.deleted, 0);

        // Third scan: grace elapsed, deletes.
        let third = manager.scan_at(260).await;
        assert_eq!(third.deleted, 1);
        assert_eq!(reg.credential_view("K1").unwrap().state, CredentialState::Deleted);
    }
}
