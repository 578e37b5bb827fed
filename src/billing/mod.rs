//! External billing client boundary.
//!
//! The aggregator and lifecycle manager talk to the billing system through
//! [`BillingApi`], a stateless collaborator: cost-report fetches (paginated),
//! plus credential provisioning and best-effort revocation. The production
//! implementation lives in [`anthropic`]; tests substitute scripted mocks.

pub mod anthropic;

pub use anthropic::AnthropicBillingClient;

use crate::error::BillingError;
use async_trait::async_trait;

/// One attributed report row from the billing system.
#[derive(Debug, Clone, PartialEq)]
pub struct CostReportRow {
    /// Billing-side credential id the spend is attributed to.
    pub credential_id: String,
    /// Report bucket start, epoch seconds UTC.
    pub bucket_start: i64,
    /// Report bucket end, epoch seconds UTC.
    pub bucket_end: i64,
    pub amount: f64,
    pub currency: String,
    /// Line-item description (e.g. "Input Tokens").
    pub description: String,
}

/// One page of a cost report. `next_page` is an opaque cursor; the caller
/// loops until it is exhausted.
#[derive(Debug, Clone, Default)]
pub struct CostReportPage {
    pub rows: Vec<CostReportRow>,
    pub next_page: Option<String>,
}

/// A credential as the billing system knows it.
#[derive(Debug, Clone)]
pub struct RemoteCredential {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// The external billing system, seen from this process.
#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Fetch one page of the cost report for `[since, until)`, grouped by
    /// credential and description. Pass the previous page's cursor to
    /// continue; `None` starts from the beginning of the window.
    async fn fetch_cost_report(
        &self,
        since: i64,
        until: i64,
        page: Option<&str>,
    ) -> Result<CostReportPage, BillingError>;

    /// Provision a new credential remotely. Returns its billing-side
    /// identity.
    async fn create_credential(&self, name: &str) -> Result<RemoteCredential, BillingError>;

    /// List credentials known to the billing system, optionally filtered
    /// by status.
    async fn list_credentials(
        &self,
        status: Option<&str>,
    ) -> Result<Vec<RemoteCredential>, BillingError>;

    /// Activate or deactivate a credential remotely. Used for revocation
    /// on deletion; callers treat failures as best-effort.
    async fn update_credential_status(
        &self,
        credential_id: &str,
        active: bool,
    ) -> Result<(), BillingError>;
}
