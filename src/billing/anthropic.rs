//! Anthropic admin-API billing client.
//!
//! Talks to the organization endpoints (`/v1/organizations/cost_report`,
//! `/v1/organizations/api_keys`) with the operator's admin key. Every call
//! is timeout-bounded; retry policy belongs to the callers (the aggregator
//! backs off between attempts, lifecycle revocation is fire-and-forget).
//!
//! The admin key is read from the settings table on each call so that an
//! operator setting it through the gateway takes effect immediately.

use crate::billing::{BillingApi, CostReportPage, CostReportRow, RemoteCredential};
use crate::error::BillingError;
use crate::store::{StateStore, SETTING_ADMIN_KEY};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// API version header required by the admin endpoints.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Report buckets requested per page.
const REPORT_PAGE_LIMIT: u32 = 31;

/// Production billing client against the Anthropic admin API.
pub struct AnthropicBillingClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<StateStore>,
    timeout: Duration,
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CostReportResponse {
    data: Vec<CostBucket>,
    #[serde(default)]
    #[allow(dead_code)]
    has_more: bool,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CostBucket {
    starting_at: String,
    ending_at: String,
    results: Vec<CostResult>,
}

#[derive(Debug, Deserialize)]
struct CostResult {
    currency: String,
    /// Decimal amount as a string, e.g. "5.00".
    amount: String,
    api_key_id: Option<String>,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ApiKeyObject {
    id: String,
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiKeyListResponse {
    data: Vec<ApiKeyObject>,
}

impl AnthropicBillingClient {
    /// Build a client for the given API base URL.
    pub fn new(base_url: &str, store: Arc<StateStore>, timeout: Duration) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::RemoteUnavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            store,
            timeout,
        })
    }

    fn admin_key(&self) -> BillingResult<String> {
        self.store
            .get_setting(SETTING_ADMIN_KEY)
            .map_err(|e| BillingError::Rejected(format!("settings read failed: {e}")))?
            .ok_or(BillingError::NotConfigured)
    }

    fn map_transport(&self, err: reqwest::Error) -> BillingError {
        if err.is_timeout() {
            BillingError::RemoteTimeout(self.timeout)
        } else {
            BillingError::RemoteUnavailable(err.to_string())
        }
    }

    /// Map a non-success status to the retriable/non-retriable split:
    /// auth failures are final, everything else is worth a retry.
    async fn check_status(&self, resp: reqwest::Response) -> BillingResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let detail = format!("status {status}: {}", truncate(&body, 256));
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(BillingError::Rejected(detail))
        } else {
            Err(BillingError::RemoteUnavailable(detail))
        }
    }
}

type BillingResult<T> = Result<T, BillingError>;

#[async_trait]
impl BillingApi for AnthropicBillingClient {
    async fn fetch_cost_report(
        &self,
        since: i64,
        until: i64,
        page: Option<&str>,
    ) -> BillingResult<CostReportPage> {
        let admin_key = self.admin_key()?;

        let mut url = format!(
            "{}/v1/organizations/cost_report?starting_at={}&ending_at={}\
             &group_by[]=api_key_id&group_by[]=description&limit={}",
            self.base_url,
            format_ts(since),
            format_ts(until),
            REPORT_PAGE_LIMIT,
        );
        if let Some(cursor) = page {
            url.push_str("&page=");
            url.push_str(cursor);
        }

        let resp = self
            .http
            .get(&url)
            .header("x-api-key", &admin_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let resp = self.check_status(resp).await?;

        let report: CostReportResponse = resp
            .json()
            .await
            .map_err(|e| BillingError::Rejected(format!("malformed cost report: {e}")))?;

        let mut rows = Vec::new();
        for bucket in report.data {
            let bucket_start = parse_ts(&bucket.starting_at)?;
            let bucket_end = parse_ts(&bucket.ending_at)?;
            for result in bucket.results {
                let Some(credential_id) = result.api_key_id else {
                    // Spend not attributed to a specific key (e.g. console
                    // usage); nothing to merge it onto.
                    continue;
                };
                let amount: f64 = result.amount.parse().unwrap_or(0.0);
                rows.push(CostReportRow {
                    credential_id,
                    bucket_start,
                    bucket_end,
                    amount,
                    currency: result.currency,
                    description: result.description,
                });
            }
        }

        Ok(CostReportPage {
            rows,
            next_page: report.next_page,
        })
    }

    async fn create_credential(&self, name: &str) -> BillingResult<RemoteCredential> {
        let admin_key = self.admin_key()?;
        let url = format!("{}/v1/organizations/api_keys", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &admin_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let resp = self.check_status(resp).await?;

        let key: ApiKeyObject = resp
            .json()
            .await
            .map_err(|e| BillingError::Rejected(format!("malformed api key response: {e}")))?;
        Ok(RemoteCredential {
            id: key.id,
            name: key.name,
            status: key.status,
        })
    }

    async fn list_credentials(
        &self,
        status: Option<&str>,
    ) -> BillingResult<Vec<RemoteCredential>> {
        let admin_key = self.admin_key()?;
        let mut url = format!("{}/v1/organizations/api_keys?limit=100", self.base_url);
        if let Some(status) = status {
            url.push_str("&status=");
            url.push_str(status);
        }

        let resp = self
            .http
            .get(&url)
            .header("x-api-key", &admin_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let resp = self.check_status(resp).await?;

        let list: ApiKeyListResponse = resp
            .json()
            .await
            .map_err(|e| BillingError::Rejected(format!("malformed api key list: {e}")))?;
        Ok(list
            .data
            .into_iter()
            .map(|key| RemoteCredential {
                id: key.id,
                name: key.name,
                status: key.status,
            })
            .collect())
    }

    async fn update_credential_status(
        &self,
        credential_id: &str,
        active: bool,
    ) -> BillingResult<()> {
        let admin_key = self.admin_key()?;
        let url = format!("{}/v1/organizations/api_keys/{credential_id}", self.base_url);
        let status = if active { "active" } else { "inactive" };

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &admin_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        self.check_status(resp).await?;
        Ok(())
    }
}

/// Epoch seconds → `2025-08-01T00:00:00Z`, the format the report endpoint
/// accepts in query parameters.
fn format_ts(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

fn parse_ts(raw: &str) -> Result<i64, BillingError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|e| BillingError::Rejected(format!("bad timestamp {raw:?}: {e}")))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> AnthropicBillingClient {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.set_setting(SETTING_ADMIN_KEY, "sk-ant-admin-test").unwrap();
        AnthropicBillingClient::new(&server.uri(), store, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn cost_report_follows_pagination_cursor() {
        let server = MockServer::start().await;

        // Second page first, matched only when the cursor is present.
        Mock::given(method("GET"))
            .and(path("/v1/organizations/cost_report"))
            .and(query_param("page", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{
                    "starting_at": "1970-01-01T02:00:00Z",
                    "ending_at": "1970-01-01T03:00:00Z",
                    "results": [{
                        "currency": "USD",
                        "amount": "2.50",
                        "api_key_id": "apikey_01",
                        "description": "Output Tokens"
                    }]
                }],
                "has_more": false,
                "next_page": null
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/organizations/cost_report"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{
                    "starting_at": "1970-01-01T01:00:00Z",
                    "ending_at": "1970-01-01T02:00:00Z",
                    "results": [
                        {
                            "currency": "USD",
                            "amount": "5.00",
                            "api_key_id": "apikey_01",
                            "description": "Input Tokens"
                        },
                        {
                            "currency": "USD",
                            "amount": "1.00",
                            "api_key_id": null,
                            "description": "Unattributed"
                        }
                    ]
                }],
                "has_more": true,
                "next_page": "p2"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;

        let first = client.fetch_cost_report(0, 10_800, None).await.unwrap();
        assert_eq!(first.rows.len(), 1, "unattributed rows are dropped");
        assert_eq!(first.rows[0].credential_id, "apikey_01");
        assert_eq!(first.rows[0].bucket_start, 3600);
        assert!((first.rows[0].amount - 5.0).abs() < 1e-9);
        assert_eq!(first.next_page.as_deref(), Some("p2"));

        let second = client
            .fetch_cost_report(0, 10_800, first.next_page.as_deref())
            .await
            .unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].description, "Output Tokens");
        assert!(second.next_page.is_none());
    }

    #[tokio::test]
    async fn auth_failure_is_not_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/organizations/cost_report"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.fetch_cost_report(0, 3600, None).await.unwrap_err();
        assert!(matches!(err, BillingError::Rejected(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/organizations/cost_report"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.fetch_cost_report(0, 3600, None).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn missing_admin_key_fails_without_network() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let client =
            AnthropicBillingClient::new("http://127.0.0.1:1", store, Duration::from_secs(1))
                .unwrap();
        let err = client.fetch_cost_report(0, 3600, None).await.unwrap_err();
        assert!(matches!(err, BillingError::NotConfigured));
    }

    #[tokio::test]
    async fn update_status_posts_inactive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/organizations/api_keys/apikey_01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "apikey_01", "name": "k", "status": "inactive"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.update_credential_status("apikey_01", false).await.unwrap();
    }
}
