//! Axum gateway: the peer transport boundary plus the admin surface.
//!
//! Peer side: `POST /peer/request-key` delivers a peer's credential
//! request to the registry. Pool exhaustion maps to 503 with a retry hint
//! — it is an expected outcome, not an internal error — and duplicate
//! deliveries are safe because the registry call is idempotent.
//!
//! Admin side: pool management, cost queries, billing-secret management,
//! manual aggregation triggers. Admin routes require a bearer token that
//! is generated on first start, logged once, and stored hashed.
//!
//! ## Hardening (matches the daemon's other HTTP surfaces)
//! - Request body size limit (64KB)
//! - Request timeout (30s)
//! - CORS for the operator dashboard

use crate::aggregator::{CostAggregator, CycleOutcome, RefreshOutcome};
use crate::billing::BillingApi;
use crate::error::{PoolError, RequestError};
use crate::registry::Registry;
use crate::store::{StateStore, SETTING_GATEWAY_TOKEN_HASH};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size.
pub const MAX_BODY_SIZE: usize = 65_536;

/// Per-request timeout. Generous enough for a manual aggregation cycle.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state behind every handler.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<StateStore>,
    pub aggregator: Arc<CostAggregator>,
    pub billing: Arc<dyn BillingApi>,
    /// SHA-256 hex of the admin bearer token.
    pub token_hash: String,
}

/// Load the stored gateway token hash, generating a fresh token on first
/// start. Returns `(hash, Some(plaintext))` only when newly generated so
/// the caller can log it exactly once.
pub fn ensure_gateway_token(store: &StateStore) -> Result<(String, Option<String>)> {
    if let Some(hash) = store.get_setting(SETTING_GATEWAY_TOKEN_HASH)? {
        return Ok((hash, None));
    }
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let hash = hash_token(&token);
    store.set_setting(SETTING_GATEWAY_TOKEN_HASH, &hash)?;
    Ok((hash, Some(token)))
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Build the gateway router with its hardening layers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/peer/request-key", post(peer_request_key))
        .route("/api/keys", get(list_keys).post(add_key).delete(delete_key))
        .route("/api/keys/retire", post(retire_key))
        .route("/api/keys/provision", post(provision_key))
        .route("/api/keys/status", get(key_status))
        .route("/api/costs", get(total_costs))
        .route("/api/costs/key", get(key_costs))
        .route("/api/costs/all", get(all_costs))
        .route("/api/costs/refresh", post(refresh_costs))
        .route("/api/costs/clear", post(clear_costs))
        .route("/api/assignments", get(list_assignments))
        .route("/api/admin-key", get(check_admin_key).post(set_admin_key))
        .route("/api/status", get(daemon_status))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PeerRequest {
    #[serde(rename = "peerId")]
    peer_id: String,
}

#[derive(Debug, Serialize)]
struct PeerResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct AddKeyRequest {
    #[serde(rename = "apiKey")]
    api_key: String,
    #[serde(rename = "remoteId")]
    remote_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyRequest {
    #[serde(rename = "apiKey")]
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    #[serde(rename = "apiKey")]
    api_key: String,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SetAdminKeyRequest {
    #[serde(rename = "adminKey")]
    admin_key: String,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct KeyInfo {
    key: String,
    status: String,
    #[serde(rename = "totalCost")]
    total_cost: f64,
    #[serde(rename = "assignedPeers")]
    assigned_peers: Vec<String>,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

#[derive(Debug, Serialize)]
struct KeyStatusResponse {
    status: String,
    #[serde(rename = "assignedPeers")]
    assigned_peers: Vec<String>,
    #[serde(rename = "totalCost")]
    total_cost: f64,
}

#[derive(Debug, Serialize)]
struct TotalCostsResponse {
    #[serde(rename = "totalCost")]
    total_cost: f64,
    #[serde(rename = "costByKey")]
    cost_by_key: Vec<(String, f64)>,
    currency: String,
    stale: bool,
}

#[derive(Debug, Serialize)]
struct KeyCostsResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
    costs: Vec<crate::store::CostSample>,
    total: f64,
}

#[derive(Debug, Serialize)]
struct AssignmentInfo {
    #[serde(rename = "peerId")]
    peer_id: String,
    #[serde(rename = "apiKey")]
    api_key: String,
    #[serde(rename = "issuedAt")]
    issued_at: i64,
}

#[derive(Debug, Serialize)]
struct AdminKeyStatusResponse {
    #[serde(rename = "hasAdminKey")]
    has_admin_key: bool,
    #[serde(rename = "keyPrefix")]
    key_prefix: Option<String>,
}

#[derive(Debug, Serialize)]
struct DaemonStatus {
    #[serde(rename = "activeKeys")]
    active_keys: usize,
    #[serde(rename = "assignedPeers")]
    assigned_peers: usize,
    #[serde(rename = "costsStale")]
    costs_stale: bool,
    #[serde(rename = "lastAggregation")]
    last_aggregation: Option<i64>,
    checkpoint: Option<i64>,
}

// ── Helpers ──────────────────────────────────────────────────────────

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if hash_token(token) == state.token_hash => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "missing or invalid bearer token".into(),
            }),
        )
            .into_response()),
    }
}

fn pool_error_response(err: RequestError) -> Response {
    let (status, message) = match err {
        RequestError::Pool(PoolError::AlreadyExists) => {
            (StatusCode::CONFLICT, "API key already exists".to_string())
        }
        RequestError::Pool(PoolError::NotActive) => {
            (StatusCode::CONFLICT, "API key is not active".to_string())
        }
        RequestError::Pool(PoolError::NotFound) => {
            (StatusCode::NOT_FOUND, "API key not found".to_string())
        }
        RequestError::Pool(PoolError::NoCredentialsAvailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "no credentials available, retry later".to_string(),
        ),
        RequestError::Store(detail) => {
            tracing::error!(detail, "state persistence failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "state persistence failure".to_string(),
            )
        }
    };
    (status, Json(ErrorResponse { error: message })).into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "gateway internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal error".into(),
        }),
    )
        .into_response()
}

/// Parse optional RFC3339 range bounds into epoch seconds. Malformed
/// bounds are ignored rather than rejected, matching lenient admin reads.
fn parse_range(start: &Option<String>, end: &Option<String>) -> (Option<i64>, Option<i64>) {
    let parse = |raw: &Option<String>| {
        raw.as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
    };
    (parse(start), parse(end))
}

fn masked_prefix(key: &str) -> String {
    if key.starts_with("sk-") {
        "sk-***".to_string()
    } else {
        "invalid".to_string()
    }
}

fn success(message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(SuccessResponse {
            success: true,
            message: message.into(),
        }),
    )
        .into_response()
}

// ── Peer path ────────────────────────────────────────────────────────

async fn peer_request_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PeerRequest>,
) -> Response {
    let peer_id = req.peer_id.trim();
    if peer_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "peerId must not be empty".into(),
            }),
        )
            .into_response();
    }

    match state.registry.request_assignment(peer_id, Utc::now().timestamp()) {
        Ok(issued) => (
            StatusCode::OK,
            Json(PeerResponse {
                api_key: issued.credential,
            }),
        )
            .into_response(),
        Err(err) => pool_error_response(err),
    }
}

// ── Admin: pool management ───────────────────────────────────────────

async fn add_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddKeyRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state
        .registry
        .add_credential(&req.api_key, Utc::now().timestamp(), req.remote_id)
    {
        Ok(()) => success("API key added successfully"),
        Err(err) => pool_error_response(err),
    }
}

async fn retire_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<KeyRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state
        .registry
        .retire_credential(&req.api_key, Utc::now().timestamp())
    {
        Ok(()) => success("API key retired successfully"),
        Err(err) => pool_error_response(err),
    }
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<KeyRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.registry.delete_credential(&req.api_key) {
        Ok(remote_id) => {
            // Best-effort remote revocation, off the request path.
            if let Some(remote_id) = remote_id {
                let billing = Arc::clone(&state.billing);
                tokio::spawn(async move {
                    if let Err(e) = billing.update_credential_status(&remote_id, false).await {
                        tracing::warn!(remote_id, error = %e, "remote revocation failed");
                    }
                });
            }
            success("API key deleted successfully")
        }
        Err(err) => pool_error_response(err),
    }
}

/// Provision a credential at the billing system, then add it locally with
/// its remote id attached so spend attribution and revocation line up.
async fn provision_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let remote = match state.billing.create_credential(&req.name).await {
        Ok(remote) => remote,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: format!("provisioning failed: {e}"),
                }),
            )
                .into_response()
        }
    };
    match state.registry.add_credential(
        &remote.name,
        Utc::now().timestamp(),
        Some(remote.id.clone()),
    ) {
        Ok(()) => success(format!("provisioned credential {}", remote.id)),
        Err(err) => pool_error_response(err),
    }
}

async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let mut keys = Vec::new();
    for view in state.registry.list_credentials() {
        let total_cost = match state.store.total_for(&view.value) {
            Ok(total) => total,
            Err(e) => return internal_error(e),
        };
        keys.push(KeyInfo {
            key: view.value,
            status: view.state.as_str().to_string(),
            total_cost,
            assigned_peers: view.peers,
            created_at: view.created_at,
        });
    }
    (StatusCode::OK, Json(keys)).into_response()
}

async fn key_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let (status, peers) = match state.registry.credential_view(&query.api_key) {
        Some(view) => (view.state.as_str().to_string(), view.peers),
        None => ("unknown".to_string(), Vec::new()),
    };
    let total_cost = match state.store.total_for(&query.api_key) {
        Ok(total) => total,
        Err(e) => return internal_error(e),
    };
    (
        StatusCode::OK,
        Json(KeyStatusResponse {
            status,
            assigned_peers: peers,
            total_cost,
        }),
    )
        .into_response()
}

// ── Admin: costs ─────────────────────────────────────────────────────

async fn total_costs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let (start, end) = parse_range(&query.start, &query.end);
    let cost_by_key = match state.store.totals_by_credential(start, end) {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let total_cost = cost_by_key.iter().map(|(_, amount)| amount).sum();
    (
        StatusCode::OK,
        Json(TotalCostsResponse {
            total_cost,
            cost_by_key,
            currency: "USD".to_string(),
            stale: state.aggregator.is_stale(),
        }),
    )
        .into_response()
}

async fn key_costs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let (start, end) = parse_range(&query.start, &query.end);
    let costs = match state.store.samples_for(&query.api_key, start, end) {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let total = costs.iter().map(|c| c.amount).sum();
    (
        StatusCode::OK,
        Json(KeyCostsResponse {
            api_key: query.api_key,
            costs,
            total,
        }),
    )
        .into_response()
}

async fn all_costs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let (start, end) = parse_range(&query.start, &query.end);
    match state.store.all_samples(start, end) {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn refresh_costs(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let now = Utc::now().timestamp();
    match state.aggregator.manual_refresh(now).await {
        RefreshOutcome::Throttled { seconds_since_last } => (
            StatusCode::OK,
            Json(SuccessResponse {
                success: false,
                message: format!("costs were refreshed {seconds_since_last}s ago"),
            }),
        )
            .into_response(),
        RefreshOutcome::Ran(CycleOutcome::Completed(report)) => {
            success(format!("costs refreshed: {} new records", report.merged))
        }
        RefreshOutcome::Ran(CycleOutcome::SkippedOverlap) => (
            StatusCode::OK,
            Json(SuccessResponse {
                success: false,
                message: "an aggregation cycle is already running".into(),
            }),
        )
            .into_response(),
        RefreshOutcome::Ran(CycleOutcome::NothingToQuery) => success("no credentials to query"),
        RefreshOutcome::Ran(CycleOutcome::Failed { attempts, reason }) => (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: format!("refresh failed after {attempts} attempts: {reason}"),
            }),
        )
            .into_response(),
    }
}

async fn clear_costs(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.store.clear_costs() {
        Ok(()) => success("cost history cleared"),
        Err(e) => internal_error(e),
    }
}

// ── Admin: assignments, secrets, status ──────────────────────────────

async fn list_assignments(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let assignments: Vec<AssignmentInfo> = state
        .registry
        .assignment_history()
        .into_iter()
        .map(|record| AssignmentInfo {
            peer_id: record.peer_id,
            api_key: record.credential,
            issued_at: record.issued_at,
        })
        .collect();
    (StatusCode::OK, Json(assignments)).into_response()
}

async fn set_admin_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SetAdminKeyRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if let Err(e) = state
        .store
        .set_setting(crate::store::SETTING_ADMIN_KEY, &req.admin_key)
    {
        return internal_error(e);
    }
    tracing::info!(prefix = %masked_prefix(&req.admin_key), "billing admin key set");
    success("admin key set successfully")
}

async fn check_admin_key(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.store.get_setting(crate::store::SETTING_ADMIN_KEY) {
        Ok(stored) => (
            StatusCode::OK,
            Json(AdminKeyStatusResponse {
                has_admin_key: stored.is_some(),
                key_prefix: stored.as_deref().map(masked_prefix),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn daemon_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let checkpoint = match state.store.checkpoint() {
        Ok(value) => value,
        Err(e) => return internal_error(e),
    };
    (
        StatusCode::OK,
        Json(DaemonStatus {
            active_keys: state.registry.active_count(),
            assigned_peers: state.registry.assignment_history().len(),
            costs_stale: state.aggregator.is_stale(),
            last_aggregation: state.aggregator.last_success(),
            checkpoint,
        }),
    )
        .into_response()
}
