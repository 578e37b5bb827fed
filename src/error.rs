//! Error taxonomy for pool, registry, and billing-client operations.
//!
//! Pool and registry errors are returned synchronously to the caller and
//! are never swallowed. `NoCredentialsAvailable` is an expected outcome,
//! not a fault — the gateway maps it to a distinct "retry later" response.

use std::time::Duration;
use thiserror::Error;

/// Errors from credential pool operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The credential value is already known (active, retired, or deleted).
    #[error("credential already exists")]
    AlreadyExists,

    /// The operation requires the credential to be active.
    #[error("credential is not active")]
    NotActive,

    /// The credential is not in the active or retired sets.
    #[error("credential not found")]
    NotFound,

    /// The active set is empty; nothing can be issued right now.
    #[error("no credentials available")]
    NoCredentialsAvailable,
}

/// Errors from registry operations (pool errors plus persistence failures).
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The write-through to the state store failed. The in-memory state was
    /// left untouched.
    #[error("state persistence failed: {0}")]
    Store(String),
}

impl RequestError {
    /// True when the error is the expected pool-exhausted outcome.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Pool(PoolError::NoCredentialsAvailable))
    }
}

/// Errors from the external billing client.
#[derive(Debug, Error)]
pub enum BillingError {
    /// No billing admin key has been configured yet.
    #[error("billing admin key not configured")]
    NotConfigured,

    /// The remote call did not complete within the configured timeout.
    #[error("billing API timed out after {0:?}")]
    RemoteTimeout(Duration),

    /// Network failure or retriable remote status (429 / 5xx).
    #[error("billing API unavailable: {0}")]
    RemoteUnavailable(String),

    /// Non-retriable rejection (401 / 403 / malformed response).
    #[error("billing API rejected the request: {0}")]
    Rejected(String),
}

impl BillingError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RemoteTimeout(_) | Self::RemoteUnavailable(_))
    }
}
