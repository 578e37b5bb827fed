//! TOML configuration with serde defaults and a small set of env overrides.
//!
//! Search order: explicit `--config` path, then `$KEYSTEWARD_CONFIG`, then
//! `~/.config/keysteward/keysteward.toml`. A missing file yields defaults so
//! the daemon can start on a bare machine.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the state database. Tilde-expanded.
    pub data_dir: String,
    pub gateway: GatewayConfig,
    pub lifecycle: LifecycleConfig,
    pub aggregation: AggregationConfig,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Lifecycle policy knobs. `None` disables the automatic transition; both
/// are operator policy with no built-in values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds after creation before an active credential is retired.
    pub retirement_ttl_secs: Option<u64>,
    /// Seconds after retirement before a retired credential is deleted.
    /// Zero deletes on the next scan.
    pub deletion_grace_secs: Option<u64>,
    /// Cadence of the policy scan.
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Cadence of scheduled cost-aggregation cycles.
    pub interval_secs: u64,
    /// First backoff delay after a failed fetch.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_cap_ms: u64,
    /// Fetch attempts per cycle before the cycle aborts.
    pub max_attempts: u32,
    /// Minimum seconds between manual refresh triggers.
    pub refresh_cooldown_secs: u64,
    /// Report window start when no checkpoint exists yet, as seconds of
    /// history to cover on first run.
    pub initial_lookback_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Base URL of the billing admin API.
    pub base_url: String,
    /// Per-call timeout for billing requests.
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.keysteward".to_string(),
            gateway: GatewayConfig::default(),
            lifecycle: LifecycleConfig::default(),
            aggregation: AggregationConfig::default(),
            billing: BillingConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7727,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retirement_ttl_secs: None,
            deletion_grace_secs: None,
            scan_interval_secs: 600,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            max_attempts: 3,
            refresh_cooldown_secs: 3600,
            initial_lookback_secs: 7 * 24 * 3600,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults when no file exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => match std::env::var("KEYSTEWARD_CONFIG") {
                Ok(p) if !p.is_empty() => Some(PathBuf::from(p)),
                _ => Self::default_path(),
            },
        };

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config at {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config at {}", p.display()))?
            }
            _ => Self::default(),
        };

        if let Ok(dir) = std::env::var("KEYSTEWARD_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = dir;
            }
        }

        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "keysteward")
            .map(|dirs| dirs.config_dir().join("keysteward.toml"))
    }

    /// Resolved, tilde-expanded data directory.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).into_owned())
    }
}
