//! Gateway configuration.
//!
//! The gateway is configured from a JSON document whose every field has a
//! default, so an empty object (or no file at all) yields a working demo
//! setup. A handful of environment variables override the file so container
//! deployments can inject store endpoints without editing it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Environment variable overriding [`GatewayConfig::fleet`].
pub const ENV_FLEET: &str = "SCADALINK_FLEET";
/// Environment variable overriding [`GatewayConfig::redis_url`].
pub const ENV_REDIS_URL: &str = "SCADALINK_REDIS_URL";
/// Environment variable overriding [`GatewayConfig::rtu_list_path`].
pub const ENV_RTU_LIST: &str = "SCADALINK_RTU_LIST";

/// How soon a failed connection is retried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Retry on every reconciliation cycle.
    #[default]
    Fixed,
    /// Double the wait after each consecutive failure, up to `max_ms`.
    #[serde(rename_all = "camelCase")]
    Exponential { base_ms: u64, max_ms: u64 },
}

impl RetryPolicy {
    /// Wait before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            RetryPolicy::Fixed => Duration::ZERO,
            RetryPolicy::Exponential { base_ms, max_ms } => {
                if failures == 0 {
                    return Duration::ZERO;
                }
                let shift = (failures - 1).min(31);
                let ms = base_ms.saturating_mul(1u64 << shift).min(*max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Fleet (gateway instance) name; selects descriptors by their `IFS` field.
    pub fleet: String,

    /// Maximum number of RTUs this instance supervises.
    pub fleet_limit: usize,

    /// Reconciliation cycle period.
    pub supervisor_interval_ms: u64,

    /// Poll scheduler tick period.
    pub poll_interval_ms: u64,

    /// Upper bound on a single connect attempt.
    pub connect_timeout_ms: u64,

    /// Upper bound on a single health probe.
    pub probe_timeout_ms: u64,

    /// Per-RTU command queue capacity.
    pub command_queue_depth: usize,

    /// Per-client outbound message queue capacity.
    pub client_queue_depth: usize,

    /// Retry policy for failed connects.
    pub retry: RetryPolicy,

    /// WebSocket listen address for clients.
    pub ws_bind: SocketAddr,

    /// HTTP status API listen address.
    pub http_bind: SocketAddr,

    /// Fast store URL; the in-memory store is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// JSON file holding the RTU descriptor list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtu_list_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fleet: "IFS_A".to_string(),
            fleet_limit: 100,
            supervisor_interval_ms: 1000,
            poll_interval_ms: 1000,
            connect_timeout_ms: 3000,
            probe_timeout_ms: 2000,
            command_queue_depth: 16,
            client_queue_depth: 256,
            retry: RetryPolicy::Fixed,
            ws_bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 5001)),
            redis_url: None,
            rtu_list_path: None,
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Apply overrides from a variable lookup (normally `std::env::var`).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(fleet) = lookup(ENV_FLEET) {
            self.fleet = fleet;
        }
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.redis_url = Some(url);
        }
        if let Some(path) = lookup(ENV_RTU_LIST) {
            self.rtu_list_path = Some(PathBuf::from(path));
        }
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.fleet.trim().is_empty() {
            return Err(CoreError::Config("fleet must not be empty".into()));
        }
        if self.fleet_limit == 0 {
            return Err(CoreError::Config("fleetLimit must be positive".into()));
        }
        if self.supervisor_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(CoreError::Config("intervals must be positive".into()));
        }
        if self.command_queue_depth == 0 || self.client_queue_depth == 0 {
            return Err(CoreError::Config("queue depths must be positive".into()));
        }
        if let RetryPolicy::Exponential { base_ms, max_ms } = self.retry {
            if base_ms == 0 || max_ms < base_ms {
                return Err(CoreError::Config(
                    "exponential retry needs 0 < baseMs <= maxMs".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
