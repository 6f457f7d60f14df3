//! Client configuration with TOML file support.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use patrol_nfc::NfcConfig;
use patrol_rounds::MachineConfig;
use patrol_transport::ReconnectPolicy;
use patrol_verification::GpsPolicy;

use crate::ClientError;

/// Configuration for a patrol client.
///
/// Can be loaded from a TOML file via [`ClientConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Origin of the Socket.IO server. Defaults to the API origin.
    #[serde(default)]
    pub socket_url: Option<String>,

    /// Maximum distance from a checkpoint for a GPS proof, in meters.
    #[serde(default = "default_gps_radius_m")]
    pub gps_radius_m: f64,

    /// GPS fixes must report an accuracy strictly better than this, in meters.
    #[serde(default = "default_gps_max_accuracy_m")]
    pub gps_max_accuracy_m: f64,

    #[serde(default = "default_location_timeout_secs")]
    pub location_timeout_secs: u64,

    #[serde(default = "default_nfc_timeout_secs")]
    pub nfc_timeout_secs: u64,

    /// Reconnection delay grows by this much per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Failed submissions before a pending log is abandoned.
    #[serde(default = "default_submit_retry_budget")]
    pub submit_retry_budget: u32,

    /// Interval between live location batches.
    #[serde(default = "default_location_batch_secs")]
    pub location_batch_secs: u64,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_gps_radius_m() -> f64 {
    GpsPolicy::default().radius_m
}

fn default_gps_max_accuracy_m() -> f64 {
    GpsPolicy::default().max_accuracy_m
}

fn default_location_timeout_secs() -> u64 {
    15
}

fn default_nfc_timeout_secs() -> u64 {
    30
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    5_000
}

fn default_submit_retry_budget() -> u32 {
    patrol_rounds::machine::DEFAULT_RETRY_BUDGET
}

fn default_location_batch_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "human".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ClientError> {
        let config: Self = toml::from_str(s).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, ClientError> {
        toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if !positive(self.gps_radius_m) {
            return Err(ClientError::Config("gps_radius_m must be positive".into()));
        }
        if !positive(self.gps_max_accuracy_m) {
            return Err(ClientError::Config("gps_max_accuracy_m must be positive".into()));
        }
        if self.submit_retry_budget == 0 {
            return Err(ClientError::Config("submit_retry_budget must be at least 1".into()));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ClientError::Config(
                "reconnect delays must satisfy 0 < reconnect_base_ms <= reconnect_max_ms".into(),
            ));
        }
        if self.location_batch_secs == 0 {
            return Err(ClientError::Config("location_batch_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn socket_origin(&self) -> &str {
        self.socket_url.as_deref().unwrap_or(&self.api_url)
    }

    pub fn gps_policy(&self) -> GpsPolicy {
        GpsPolicy {
            radius_m: self.gps_radius_m,
            max_accuracy_m: self.gps_max_accuracy_m,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            retry_budget: self.submit_retry_budget,
        }
    }

    pub fn nfc_config(&self) -> NfcConfig {
        NfcConfig {
            read_timeout: Duration::from_secs(self.nfc_timeout_secs),
        }
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location_timeout_secs)
    }

    pub fn location_batch_interval(&self) -> Duration {
        Duration::from_secs(self.location_batch_secs)
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            socket_url: None,
            gps_radius_m: default_gps_radius_m(),
            gps_max_accuracy_m: default_gps_max_accuracy_m(),
            location_timeout_secs: default_location_timeout_secs(),
            nfc_timeout_secs: default_nfc_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            submit_retry_budget: default_submit_retry_budget(),
            location_batch_secs: default_location_batch_secs(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}
