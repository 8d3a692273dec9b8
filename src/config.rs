//! Runtime configuration
//!
//! Every heuristic threshold used by the health, reconnection and transport
//! logic lives here as a named field so deployments can tune it. The defaults
//! are starting points, not measured optima.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub retry: RetryConfig,
    pub devices: DeviceTrackerConfig,
    pub health: HealthConfig,
    pub reconnection: ReconnectionConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub ui: UiConfig,
}

impl AppConfig {
    /// Default config file location (`<config dir>/audiolink/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "AudioLink", "audiolink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a TOML config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the algorithms cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(Error::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }
        if self.devices.poll_interval_ms == 0 {
            return Err(Error::Config("devices.poll_interval_ms must be positive".into()));
        }
        if self.health.ping_window == 0 || self.health.error_window == 0 {
            return Err(Error::Config("health windows must be non-empty".into()));
        }
        if self.transport.success_weight + self.transport.latency_weight <= 0.0 {
            return Err(Error::Config("transport weights must sum to a positive value".into()));
        }
        if self.session.ping_interval_ms == 0 {
            return Err(Error::Config("session.ping_interval_ms must be positive".into()));
        }
        if self.transport.metrics_window == 0 {
            return Err(Error::Config("transport.metrics_window must be positive".into()));
        }
        let bands = &self.transport;
        if !(bands.excellent_latency_ms <= bands.good_latency_ms
            && bands.good_latency_ms <= bands.fair_latency_ms)
        {
            return Err(Error::Config("transport latency bands must be ascending".into()));
        }
        Ok(())
    }
}

/// Exponential backoff parameters shared by RetryKit callers and the
/// reconnection recommendations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_factor: 2.0,
        }
    }
}

/// Debug-bridge device tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTrackerConfig {
    /// Path or name of the bridge executable
    pub bridge_path: String,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    /// Set up port forwarding for every connected device
    pub auto_forward: bool,
    /// Port the mobile client dials on the device side
    pub device_port: u16,
    /// Port the host listens on
    pub host_port: u16,
}

impl Default for DeviceTrackerConfig {
    fn default() -> Self {
        Self {
            bridge_path: "adb".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            command_timeout_ms: 5_000,
            auto_forward: true,
            device_port: DEFAULT_SESSION_PORT,
            host_port: DEFAULT_SESSION_PORT,
        }
    }
}

impl DeviceTrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Health ledger and prediction thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Latency samples retained per connection
    pub ping_window: usize,
    /// Error records retained per connection
    pub error_window: usize,
    /// Trailing window for the error rate
    pub error_rate_window_ms: u64,
    /// Mean latency below which a connection can be called stable
    pub stable_latency_ms: f64,
    /// Mean latency that raises the high-latency risk factor
    pub high_latency_ms: f64,
    /// Errors per sample at or above which errors count as frequent
    pub error_rate_threshold: f64,
    /// Transport upgrades at or above which upgrades count as frequent
    pub frequent_upgrades: u32,
    /// A sample this many times the mean counts as a spike
    pub spike_factor: f64,
    /// How long an ended connection stays queryable
    pub retention_ms: u64,
    /// Upper bound on retained ended connections
    pub retained_limit: usize,
    /// Trailing window used to count a client's recent failures
    pub failure_window_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_window: DEFAULT_PING_WINDOW,
            error_window: DEFAULT_ERROR_WINDOW,
            error_rate_window_ms: 5 * 60 * 1000,
            stable_latency_ms: 100.0,
            high_latency_ms: 200.0,
            error_rate_threshold: 0.1,
            frequent_upgrades: 3,
            spike_factor: 3.0,
            retention_ms: 5 * 60 * 1000,
            retained_limit: 100,
            failure_window_ms: 5 * 60 * 1000,
        }
    }
}

/// Disconnection classification and recommendation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Error rate above which the network is called unstable
    pub high_error_rate: f64,
    /// Recent failures at or above which the network is called unstable
    pub unstable_failure_count: u32,
    /// Mean latency above which a transport counts as degraded
    pub high_latency_ms: f64,
    /// Longest connection below which the client is flapping
    pub flapping_connection_ms: u64,
    pub immediate_delay_ms: u64,
    pub immediate_max_attempts: u32,
    pub backoff_max_attempts: u32,
    pub manual_delay_ms: u64,
    pub manual_max_attempts: u32,
    /// Analyses kept for the stats endpoint
    pub recent_history: usize,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            high_error_rate: 0.5,
            unstable_failure_count: 3,
            high_latency_ms: 300.0,
            flapping_connection_ms: 10_000,
            immediate_delay_ms: 100,
            immediate_max_attempts: 3,
            backoff_max_attempts: 10,
            manual_delay_ms: 60_000,
            manual_max_attempts: 2,
            recent_history: 50,
        }
    }
}

/// Transport ranking, failover and quality bands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub success_weight: f64,
    pub latency_weight: f64,
    /// Latency at which the latency component of the score reaches zero
    pub latency_ceiling_ms: f64,
    /// Active transport success rate below which failover is attempted
    pub failover_success_rate: f64,
    pub handshake_timeout_ms: u64,
    pub excellent_latency_ms: f64,
    pub good_latency_ms: f64,
    pub fair_latency_ms: f64,
    pub probe_interval_ms: u64,
    /// Probe outcomes kept per transport
    pub metrics_window: usize,
    /// Endpoint (`host:port`) per transport name for the TCP connector.
    /// Empty by default; the session listener must not be probed by its own host.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            success_weight: 0.7,
            latency_weight: 0.3,
            latency_ceiling_ms: 1000.0,
            failover_success_rate: 0.5,
            handshake_timeout_ms: 3_000,
            excellent_latency_ms: 50.0,
            good_latency_ms: 100.0,
            fair_latency_ms: 200.0,
            probe_interval_ms: 2_000,
            metrics_window: 20,
            endpoints: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn endpoint(&self, kind: TransportKind) -> Option<&str> {
        self.endpoints.get(kind.as_str()).map(String::as_str)
    }
}

/// Peer session listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub ping_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_SESSION_PORT,
            ping_interval_ms: 2_000,
        }
    }
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Status API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [health]
            ping_window = 20

            [transport.endpoints]
            socket = "192.168.1.20:8765"
            "#,
        )
        .unwrap();

        assert_eq!(config.health.ping_window, 20);
        assert_eq!(config.health.error_window, DEFAULT_ERROR_WINDOW);
        assert_eq!(
            config.transport.endpoint(TransportKind::Socket),
            Some("192.168.1.20:8765")
        );
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let result = AppConfig::from_toml("[retry]\nbackoff_factor = 0.5\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.devices.poll_interval_ms = 1234;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.devices.poll_interval_ms, 1234);
    }
}
