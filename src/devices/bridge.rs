//! Debug-bridge backend
//!
//! [`DebugBridge`] abstracts device enumeration and port forwarding so the
//! tracker can run against the real `adb` client or a scripted fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::devices::DeviceState;
use crate::error::BridgeError;
use crate::retry::with_timeout;

/// Device status as reported by the bridge enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    /// Ready for commands
    Device,
    /// Attached, handshake or authorization in progress
    Connecting,
    /// Waiting for the user to accept the debugging prompt
    Unauthorized,
    /// Attached but not responding, or in a non-debuggable mode
    Offline,
}

impl BridgeStatus {
    /// Map the status word printed by `adb devices`
    pub fn parse(word: &str) -> Self {
        match word {
            "device" => BridgeStatus::Device,
            "connecting" | "authorizing" => BridgeStatus::Connecting,
            "unauthorized" | "no" => BridgeStatus::Unauthorized,
            _ => BridgeStatus::Offline,
        }
    }

    /// Higher means closer to usable; used to collapse duplicate listings
    pub fn readiness(&self) -> u8 {
        match self {
            BridgeStatus::Device => 3,
            BridgeStatus::Connecting => 2,
            BridgeStatus::Unauthorized => 1,
            BridgeStatus::Offline => 0,
        }
    }

    pub fn device_state(&self) -> DeviceState {
        match self {
            BridgeStatus::Device => DeviceState::Connected,
            BridgeStatus::Connecting => DeviceState::Connecting,
            BridgeStatus::Unauthorized => DeviceState::Unauthorized,
            BridgeStatus::Offline => DeviceState::Offline,
        }
    }
}

/// One row of an enumeration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListing {
    pub serial: String,
    pub status: BridgeStatus,
    pub model: Option<String>,
    /// Remaining `key:value` descriptors (product, transport_id, usb, ...)
    pub info: BTreeMap<String, String>,
}

impl DeviceListing {
    pub fn new(serial: impl Into<String>, status: BridgeStatus) -> Self {
        Self {
            serial: serial.into(),
            status,
            model: None,
            info: BTreeMap::new(),
        }
    }
}

/// A device-port to host-port forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub device_port: u16,
    pub host_port: u16,
}

/// Device enumeration and port forwarding backend
#[async_trait]
pub trait DebugBridge: Send + Sync {
    /// Current enumeration snapshot
    async fn list_devices(&self) -> Result<Vec<DeviceListing>, BridgeError>;

    /// Route `rule.device_port` on the device to `rule.host_port` on the host
    async fn add_port_forward(&self, serial: &str, rule: ForwardRule) -> Result<(), BridgeError>;

    async fn remove_port_forward(&self, serial: &str, rule: ForwardRule) -> Result<(), BridgeError>;
}

/// `adb` command-line client
pub struct AdbBridge {
    path: String,
    timeout: Duration,
}

impl AdbBridge {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        let mut command = Command::new(&self.path);
        command.args(args).kill_on_drop(true);

        let description = format!("{} {}", self.path, args.join(" "));
        let token = CancellationToken::new();
        let output = with_timeout(
            move |_| async move { command.output().await },
            self.timeout,
            description.clone(),
            &token,
        )
        .await
        .map_err(|e| BridgeError::CommandFailed(e.to_string()))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::DaemonUnavailable(format!("{} not found", self.path))
            } else {
                BridgeError::CommandFailed(format!("{}: {}", description, e))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if is_daemon_unreachable(&stderr) {
                BridgeError::DaemonUnavailable(stderr)
            } else {
                BridgeError::CommandFailed(format!("{}: {}", description, stderr))
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DebugBridge for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceListing>, BridgeError> {
        let stdout = self.run(&["devices", "-l"]).await?;
        parse_device_list(&stdout)
    }

    async fn add_port_forward(&self, serial: &str, rule: ForwardRule) -> Result<(), BridgeError> {
        let device = format!("tcp:{}", rule.device_port);
        let host = format!("tcp:{}", rule.host_port);
        self.run(&["-s", serial, "reverse", &device, &host]).await?;
        Ok(())
    }

    async fn remove_port_forward(&self, serial: &str, rule: ForwardRule) -> Result<(), BridgeError> {
        let device = format!("tcp:{}", rule.device_port);
        self.run(&["-s", serial, "reverse", "--remove", &device]).await?;
        Ok(())
    }
}

/// True when bridge stderr says the server itself is unreachable
pub fn is_daemon_unreachable(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("cannot connect to daemon")
        || lower.contains("failed to start daemon")
        || lower.contains("cannot start server")
}

/// Parse `adb devices -l` output
pub fn parse_device_list(text: &str) -> Result<Vec<DeviceListing>, BridgeError> {
    let mut listings = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices") || line.starts_with('*') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let serial = match parts.next() {
            Some(serial) => serial,
            None => continue,
        };
        let word = parts
            .next()
            .ok_or_else(|| BridgeError::InvalidOutput(format!("missing status: {}", line)))?;

        let mut listing = DeviceListing::new(serial, BridgeStatus::parse(word));
        for part in parts {
            if let Some((key, value)) = part.split_once(':') {
                if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    continue;
                }
                if key == "model" {
                    listing.model = Some(value.to_string());
                } else {
                    listing.info.insert(key.to_string(), value.to_string());
                }
            }
        }
        listings.push(listing);
    }

    Ok(listings)
}
