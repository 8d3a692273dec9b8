//! Debug-bridge device discovery and port forwarding

pub mod bridge;
pub mod tracker;

pub use bridge::{AdbBridge, BridgeStatus, DebugBridge, DeviceListing, ForwardRule};
pub use tracker::{DeviceTracker, SessionHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a tracked device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Absent,
    Connecting,
    Connected,
    Offline,
    Unauthorized,
}

/// A device visible to the debug bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub model: Option<String>,
    pub info: BTreeMap<String, String>,
    pub forwarding_active: bool,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::Absent,
            model: None,
            info: BTreeMap::new(),
            forwarding_active: false,
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == DeviceState::Connected
    }
}
