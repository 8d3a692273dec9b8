//! Multi-transport selection and failover

pub mod connector;
pub mod manager;
pub mod metrics;

pub use connector::{TcpConnector, TransportConnector};
pub use manager::{FailoverTrigger, TransportManager};
pub use metrics::{quality_for_latency, score, MetricsWindow, ProbeOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Concrete channel the session protocol can run over.
///
/// Declaration order is the tie-break preference: lower overhead first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Socket,
    UsbForwarded,
    Relay,
    Bluetooth,
}

impl TransportKind {
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Socket,
        TransportKind::UsbForwarded,
        TransportKind::Relay,
        TransportKind::Bluetooth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::UsbForwarded => "usb_forwarded",
            TransportKind::Relay => "relay",
            TransportKind::Bluetooth => "bluetooth",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling view of one transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMetrics {
    /// 0.0 to 1.0
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub is_healthy: bool,
}

impl TransportMetrics {
    pub fn healthy(success_rate: f64, average_latency_ms: f64) -> Self {
        Self {
            success_rate,
            average_latency_ms,
            is_healthy: true,
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            success_rate: 0.0,
            average_latency_ms: 0.0,
            is_healthy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

/// The one aggregate connection state; owned by [`TransportManager`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub current_transport: Option<TransportKind>,
    pub connection_quality: ConnectionQuality,
    pub total_connections: u64,
    pub failover_count: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_connected: false,
            current_transport: None,
            connection_quality: ConnectionQuality::Unknown,
            total_connections: 0,
            failover_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_serde() {
        for kind in TransportKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(TransportKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::parse("carrier_pigeon"), None);
    }

    #[test]
    fn test_preference_order() {
        assert!(TransportKind::Socket < TransportKind::UsbForwarded);
        assert!(TransportKind::UsbForwarded < TransportKind::Relay);
        assert!(TransportKind::Relay < TransportKind::Bluetooth);
    }
}
