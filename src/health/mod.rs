//! Per-connection health ledger and predictive scoring

pub mod monitor;
pub mod prediction;

pub use monitor::HealthMonitor;
pub use prediction::{predict, HealthPrediction, PredictionInput, RiskFactor, Stability};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Descriptive metadata about the connected client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub platform: String,
    /// Transport name the session currently runs on (e.g. `polling`, `websocket`)
    pub transport: String,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(platform: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            transport: transport.into(),
            remote_address: None,
            user_agent: None,
        }
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    /// Identity used to group successive connections of one client
    pub fn client_key(&self) -> String {
        match &self.remote_address {
            Some(address) => address.clone(),
            None => format!(
                "{}/{}",
                self.platform,
                self.user_agent.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// One latency sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingSample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
}

/// Category of a recorded connection error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Timeout,
    Application,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Application => write!(f, "application"),
        }
    }
}

/// One recorded error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time view of one connection, live or recently ended
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAnalytics {
    pub connection_id: String,
    pub client_info: ClientInfo,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub active: bool,
    /// Reason code given at disconnect
    pub end_reason: Option<String>,
    pub ping_history: Vec<PingSample>,
    pub errors: Vec<ErrorRecord>,
    pub transport_upgrades: u32,
    pub prediction: HealthPrediction,
}

/// Aggregate over every tracked connection
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalAnalytics {
    pub active_connections: usize,
    pub recently_ended: usize,
    /// Connections tracked since startup
    pub total_tracked: u64,
    /// Mean of the per-connection mean latencies (active connections with samples)
    pub average_latency_ms: f64,
    pub total_errors: usize,
    pub total_transport_upgrades: u64,
    pub connections_by_transport: BTreeMap<String, usize>,
    pub stable: usize,
    pub degrading: usize,
    pub unstable: usize,
}
