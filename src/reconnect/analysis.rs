//! Disconnect classification and reconnection advice
//!
//! Both functions are pure: same inputs, same answer, and they always
//! return a result. `Unknown` is the fallback cause.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{ReconnectionConfig, RetryConfig};
use crate::retry::backoff_delay;

/// Why the transport said the connection closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The peer closed deliberately
    ClientInitiated,
    /// The host closed deliberately
    ServerInitiated,
    TransportError,
    TransportClose,
    PingTimeout,
    ServerShutdown,
    Other(String),
}

impl DisconnectReason {
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "client namespace disconnect" | "io client disconnect" | "client disconnect" => {
                DisconnectReason::ClientInitiated
            }
            "server namespace disconnect" | "io server disconnect" => DisconnectReason::ServerInitiated,
            "transport error" => DisconnectReason::TransportError,
            "transport close" => DisconnectReason::TransportClose,
            "ping timeout" => DisconnectReason::PingTimeout,
            "server shutting down" => DisconnectReason::ServerShutdown,
            _ => DisconnectReason::Other(code.to_string()),
        }
    }

    pub fn is_client_initiated(&self) -> bool {
        matches!(self, DisconnectReason::ClientInitiated)
    }

    /// The link itself broke
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            DisconnectReason::TransportError | DisconnectReason::TransportClose
        )
    }

    /// Counted in a client's recent failure history
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::ClientInitiated
                | DisconnectReason::ServerInitiated
                | DisconnectReason::ServerShutdown
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientInitiated => write!(f, "client initiated"),
            DisconnectReason::ServerInitiated => write!(f, "server initiated"),
            DisconnectReason::TransportError => write!(f, "transport error"),
            DisconnectReason::TransportClose => write!(f, "transport close"),
            DisconnectReason::PingTimeout => write!(f, "ping timeout"),
            DisconnectReason::ServerShutdown => write!(f, "server shutting down"),
            DisconnectReason::Other(code) => write!(f, "{}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    ClientInitiated,
    UnstableNetwork,
    TransportDegradation,
    Flapping,
    Unknown,
}

impl DisconnectCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectCause::ClientInitiated => "client_initiated",
            DisconnectCause::UnstableNetwork => "unstable_network",
            DisconnectCause::TransportDegradation => "transport_degradation",
            DisconnectCause::Flapping => "flapping",
            DisconnectCause::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    Immediate,
    Delayed,
    Manual,
}

/// What the health ledger knew about a connection when it ended
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHistorySnapshot {
    pub recent_failures: u32,
    pub longest_connection_ms: u64,
    pub network_type: String,
    pub transport_upgrades: u32,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectionAnalysis {
    pub connection_id: String,
    pub reason: DisconnectReason,
    pub cause: DisconnectCause,
    pub severity: Severity,
    pub recoverability: Recoverability,
    pub history: ConnectionHistorySnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionStrategy {
    Immediate,
    ExponentialBackoff,
    LongWait,
}

impl ReconnectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectionStrategy::Immediate => "immediate",
            ReconnectionStrategy::ExponentialBackoff => "exponential_backoff",
            ReconnectionStrategy::LongWait => "long_wait",
        }
    }
}

/// Advice for the peer; the host never reconnects on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionRecommendation {
    pub strategy: ReconnectionStrategy,
    pub estimated_delay_ms: u64,
    pub max_attempts: u32,
    pub tips: Vec<String>,
}

/// Classify a disconnect. Rules are checked in priority order.
pub fn analyze_disconnection_cause(
    connection_id: &str,
    reason_code: &str,
    history: &ConnectionHistorySnapshot,
    config: &ReconnectionConfig,
) -> DisconnectionAnalysis {
    let reason = DisconnectReason::from_code(reason_code);

    let (cause, severity, recoverability) = if reason.is_client_initiated() {
        (DisconnectCause::ClientInitiated, Severity::Low, Recoverability::Immediate)
    } else if history.error_rate > config.high_error_rate
        || history.recent_failures >= config.unstable_failure_count
    {
        (DisconnectCause::UnstableNetwork, Severity::High, Recoverability::Delayed)
    } else if reason.is_transport_failure() || history.avg_latency_ms > config.high_latency_ms {
        (
            DisconnectCause::TransportDegradation,
            Severity::Medium,
            Recoverability::Delayed,
        )
    } else if history.recent_failures >= 2
        && history.longest_connection_ms < config.flapping_connection_ms
    {
        (DisconnectCause::Flapping, Severity::High, Recoverability::Manual)
    } else {
        (DisconnectCause::Unknown, Severity::Medium, Recoverability::Delayed)
    };

    DisconnectionAnalysis {
        connection_id: connection_id.to_string(),
        reason,
        cause,
        severity,
        recoverability,
        history: history.clone(),
    }
}

fn tips_for(cause: DisconnectCause, history: &ConnectionHistorySnapshot) -> Vec<String> {
    let mut tips: Vec<String> = match cause {
        DisconnectCause::ClientInitiated => Vec::new(),
        DisconnectCause::UnstableNetwork => vec![
            "Your network connection looks unstable".to_string(),
            "Move closer to the Wi-Fi router or connect with a USB cable".to_string(),
        ],
        DisconnectCause::TransportDegradation => vec![
            "The connection to the computer degraded".to_string(),
            "Reconnecting automatically with increasing delays".to_string(),
        ],
        DisconnectCause::Flapping => vec![
            "The connection keeps dropping right after it is established".to_string(),
            "Check that the phone and computer are on the same network".to_string(),
            "Try a USB connection instead".to_string(),
            "Reconnect manually once the network is stable".to_string(),
        ],
        DisconnectCause::Unknown => vec!["Reconnecting automatically".to_string()],
    };

    if history.transport_upgrades > 0 && cause != DisconnectCause::ClientInitiated {
        tips.push(format!(
            "The {} transport changed {} time(s) during the session",
            if history.network_type.is_empty() {
                "session"
            } else {
                history.network_type.as_str()
            },
            history.transport_upgrades
        ));
    }
    tips
}

/// Map an analysis to a strategy. Backoff delays come from the retry parameters.
pub fn recommend_reconnection(
    analysis: &DisconnectionAnalysis,
    config: &ReconnectionConfig,
    retry: &RetryConfig,
) -> ReconnectionRecommendation {
    let tips = tips_for(analysis.cause, &analysis.history);

    match analysis.recoverability {
        Recoverability::Immediate => ReconnectionRecommendation {
            strategy: ReconnectionStrategy::Immediate,
            estimated_delay_ms: config.immediate_delay_ms,
            max_attempts: config.immediate_max_attempts,
            tips,
        },
        Recoverability::Delayed => {
            let delay = backoff_delay(
                Duration::from_millis(retry.base_delay_ms),
                retry.backoff_factor,
                Duration::from_millis(retry.max_delay_ms),
                analysis.history.recent_failures.max(1),
            );
            ReconnectionRecommendation {
                strategy: ReconnectionStrategy::ExponentialBackoff,
                estimated_delay_ms: delay.as_millis() as u64,
                max_attempts: config.backoff_max_attempts,
                tips,
            }
        }
        Recoverability::Manual => ReconnectionRecommendation {
            strategy: ReconnectionStrategy::LongWait,
            estimated_delay_ms: config.manual_delay_ms,
            max_attempts: config.manual_max_attempts,
            tips,
        },
    }
}
