//! Peer-facing ping/pong and advice messages (JSON text frames)

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::lifecycle::LifecycleEvent;
use crate::reconnect::ReconnectionRecommendation;

/// Pongs answering a ping older than this are not timed
pub const MAX_PONG_AGE_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Host to client; `sent_at_ms` is the host clock in Unix milliseconds
    Ping { id: u64, sent_at_ms: i64 },
    /// Client echo of a ping
    Pong { id: u64, sent_at_ms: i64 },
    /// Round trip measured on the client side
    LatencyReport { latency_ms: f64 },
    /// Client switched the underlying transport (e.g. polling to websocket)
    Upgrade { from: String, to: String },
    /// Client is closing on purpose
    Bye,
    ReconnectAdvice {
        recommendation: ReconnectionRecommendation,
    },
}

impl PeerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn ping(id: u64, now_ms: i64) -> Self {
        PeerMessage::Ping {
            id,
            sent_at_ms: now_ms,
        }
    }

    /// Convert a client message to a lifecycle event.
    /// Pongs are timed against `now_ms`; messages with nothing to record yield `None`.
    pub fn to_lifecycle(
        &self,
        connection_id: &str,
        now_ms: i64,
    ) -> Result<Option<LifecycleEvent>, ProtocolError> {
        let latency_ms = match self {
            PeerMessage::LatencyReport { latency_ms } => *latency_ms,
            PeerMessage::Pong { sent_at_ms, .. } => {
                let elapsed = now_ms
                    .checked_sub(*sent_at_ms)
                    .filter(|elapsed| (0..=MAX_PONG_AGE_MS).contains(elapsed))
                    .ok_or_else(|| {
                        ProtocolError::InvalidValue(format!(
                            "pong timestamp out of range: sent {} now {}",
                            sent_at_ms, now_ms
                        ))
                    })?;
                elapsed as f64
            }
            PeerMessage::Upgrade { from, to } => {
                return Ok(Some(LifecycleEvent::TransportUpgrade {
                    connection_id: connection_id.to_string(),
                    from: from.clone(),
                    to: to.clone(),
                }))
            }
            PeerMessage::Ping { .. } | PeerMessage::Bye | PeerMessage::ReconnectAdvice { .. } => {
                return Ok(None)
            }
        };

        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(ProtocolError::InvalidValue(format!(
                "latency {}",
                latency_ms
            )));
        }

        Ok(Some(LifecycleEvent::Latency {
            connection_id: connection_id.to_string(),
            latency_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ReconnectionStrategy;

    #[test]
    fn test_parse_latency_report() {
        let message = PeerMessage::parse(r#"{"type":"latency_report","latency_ms":42.5}"#).unwrap();
        assert_eq!(message, PeerMessage::LatencyReport { latency_ms: 42.5 });

        let event = message.to_lifecycle("c1", 0).unwrap().unwrap();
        assert_eq!(
            event,
            LifecycleEvent::Latency {
                connection_id: "c1".to_string(),
                latency_ms: 42.5
            }
        );
    }

    #[test]
    fn test_pong_is_timed() {
        let pong = PeerMessage::parse(r#"{"type":"pong","id":7,"sent_at_ms":1000}"#).unwrap();
        match pong.to_lifecycle("c1", 1_035).unwrap() {
            Some(LifecycleEvent::Latency { latency_ms, .. }) => assert_eq!(latency_ms, 35.0),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            pong.to_lifecycle("c1", 900),
            Err(ProtocolError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_pong_timestamp_out_of_range() {
        let now = 1_700_000_000_000;
        let ancient =
            PeerMessage::parse(r#"{"type":"pong","id":1,"sent_at_ms":-9223372036854775808}"#)
                .unwrap();
        assert!(matches!(
            ancient.to_lifecycle("c1", now),
            Err(ProtocolError::InvalidValue(_))
        ));

        let stale = PeerMessage::Pong {
            id: 2,
            sent_at_ms: now - MAX_PONG_AGE_MS - 1,
        };
        assert!(matches!(
            stale.to_lifecycle("c1", now),
            Err(ProtocolError::InvalidValue(_))
        ));

        let far_future = PeerMessage::Pong {
            id: 3,
            sent_at_ms: i64::MAX,
        };
        assert!(matches!(
            far_future.to_lifecycle("c1", -1),
            Err(ProtocolError::InvalidValue(_))
        ));

        let oldest_timed = PeerMessage::Pong {
            id: 4,
            sent_at_ms: now - MAX_PONG_AGE_MS,
        };
        assert!(oldest_timed.to_lifecycle("c1", now).unwrap().is_some());
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            PeerMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            PeerMessage::parse(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Malformed(_))
        ));

        let negative = PeerMessage::LatencyReport { latency_ms: -1.0 };
        assert!(matches!(
            negative.to_lifecycle("c1", 0),
            Err(ProtocolError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_advice_wire_shape() {
        let advice = PeerMessage::ReconnectAdvice {
            recommendation: ReconnectionRecommendation {
                strategy: ReconnectionStrategy::ExponentialBackoff,
                estimated_delay_ms: 2_000,
                max_attempts: 10,
                tips: vec!["Reconnecting automatically".to_string()],
            },
        };
        let json: serde_json::Value = serde_json::from_str(&advice.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "reconnect_advice");
        assert_eq!(json["recommendation"]["strategy"], "exponential_backoff");
        assert_eq!(json["recommendation"]["estimatedDelayMs"], 2_000);
        assert!(PeerMessage::ping(1, 5).to_lifecycle("c1", 10).unwrap().is_none());
    }

    #[test]
    fn test_upgrade_and_bye() {
        let upgrade =
            PeerMessage::parse(r#"{"type":"upgrade","from":"polling","to":"websocket"}"#).unwrap();
        assert!(matches!(
            upgrade.to_lifecycle("c1", 0).unwrap(),
            Some(LifecycleEvent::TransportUpgrade { ref to, .. }) if to == "websocket"
        ));
        assert_eq!(PeerMessage::parse(r#"{"type":"bye"}"#).unwrap(), PeerMessage::Bye);
    }
}
