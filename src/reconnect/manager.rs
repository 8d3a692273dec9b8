//! Disconnect handling and reconnection statistics

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::{ReconnectionConfig, RetryConfig};
use crate::events::{EventChannel, ReconnectionEvent};
use crate::health::HealthMonitor;
use crate::reconnect::analysis::{
    analyze_disconnection_cause, recommend_reconnection, ConnectionHistorySnapshot,
    DisconnectionAnalysis, ReconnectionRecommendation,
};

/// One analyzed disconnect
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionOutcome {
    pub analyzed_at: DateTime<Utc>,
    pub analysis: DisconnectionAnalysis,
    pub recommendation: ReconnectionRecommendation,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionStats {
    pub total_disconnects: u64,
    pub by_cause: BTreeMap<String, u64>,
    pub by_strategy: BTreeMap<String, u64>,
    /// Newest last
    pub recent: Vec<ReconnectionOutcome>,
}

#[derive(Default)]
struct StatsState {
    total: u64,
    by_cause: BTreeMap<String, u64>,
    by_strategy: BTreeMap<String, u64>,
    recent: VecDeque<ReconnectionOutcome>,
}

pub struct ReconnectionManager {
    config: ReconnectionConfig,
    retry: RetryConfig,
    health: Arc<HealthMonitor>,
    stats: Mutex<StatsState>,
    events: EventChannel<ReconnectionEvent>,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectionConfig, retry: RetryConfig, health: Arc<HealthMonitor>) -> Self {
        Self {
            config,
            retry,
            health,
            stats: Mutex::new(StatsState::default()),
            events: EventChannel::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectionEvent> {
        self.events.subscribe()
    }

    /// Classify a disconnect from the health ledger's view of the connection
    /// and publish the advice. Call after `HealthMonitor::end_connection`.
    pub fn handle_disconnect(&self, connection_id: &str, reason_code: &str) -> ReconnectionOutcome {
        let history = match self.health.history_snapshot(connection_id) {
            Some(history) => history,
            None => {
                debug!("No health history for {}, analyzing without it", connection_id);
                ConnectionHistorySnapshot::default()
            }
        };
        self.handle_with_history(connection_id, reason_code, &history)
    }

    /// Same as [`handle_disconnect`](Self::handle_disconnect) with a caller-supplied history
    pub fn handle_with_history(
        &self,
        connection_id: &str,
        reason_code: &str,
        history: &ConnectionHistorySnapshot,
    ) -> ReconnectionOutcome {
        let analysis = analyze_disconnection_cause(connection_id, reason_code, history, &self.config);
        let recommendation = recommend_reconnection(&analysis, &self.config, &self.retry);

        info!(
            "Connection {} disconnected ({}): cause={} strategy={} delay={}ms",
            connection_id,
            reason_code,
            analysis.cause.as_str(),
            recommendation.strategy.as_str(),
            recommendation.estimated_delay_ms
        );

        let outcome = ReconnectionOutcome {
            analyzed_at: Utc::now(),
            analysis,
            recommendation,
        };
        self.record(&outcome);

        self.events.emit(ReconnectionEvent::ReconnectionRecommendation {
            connection_id: connection_id.to_string(),
            analysis: outcome.analysis.clone(),
            recommendation: outcome.recommendation.clone(),
        });
        outcome
    }

    fn record(&self, outcome: &ReconnectionOutcome) {
        let mut stats = self.stats.lock();
        stats.total += 1;
        *stats
            .by_cause
            .entry(outcome.analysis.cause.as_str().to_string())
            .or_insert(0) += 1;
        *stats
            .by_strategy
            .entry(outcome.recommendation.strategy.as_str().to_string())
            .or_insert(0) += 1;
        stats.recent.push_back(outcome.clone());
        while stats.recent.len() > self.config.recent_history {
            stats.recent.pop_front();
        }
    }

    pub fn get_reconnection_stats(&self) -> ReconnectionStats {
        let stats = self.stats.lock();
        ReconnectionStats {
            total_disconnects: stats.total,
            by_cause: stats.by_cause.clone(),
            by_strategy: stats.by_strategy.clone(),
            recent: stats.recent.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::events::drain;
    use crate::health::{ClientInfo, ErrorKind};
    use crate::reconnect::{DisconnectCause, ReconnectionStrategy};

    fn setup(config: ReconnectionConfig) -> (Arc<HealthMonitor>, ReconnectionManager) {
        let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
        let manager = ReconnectionManager::new(config, RetryConfig::default(), health.clone());
        (health, manager)
    }

    #[test]
    fn test_disconnect_uses_health_history() {
        let (health, manager) = setup(ReconnectionConfig::default());
        let mut rx = manager.subscribe();

        health
            .track_connection("a", ClientInfo::new("android", "websocket"))
            .unwrap();
        for latency in [20.0, 25.0, 30.0] {
            health.record_latency("a", latency);
        }
        health.record_error("a", ErrorKind::Transport, "write failed");
        health.end_connection("a", "transport error");

        let outcome = manager.handle_disconnect("a", "transport error");
        assert_eq!(outcome.analysis.history.recent_failures, 1);
        assert_eq!(outcome.analysis.cause, DisconnectCause::TransportDegradation);
        assert_eq!(
            outcome.recommendation.strategy,
            ReconnectionStrategy::ExponentialBackoff
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let ReconnectionEvent::ReconnectionRecommendation { connection_id, .. } = &events[0];
        assert_eq!(connection_id, "a");
    }

    #[test]
    fn test_unknown_connection_still_classified() {
        let (_, manager) = setup(ReconnectionConfig::default());
        let outcome = manager.handle_disconnect("ghost", "ping timeout");
        assert_eq!(outcome.analysis.cause, DisconnectCause::Unknown);
    }

    #[test]
    fn test_stats_are_bounded() {
        let (_, manager) = setup(ReconnectionConfig {
            recent_history: 3,
            ..ReconnectionConfig::default()
        });

        for i in 0..5 {
            manager.handle_with_history(
                &format!("c{}", i),
                "io client disconnect",
                &ConnectionHistorySnapshot::default(),
            );
        }
        manager.handle_with_history("c5", "transport close", &ConnectionHistorySnapshot::default());

        let stats = manager.get_reconnection_stats();
        assert_eq!(stats.total_disconnects, 6);
        assert_eq!(stats.by_cause.get("client_initiated"), Some(&5));
        assert_eq!(stats.by_cause.get("transport_degradation"), Some(&1));
        assert_eq!(stats.by_strategy.get("immediate"), Some(&5));
        assert_eq!(stats.recent.len(), 3);
        assert_eq!(stats.recent[2].analysis.connection_id, "c5");
    }
}
