//! Connection health ledger
//!
//! One record per live connection, keyed by the transport-assigned id.
//! Ended connections are summarized into a short retained tail so the
//! reconnection path can still look at them after the transport is gone.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::error::HealthError;
use crate::events::{EventChannel, HealthEvent};
use crate::health::prediction::{predict, HealthPrediction, PredictionInput, Stability};
use crate::health::{ClientInfo, ConnectionAnalytics, ErrorKind, ErrorRecord, GlobalAnalytics, PingSample};
use crate::reconnect::{ConnectionHistorySnapshot, DisconnectReason};

/// Bound on remembered unknown ids before the set is reset
const UNKNOWN_ID_MEMORY: usize = 1024;

struct ConnectionRecord {
    client_info: ClientInfo,
    start_time: DateTime<Utc>,
    pings: VecDeque<PingSample>,
    errors: VecDeque<ErrorRecord>,
    transport_upgrades: u32,
}

impl ConnectionRecord {
    fn new(client_info: ClientInfo) -> Self {
        Self {
            client_info,
            start_time: Utc::now(),
            pings: VecDeque::new(),
            errors: VecDeque::new(),
            transport_upgrades: 0,
        }
    }

    fn push_ping(&mut self, sample: PingSample, limit: usize) {
        self.pings.push_back(sample);
        while self.pings.len() > limit {
            self.pings.pop_front();
        }
    }

    fn push_error(&mut self, record: ErrorRecord, limit: usize) {
        self.errors.push_back(record);
        while self.errors.len() > limit {
            self.errors.pop_front();
        }
    }

    fn prediction(&self, config: &HealthConfig, now: DateTime<Utc>) -> HealthPrediction {
        let cutoff = now - ChronoDuration::milliseconds(config.error_rate_window_ms as i64);
        let latencies: Vec<f64> = self.pings.iter().map(|s| s.latency_ms).collect();
        let recent_samples = self.pings.iter().filter(|s| s.timestamp >= cutoff).count();
        let recent_errors = self.errors.iter().filter(|e| e.timestamp >= cutoff).count();

        predict(
            PredictionInput {
                latencies: &latencies,
                recent_samples,
                recent_errors,
                transport_upgrades: self.transport_upgrades,
            },
            config,
        )
    }

    fn analytics(
        &self,
        id: &str,
        config: &HealthConfig,
        now: DateTime<Utc>,
        end_reason: Option<&str>,
    ) -> ConnectionAnalytics {
        ConnectionAnalytics {
            connection_id: id.to_string(),
            client_info: self.client_info.clone(),
            start_time: self.start_time,
            end_time: end_reason.map(|_| now),
            duration_ms: millis_between(self.start_time, now),
            active: end_reason.is_none(),
            end_reason: end_reason.map(str::to_string),
            ping_history: self.pings.iter().cloned().collect(),
            errors: self.errors.iter().cloned().collect(),
            transport_upgrades: self.transport_upgrades,
            prediction: self.prediction(config, now),
        }
    }
}

struct EndedConnection {
    analytics: ConnectionAnalytics,
    reason: DisconnectReason,
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Owns the connection ledger; all access goes through its methods
pub struct HealthMonitor {
    config: HealthConfig,
    connections: DashMap<String, ConnectionRecord>,
    ended: Mutex<VecDeque<EndedConnection>>,
    unknown_logged: Mutex<HashSet<String>>,
    total_tracked: AtomicU64,
    events: EventChannel<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            ended: Mutex::new(VecDeque::new()),
            unknown_logged: Mutex::new(HashSet::new()),
            total_tracked: AtomicU64::new(0),
            events: EventChannel::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start tracking a connection. A duplicate id is a caller bug.
    pub fn track_connection(&self, id: &str, client_info: ClientInfo) -> Result<(), HealthError> {
        match self.connections.entry(id.to_string()) {
            Entry::Occupied(_) => Err(HealthError::AlreadyTracked(id.to_string())),
            Entry::Vacant(slot) => {
                info!(
                    "Tracking connection {} ({} over {})",
                    id, client_info.platform, client_info.transport
                );
                slot.insert(ConnectionRecord::new(client_info));
                self.total_tracked.fetch_add(1, Ordering::Relaxed);
                self.unknown_logged.lock().remove(id);
                Ok(())
            }
        }
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    /// Append a latency sample and publish the recomputed prediction
    pub fn record_latency(&self, id: &str, latency_ms: f64) -> Option<HealthPrediction> {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            debug!("Ignoring invalid latency {} for {}", latency_ms, id);
            return None;
        }

        let prediction = {
            let mut record = match self.connections.get_mut(id) {
                Some(record) => record,
                None => {
                    self.note_unknown(id, "latency sample");
                    return None;
                }
            };
            let now = Utc::now();
            record.push_ping(
                PingSample {
                    timestamp: now,
                    latency_ms,
                },
                self.config.ping_window,
            );
            record.prediction(&self.config, now)
        };

        self.events.emit(HealthEvent::HealthPrediction {
            connection_id: id.to_string(),
            prediction: prediction.clone(),
        });
        Some(prediction)
    }

    /// Append an error and publish it right away
    pub fn record_error(
        &self,
        id: &str,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Option<ErrorRecord> {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        };

        match self.connections.get_mut(id) {
            Some(mut record) => record.push_error(error.clone(), self.config.error_window),
            None => {
                self.note_unknown(id, "error");
                return None;
            }
        }

        debug!("Connection {} {} error: {}", id, kind, error.message);
        self.events.emit(HealthEvent::ConnectionError {
            connection_id: id.to_string(),
            error: error.clone(),
        });
        Some(error)
    }

    /// Count a transport upgrade; predictions are not recomputed here
    pub fn record_transport_upgrade(&self, id: &str, from: &str, to: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(mut record) => {
                record.transport_upgrades += 1;
                record.client_info.transport = to.to_string();
                info!("Connection {} upgraded transport {} -> {}", id, from, to);
                true
            }
            None => {
                self.note_unknown(id, "transport upgrade");
                false
            }
        }
    }

    /// Finalize a connection into the retained tail
    pub fn end_connection(&self, id: &str, reason: &str) -> Option<ConnectionAnalytics> {
        let record = match self.connections.remove(id) {
            Some((_, record)) => record,
            None => {
                self.note_unknown(id, "disconnect");
                return None;
            }
        };

        let now = Utc::now();
        let analytics = record.analytics(id, &self.config, now, Some(reason));
        info!(
            "Connection {} ended after {}ms ({}), avg latency {:.1}ms",
            id, analytics.duration_ms, reason, analytics.prediction.avg_latency_ms
        );

        let mut ended = self.ended.lock();
        ended.push_back(EndedConnection {
            analytics: analytics.clone(),
            reason: DisconnectReason::from_code(reason),
        });
        self.prune_ended(&mut ended, now);

        Some(analytics)
    }

    /// History the reconnection analysis reads, for a live or recently ended id
    pub fn history_snapshot(&self, id: &str) -> Option<ConnectionHistorySnapshot> {
        let now = Utc::now();
        let live = self.connections.get(id).map(|record| {
            (
                record.client_info.clone(),
                millis_between(record.start_time, now),
                record.transport_upgrades,
                record.prediction(&self.config, now),
            )
        });

        let mut ended = self.ended.lock();
        self.prune_ended(&mut ended, now);

        let (client_info, live_duration, transport_upgrades, prediction) = match live {
            Some((info, duration, upgrades, prediction)) => (info, duration, upgrades, prediction),
            None => {
                let entry = ended.iter().rev().find(|e| e.analytics.connection_id == id)?;
                (
                    entry.analytics.client_info.clone(),
                    0,
                    entry.analytics.transport_upgrades,
                    entry.analytics.prediction.clone(),
                )
            }
        };

        let key = client_info.client_key();
        let cutoff = now - ChronoDuration::milliseconds(self.config.failure_window_ms as i64);
        let mut recent_failures = 0u32;
        let mut longest_connection_ms = live_duration;

        for entry in ended.iter().filter(|e| {
            e.analytics.client_info.client_key() == key
                && e.analytics.end_time.map_or(false, |t| t >= cutoff)
        }) {
            if entry.reason.counts_as_failure() {
                recent_failures += 1;
            }
            longest_connection_ms = longest_connection_ms.max(entry.analytics.duration_ms);
        }

        Some(ConnectionHistorySnapshot {
            recent_failures,
            longest_connection_ms,
            network_type: client_info.transport,
            transport_upgrades,
            avg_latency_ms: prediction.avg_latency_ms,
            error_rate: prediction.error_rate,
        })
    }

    pub fn get_connection_analytics(&self, id: &str) -> Option<ConnectionAnalytics> {
        if let Some(record) = self.connections.get(id) {
            return Some(record.analytics(id, &self.config, Utc::now(), None));
        }

        let mut ended = self.ended.lock();
        self.prune_ended(&mut ended, Utc::now());
        ended
            .iter()
            .rev()
            .find(|e| e.analytics.connection_id == id)
            .map(|e| e.analytics.clone())
    }

    pub fn get_global_analytics(&self) -> GlobalAnalytics {
        let now = Utc::now();
        let mut global = GlobalAnalytics {
            total_tracked: self.total_tracked.load(Ordering::Relaxed),
            ..Default::default()
        };

        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;

        for entry in self.connections.iter() {
            let record = entry.value();
            let prediction = record.prediction(&self.config, now);

            global.active_connections += 1;
            global.total_errors += record.errors.len();
            global.total_transport_upgrades += record.transport_upgrades as u64;
            *global
                .connections_by_transport
                .entry(record.client_info.transport.clone())
                .or_insert(0) += 1;

            if prediction.sample_count > 0 {
                latency_sum += prediction.avg_latency_ms;
                latency_count += 1;
            }
            match prediction.predicted_stability {
                Stability::Stable => global.stable += 1,
                Stability::Degrading => global.degrading += 1,
                Stability::Unstable => global.unstable += 1,
            }
        }

        if latency_count > 0 {
            global.average_latency_ms = latency_sum / latency_count as f64;
        }

        let mut ended = self.ended.lock();
        self.prune_ended(&mut ended, now);
        global.recently_ended = ended.len();

        global
    }

    fn prune_ended(&self, ended: &mut VecDeque<EndedConnection>, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds(self.config.retention_ms as i64);
        while ended
            .front()
            .and_then(|e| e.analytics.end_time)
            .map_or(false, |t| t < cutoff)
        {
            ended.pop_front();
        }
        while ended.len() > self.config.retained_limit {
            ended.pop_front();
        }
    }

    /// Late events after disconnect are expected; log once per id
    fn note_unknown(&self, id: &str, what: &str) {
        let mut seen = self.unknown_logged.lock();
        if seen.len() >= UNKNOWN_ID_MEMORY {
            seen.clear();
        }
        if seen.insert(id.to_string()) {
            debug!("Ignoring {} for unknown connection {}", what, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_ERROR_WINDOW, DEFAULT_PING_WINDOW};
    use crate::events::drain;
    use crate::health::RiskFactor;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    fn client(address: &str) -> ClientInfo {
        ClientInfo::new("android", "websocket").with_remote_address(address)
    }

    #[test]
    fn test_track_twice_fails() {
        let monitor = monitor();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();
        let result = monitor.track_connection("a", client("10.0.0.2"));
        assert!(matches!(result, Err(HealthError::AlreadyTracked(_))));
        assert_eq!(monitor.active_count(), 1);
    }

    #[test]
    fn test_window_keeps_most_recent_samples() {
        let monitor = monitor();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();

        let mut last = None;
        for latency in 1..=60 {
            last = monitor.record_latency("a", latency as f64);
        }

        let prediction = last.unwrap();
        assert_eq!(prediction.sample_count, 50);
        // samples 11..=60 remain
        assert!((prediction.avg_latency_ms - 35.5).abs() < 1e-9);

        let analytics = monitor.get_connection_analytics("a").unwrap();
        assert_eq!(analytics.ping_history.len(), 50);
        assert_eq!(analytics.ping_history[0].latency_ms, 11.0);
    }

    #[test]
    fn test_latency_publishes_prediction() {
        let monitor = monitor();
        let mut rx = monitor.subscribe();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();

        monitor.record_latency("a", 20.0);
        monitor.record_latency("a", 30.0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            HealthEvent::HealthPrediction {
                connection_id,
                prediction,
            } => {
                assert_eq!(connection_id, "a");
                assert_eq!(prediction.predicted_stability, Stability::Stable);
                assert!((prediction.avg_latency_ms - 25.0).abs() < 1e-9);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_error_published_immediately() {
        let monitor = monitor();
        let mut rx = monitor.subscribe();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();

        monitor.record_error("a", ErrorKind::Transport, "socket reset");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            HealthEvent::ConnectionError { error, .. } if error.message == "socket reset"
        ));

        let prediction = monitor.record_latency("a", 20.0).unwrap();
        assert!(prediction.risk_factors.contains(&RiskFactor::FrequentErrors));
        assert_ne!(prediction.predicted_stability, Stability::Stable);
    }

    #[test]
    fn test_unknown_connection_is_ignored() {
        let monitor = monitor();
        let mut rx = monitor.subscribe();

        assert!(monitor.record_latency("ghost", 10.0).is_none());
        assert!(monitor.record_latency("ghost", 12.0).is_none());
        assert!(monitor.record_error("ghost", ErrorKind::Protocol, "late").is_none());
        assert!(!monitor.record_transport_upgrade("ghost", "polling", "websocket"));
        assert!(monitor.end_connection("ghost", "transport close").is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_invalid_latency_is_ignored() {
        let monitor = monitor();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();
        assert!(monitor.record_latency("a", f64::NAN).is_none());
        assert!(monitor.record_latency("a", -5.0).is_none());
        assert_eq!(monitor.get_connection_analytics("a").unwrap().ping_history.len(), 0);
    }

    #[test]
    fn test_upgrade_does_not_emit() {
        let monitor = monitor();
        let mut rx = monitor.subscribe();
        monitor
            .track_connection("a", ClientInfo::new("android", "polling"))
            .unwrap();

        assert!(monitor.record_transport_upgrade("a", "polling", "websocket"));
        assert!(drain(&mut rx).is_empty());

        let analytics = monitor.get_connection_analytics("a").unwrap();
        assert_eq!(analytics.transport_upgrades, 1);
        assert_eq!(analytics.client_info.transport, "websocket");
    }

    #[test]
    fn test_ended_connection_stays_queryable() {
        let monitor = monitor();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();
        monitor.record_latency("a", 40.0);

        let summary = monitor.end_connection("a", "transport close").unwrap();
        assert!(!summary.active);
        assert_eq!(summary.end_reason.as_deref(), Some("transport close"));
        assert!(!monitor.is_tracked("a"));

        let analytics = monitor.get_connection_analytics("a").unwrap();
        assert!(!analytics.active);
        assert_eq!(analytics.ping_history.len(), 1);

        // late sample after the end is dropped
        assert!(monitor.record_latency("a", 10.0).is_none());
    }

    #[test]
    fn test_history_counts_recent_failures_per_client() {
        let monitor = monitor();
        for (id, reason) in [
            ("a1", "transport error"),
            ("a2", "ping timeout"),
            ("a3", "client namespace disconnect"),
        ] {
            monitor.track_connection(id, client("10.0.0.2")).unwrap();
            monitor.end_connection(id, reason);
        }
        monitor.track_connection("b1", client("10.0.0.9")).unwrap();
        monitor.end_connection("b1", "transport close");

        let snapshot = monitor.history_snapshot("a3").unwrap();
        assert_eq!(snapshot.recent_failures, 2);
        assert_eq!(snapshot.network_type, "websocket");

        let snapshot = monitor.history_snapshot("b1").unwrap();
        assert_eq!(snapshot.recent_failures, 1);
    }

    #[test]
    fn test_history_for_live_connection() {
        let monitor = monitor();
        monitor.track_connection("a", client("10.0.0.2")).unwrap();
        for latency in [20.0, 25.0, 30.0] {
            monitor.record_latency("a", latency);
        }
        monitor.record_error("a", ErrorKind::Transport, "write failed");

        let snapshot = monitor.history_snapshot("a").unwrap();
        assert_eq!(snapshot.recent_failures, 0);
        assert!((snapshot.avg_latency_ms - 25.0).abs() < 1e-9);
        assert!((snapshot.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(monitor.history_snapshot("missing").is_none());
    }

    #[test]
    fn test_error_rate_only_counts_recent_window() {
        let monitor = monitor();
        monitor.track_connection("a", client("10.0.0.1")).unwrap();

        let stale = Utc::now() - ChronoDuration::minutes(10);
        {
            let mut record = monitor.connections.get_mut("a").unwrap();
            for _ in 0..4 {
                record.push_error(
                    ErrorRecord {
                        timestamp: stale,
                        kind: ErrorKind::Transport,
                        message: "reset".to_string(),
                    },
                    DEFAULT_ERROR_WINDOW,
                );
            }
            record.push_ping(
                PingSample {
                    timestamp: stale,
                    latency_ms: 40.0,
                },
                DEFAULT_PING_WINDOW,
            );
        }

        monitor.record_latency("a", 40.0).unwrap();
        let prediction = monitor.record_latency("a", 40.0).unwrap();
        assert_eq!(prediction.error_rate, 0.0);
        assert_eq!(prediction.predicted_stability, Stability::Stable);
        assert!(prediction.risk_factors.is_empty());

        monitor.record_error("a", ErrorKind::Timeout, "pong missed");
        let snapshot = monitor.history_snapshot("a").unwrap();
        assert!((snapshot.error_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_failures_outside_window_are_not_recent() {
        let monitor = HealthMonitor::new(HealthConfig {
            retention_ms: 60 * 60 * 1000,
            failure_window_ms: 5 * 60 * 1000,
            ..HealthConfig::default()
        });

        monitor.track_connection("old", client("10.0.0.2")).unwrap();
        monitor.end_connection("old", "transport error").unwrap();
        {
            let mut ended = monitor.ended.lock();
            let entry = ended.back_mut().unwrap();
            entry.analytics.end_time = Some(Utc::now() - ChronoDuration::minutes(10));
            entry.analytics.duration_ms = 120_000;
        }

        monitor.track_connection("new", client("10.0.0.2")).unwrap();
        monitor.end_connection("new", "transport close").unwrap();

        let snapshot = monitor.history_snapshot("new").unwrap();
        assert_eq!(snapshot.recent_failures, 1);
        assert!(snapshot.longest_connection_ms < 120_000);
        // still retained, only outside the failure window
        assert!(monitor.get_connection_analytics("old").is_some());
    }

    #[test]
    fn test_retained_tail_is_bounded() {
        let monitor = HealthMonitor::new(HealthConfig {
            retained_limit: 2,
            ..HealthConfig::default()
        });
        for id in ["a", "b", "c"] {
            monitor.track_connection(id, client("10.0.0.2")).unwrap();
            monitor.end_connection(id, "transport close");
        }

        assert!(monitor.get_connection_analytics("a").is_none());
        assert!(monitor.get_connection_analytics("b").is_some());
        assert!(monitor.get_connection_analytics("c").is_some());
        assert_eq!(monitor.get_global_analytics().recently_ended, 2);
    }

    #[test]
    fn test_global_analytics() {
        let monitor = monitor();
        monitor
            .track_connection("a", ClientInfo::new("android", "websocket"))
            .unwrap();
        monitor
            .track_connection("b", ClientInfo::new("ios", "polling"))
            .unwrap();
        monitor.record_latency("a", 20.0);
        monitor.record_latency("b", 40.0);
        monitor.record_error("b", ErrorKind::Timeout, "pong late");
        monitor.record_transport_upgrade("b", "polling", "websocket");

        let global = monitor.get_global_analytics();
        assert_eq!(global.active_connections, 2);
        assert_eq!(global.total_tracked, 2);
        assert_eq!(global.total_errors, 1);
        assert_eq!(global.total_transport_upgrades, 1);
        assert!((global.average_latency_ms - 30.0).abs() < 1e-9);
        assert_eq!(global.connections_by_transport.get("websocket"), Some(&2));
        assert_eq!(global.stable, 1);
    }
}
