//! End-to-end flows across the resilience components

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use audiolink_resilience::config::{
    DeviceTrackerConfig, HealthConfig, ReconnectionConfig, RetryConfig, TransportConfig,
};
use audiolink_resilience::devices::{
    BridgeStatus, DebugBridge, DeviceListing, DeviceTracker, ForwardRule,
};
use audiolink_resilience::error::{BridgeError, TransportError};
use audiolink_resilience::events::{drain, DeviceEvent, ReconnectionEvent, TransportEvent};
use audiolink_resilience::health::{ClientInfo, ErrorKind, HealthMonitor};
use audiolink_resilience::lifecycle::{self, LifecycleEvent};
use audiolink_resilience::reconnect::{
    analyze_disconnection_cause, ConnectionHistorySnapshot, DisconnectCause,
    ReconnectionManager, ReconnectionStrategy, Recoverability, Severity,
};
use audiolink_resilience::retry::{delay, retry, RetryError, RetryOptions};
use audiolink_resilience::transport::{
    TransportConnector, TransportKind, TransportManager, TransportMetrics,
};
use audiolink_resilience::Error;

struct ScriptedBridge {
    scans: Mutex<VecDeque<Vec<DeviceListing>>>,
}

#[async_trait]
impl DebugBridge for ScriptedBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceListing>, BridgeError> {
        Ok(self.scans.lock().pop_front().unwrap_or_default())
    }

    async fn add_port_forward(&self, _serial: &str, _rule: ForwardRule) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn remove_port_forward(&self, _serial: &str, _rule: ForwardRule) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[tokio::test]
async fn device_appearing_then_going_offline() {
    let scans = vec![
        vec![],
        vec![DeviceListing::new("X1", BridgeStatus::Device)],
        vec![DeviceListing::new("X1", BridgeStatus::Device)],
        vec![DeviceListing::new("X1", BridgeStatus::Offline)],
    ];
    let bridge = Arc::new(ScriptedBridge {
        scans: Mutex::new(scans.into_iter().collect()),
    });
    let tracker = DeviceTracker::new(bridge, DeviceTrackerConfig::default());
    let mut rx = tracker.subscribe();

    for _ in 0..4 {
        tracker.poll_once().await.unwrap();
    }

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], DeviceEvent::DeviceConnected(d) if d.serial == "X1"));
    assert!(matches!(&events[1], DeviceEvent::DeviceDisconnected(d) if d.serial == "X1"));
    assert!(tracker.forwarded_serials().is_empty());
    assert!(tracker.session("X1").is_none());
}

#[tokio::test]
async fn transport_error_disconnect_recommends_backoff() {
    let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
    let reconnection = Arc::new(ReconnectionManager::new(
        ReconnectionConfig::default(),
        RetryConfig::default(),
        health.clone(),
    ));
    let mut advice = reconnection.subscribe();
    let (tx, worker) = lifecycle::spawn(health.clone(), reconnection.clone(), CancellationToken::new());

    tx.send(LifecycleEvent::Connected {
        connection_id: "A".to_string(),
        client_info: ClientInfo::new("android", "websocket").with_remote_address("192.168.1.40"),
    })
    .await
    .unwrap();
    for latency in [20.0, 25.0, 30.0] {
        tx.send(LifecycleEvent::Latency {
            connection_id: "A".to_string(),
            latency_ms: latency,
        })
        .await
        .unwrap();
    }
    tx.send(LifecycleEvent::Error {
        connection_id: "A".to_string(),
        kind: ErrorKind::Transport,
        message: "websocket write failed".to_string(),
    })
    .await
    .unwrap();
    tx.send(LifecycleEvent::Disconnected {
        connection_id: "A".to_string(),
        reason: "transport error".to_string(),
    })
    .await
    .unwrap();
    drop(tx);
    worker.await.unwrap();

    let events = drain(&mut advice);
    assert_eq!(events.len(), 1);
    let ReconnectionEvent::ReconnectionRecommendation {
        connection_id,
        analysis,
        recommendation,
    } = &events[0];
    assert_eq!(connection_id, "A");
    assert_eq!(analysis.history.recent_failures, 1);
    assert_eq!(analysis.cause, DisconnectCause::TransportDegradation);
    assert_eq!(analysis.severity, Severity::Medium);
    assert_eq!(recommendation.strategy, ReconnectionStrategy::ExponentialBackoff);
    assert!(recommendation.estimated_delay_ms > 0);

    let summary = health.get_connection_analytics("A").unwrap();
    assert!(!summary.active);
    assert!((summary.prediction.avg_latency_ms - 25.0).abs() < 1e-9);
}

#[test]
fn repeated_failures_always_mean_unstable_network() {
    let config = ReconnectionConfig::default();
    for reason in ["transport error", "transport close", "ping timeout", "???"] {
        for longest in [0, 5_000, 3_600_000] {
            let history = ConnectionHistorySnapshot {
                recent_failures: 5,
                longest_connection_ms: longest,
                network_type: "polling".to_string(),
                transport_upgrades: 4,
                avg_latency_ms: 800.0,
                error_rate: 0.0,
            };
            let analysis = analyze_disconnection_cause("c", reason, &history, &config);
            assert_eq!(analysis.cause, DisconnectCause::UnstableNetwork);
            assert_eq!(analysis.recoverability, Recoverability::Delayed);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn retry_backs_off_then_gives_up() {
    let token = CancellationToken::new();
    let options = RetryOptions {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        backoff_factor: 2.0,
        token,
    };

    let stamps = Arc::new(Mutex::new(Vec::new()));
    let recorded = stamps.clone();
    let result: Result<(), RetryError<String>> = retry(&options, move |attempt| {
        recorded.lock().push(Instant::now());
        async move { Err(format!("attempt {} failed", attempt)) }
    })
    .await;

    match result {
        Err(RetryError::Exhausted { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, "attempt 3 failed");
        }
        other => panic!("unexpected {:?}", other),
    }

    let stamps = stamps.lock();
    assert_eq!(stamps.len(), 3);
    assert_eq!(stamps[1] - stamps[0], Duration::from_millis(100));
    assert_eq!(stamps[2] - stamps[1], Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn cancelled_delay_never_succeeds() {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = delay(Duration::from_secs(10), &token).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

struct InstantConnector;

#[async_trait]
impl TransportConnector for InstantConnector {
    fn available(&self) -> Vec<TransportKind> {
        vec![TransportKind::Socket, TransportKind::UsbForwarded]
    }

    async fn handshake(
        &self,
        _kind: TransportKind,
        _token: CancellationToken,
    ) -> Result<Duration, TransportError> {
        tokio::task::yield_now().await;
        Ok(Duration::from_millis(8))
    }
}

#[tokio::test]
async fn simultaneous_healthy_transports_select_deterministically() {
    for _ in 0..10 {
        let manager = Arc::new(TransportManager::new(
            TransportConfig::default(),
            Arc::new(InstantConnector),
        ));
        manager.update_metrics(TransportKind::UsbForwarded, TransportMetrics::healthy(0.95, 30.0));
        manager.update_metrics(TransportKind::Socket, TransportMetrics::healthy(0.95, 30.0));
        let mut rx = manager.subscribe();

        let token = CancellationToken::new();
        let (a, b) = tokio::join!(manager.connect(&token), manager.connect(&token));
        assert_eq!(a.unwrap(), TransportKind::Socket);
        assert_eq!(b.unwrap(), TransportKind::Socket);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let TransportEvent::ConnectionStateChanged(state) = &events[0];
        assert_eq!(state.current_transport, Some(TransportKind::Socket));
        assert_eq!(state.total_connections, 1);
    }
}
