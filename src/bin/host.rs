//! AudioLink host daemon
//!
//! Tracks USB-attached devices, accepts peer sessions, keeps connection
//! health and transport state, and serves the read-only status API.
//!
//! Usage: `audiolink-host [config.toml]`

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiolink_resilience::{
    config::AppConfig,
    devices::{AdbBridge, DeviceTracker},
    events::{DeviceEvent, HealthEvent, ReconnectionEvent, TransportEvent},
    health::{HealthMonitor, Stability},
    lifecycle,
    reconnect::ReconnectionManager,
    retry::{retry, RetryOptions},
    session::SessionServer,
    transport::{TcpConnector, TransportManager},
    ui::{AppState, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AudioLink host");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load_from(Path::new(&path))
            .with_context(|| format!("loading config from {}", path))?,
        None => AppConfig::load().context("loading default config")?,
    };

    let root = CancellationToken::new();

    // Components
    let bridge = Arc::new(AdbBridge::new(
        config.devices.bridge_path.clone(),
        config.devices.command_timeout(),
    ));
    let devices = Arc::new(DeviceTracker::new(bridge, config.devices.clone()));
    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    let reconnection = Arc::new(ReconnectionManager::new(
        config.reconnection.clone(),
        config.retry.clone(),
        health.clone(),
    ));
    let transport = Arc::new(TransportManager::new(
        config.transport.clone(),
        Arc::new(TcpConnector::from_config(&config.transport)),
    ));

    spawn_event_logging(
        devices.subscribe(),
        health.subscribe(),
        reconnection.subscribe(),
        transport.subscribe(),
        root.child_token(),
    );

    let _polling = devices.start_polling(&root)?;
    tracing::info!(
        "Device polling every {}ms via {}",
        config.devices.poll_interval_ms,
        config.devices.bridge_path
    );

    let (lifecycle_tx, lifecycle_worker) =
        lifecycle::spawn(health.clone(), reconnection.clone(), root.child_token());

    let _probing = transport.start_probing(&root)?;

    // Initial transport connection, retried with backoff
    {
        let transport = transport.clone();
        let options = RetryOptions::from_config(&config.retry, root.child_token());
        tokio::spawn(async move {
            let result = retry(&options, |_| {
                let transport = transport.clone();
                let token = options.token.clone();
                async move { transport.connect(&token).await }
            })
            .await;
            match result {
                Ok(kind) => tracing::info!("Transport ready on {}", kind),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!("No transport available: {}", e),
            }
        });
    }

    // Peer sessions
    if config.session.enabled {
        let addr = format!("{}:{}", config.session.bind_address, config.session.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding session listener on {}", addr))?;
        let server = SessionServer::new(lifecycle_tx.clone(), config.session.ping_interval());
        server.spawn_advice_listener(reconnection.subscribe(), root.child_token());

        let token = root.child_token();
        tokio::spawn(async move {
            if let Err(e) = server.run(listener, token).await {
                tracing::error!("Session listener failed: {}", e);
            }
        });
    }
    drop(lifecycle_tx);

    // Status API
    if config.ui.enabled {
        let state = Arc::new(AppState::new(
            devices.clone(),
            health.clone(),
            reconnection.clone(),
            transport.clone(),
        ));
        let _web_handle = WebServer::new(config.ui.clone(), state).start_background(root.child_token());
        tracing::info!(
            "Status API available at http://{}:{}/api/state",
            config.ui.bind_address,
            config.ui.http_port
        );
    }

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    root.cancel();
    let _ = lifecycle_worker.await;

    Ok(())
}

fn spawn_event_logging(
    mut device_rx: broadcast::Receiver<DeviceEvent>,
    mut health_rx: broadcast::Receiver<HealthEvent>,
    mut reconnection_rx: broadcast::Receiver<ReconnectionEvent>,
    mut transport_rx: broadcast::Receiver<TransportEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Ok(event) = device_rx.recv() => match event {
                    DeviceEvent::DeviceConnected(device) => {
                        tracing::info!("Device {} connected ({:?})", device.serial, device.model)
                    }
                    DeviceEvent::DeviceDisconnected(device) => {
                        tracing::info!("Device {} disconnected ({:?})", device.serial, device.state)
                    }
                },
                Ok(event) = health_rx.recv() => match event {
                    HealthEvent::HealthPrediction { connection_id, prediction } => {
                        if prediction.predicted_stability == Stability::Stable {
                            tracing::debug!(
                                "{}: stable, {:.1}ms",
                                connection_id,
                                prediction.avg_latency_ms
                            );
                        } else {
                            tracing::info!(
                                "{}: {:?}, {:.1}ms, risks {:?}",
                                connection_id,
                                prediction.predicted_stability,
                                prediction.avg_latency_ms,
                                prediction.risk_factors
                            );
                        }
                    }
                    HealthEvent::ConnectionError { connection_id, error } => {
                        tracing::warn!("{}: {} error: {}", connection_id, error.kind, error.message)
                    }
                },
                Ok(event) = reconnection_rx.recv() => {
                    let ReconnectionEvent::ReconnectionRecommendation { connection_id, recommendation, .. } = event;
                    tracing::info!(
                        "{}: advise {} after {}ms (max {} attempts)",
                        connection_id,
                        recommendation.strategy.as_str(),
                        recommendation.estimated_delay_ms,
                        recommendation.max_attempts
                    );
                },
                Ok(event) = transport_rx.recv() => {
                    let TransportEvent::ConnectionStateChanged(state) = event;
                    tracing::info!(
                        "Connection state: connected={} transport={:?} quality={:?} failovers={}",
                        state.is_connected,
                        state.current_transport,
                        state.connection_quality,
                        state.failover_count
                    );
                },
                else => break,
            }
        }
    });
}
