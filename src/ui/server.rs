//! Status API server

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::UiConfig;
use crate::devices::DeviceTracker;
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::reconnect::ReconnectionManager;
use crate::transport::TransportManager;
use crate::ui::handlers;

/// Components the handlers read from
pub struct AppState {
    pub devices: Arc<DeviceTracker>,
    pub health: Arc<HealthMonitor>,
    pub reconnection: Arc<ReconnectionManager>,
    pub transport: Arc<TransportManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        devices: Arc<DeviceTracker>,
        health: Arc<HealthMonitor>,
        reconnection: Arc<ReconnectionManager>,
        transport: Arc<TransportManager>,
    ) -> Self {
        Self {
            devices,
            health,
            reconnection,
            transport,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/state", get(handlers::get_state))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/transports", get(handlers::get_transports))
        .route("/api/analytics", get(handlers::get_analytics))
        .route("/api/analytics/:id", get(handlers::get_connection_analytics))
        .route("/api/reconnection", get(handlers::get_reconnection_stats))
        .layer(cors)
        .with_state(state)
}

pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid ui bind address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        info!("Status API listening on http://{}", addr);

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;

        info!("Status API stopped");
        Ok(())
    }

    pub fn start_background(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(token).await {
                error!("Status API failed: {}", e);
            }
        })
    }
}
