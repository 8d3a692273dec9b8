//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::devices::Device;
use crate::health::{ConnectionAnalytics, GlobalAnalytics};
use crate::reconnect::ReconnectionStats;
use crate::transport::{ConnectionState, TransportKind, TransportMetrics};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Host status
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub connection: ConnectionState,
    pub active_connections: usize,
    pub device_count: usize,
    pub bridge_failing: bool,
    pub uptime_seconds: u64,
}

/// Get aggregate connection state
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let status = SystemStatus {
        connection: state.transport.get_connection_state(),
        active_connections: state.health.active_count(),
        device_count: state.devices.devices().len(),
        bridge_failing: state.devices.is_bridge_failing(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Get devices known to the debug bridge
pub async fn get_devices(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Device>>> {
    Json(ApiResponse::ok(state.devices.devices()))
}

pub async fn get_transports(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<BTreeMap<TransportKind, TransportMetrics>>> {
    Json(ApiResponse::ok(state.transport.all_metrics()))
}

pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<GlobalAnalytics>> {
    Json(ApiResponse::ok(state.health.get_global_analytics()))
}

/// Analytics for one live or recently ended connection
pub async fn get_connection_analytics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ApiResponse<ConnectionAnalytics>>) {
    match state.health.get_connection_analytics(&id) {
        Some(analytics) => (StatusCode::OK, Json(ApiResponse::ok(analytics))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Unknown connection: {}", id))),
        ),
    }
}

pub async fn get_reconnection_stats(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<ReconnectionStats>> {
    Json(ApiResponse::ok(state.reconnection.get_reconnection_stats()))
}
