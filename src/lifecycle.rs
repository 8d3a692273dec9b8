//! Connection lifecycle ingestion
//!
//! Transport code reports what happens to a connection as [`LifecycleEvent`]s.
//! A single worker applies them in arrival order, so events for one id are
//! always seen FIFO by the health ledger and the reconnection path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::LIFECYCLE_QUEUE_CAPACITY;
use crate::error::{Error, Result};
use crate::health::{ClientInfo, ErrorKind, HealthMonitor};
use crate::reconnect::ReconnectionManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connected {
        connection_id: String,
        client_info: ClientInfo,
    },
    Latency {
        connection_id: String,
        latency_ms: f64,
    },
    TransportUpgrade {
        connection_id: String,
        from: String,
        to: String,
    },
    Error {
        connection_id: String,
        kind: ErrorKind,
        message: String,
    },
    Disconnected {
        connection_id: String,
        reason: String,
    },
}

impl LifecycleEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            LifecycleEvent::Connected { connection_id, .. }
            | LifecycleEvent::Latency { connection_id, .. }
            | LifecycleEvent::TransportUpgrade { connection_id, .. }
            | LifecycleEvent::Error { connection_id, .. }
            | LifecycleEvent::Disconnected { connection_id, .. } => connection_id,
        }
    }
}

/// Feeds the lifecycle worker
#[derive(Clone)]
pub struct LifecycleSender {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl LifecycleSender {
    /// Queue an event, waiting for room if the worker is behind
    pub async fn send(&self, event: LifecycleEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Queue without waiting; the event is dropped if the queue is full
    pub fn try_send(&self, event: LifecycleEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Lifecycle queue full, dropping event for {}", event.connection_id());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Apply one event. Exposed for callers that already serialize their events.
pub fn apply(health: &HealthMonitor, reconnection: &ReconnectionManager, event: LifecycleEvent) {
    match event {
        LifecycleEvent::Connected {
            connection_id,
            client_info,
        } => {
            if let Err(e) = health.track_connection(&connection_id, client_info) {
                warn!("{}", e);
            }
        }
        LifecycleEvent::Latency {
            connection_id,
            latency_ms,
        } => {
            health.record_latency(&connection_id, latency_ms);
        }
        LifecycleEvent::TransportUpgrade {
            connection_id,
            from,
            to,
        } => {
            health.record_transport_upgrade(&connection_id, &from, &to);
        }
        LifecycleEvent::Error {
            connection_id,
            kind,
            message,
        } => {
            health.record_error(&connection_id, kind, message);
        }
        LifecycleEvent::Disconnected {
            connection_id,
            reason,
        } => {
            if health.end_connection(&connection_id, &reason).is_some() {
                reconnection.handle_disconnect(&connection_id, &reason);
            } else {
                debug!("Disconnect for untracked connection {}", connection_id);
            }
        }
    }
}

/// Start the worker. It stops when `token` is cancelled or every sender is dropped.
pub fn spawn(
    health: Arc<HealthMonitor>,
    reconnection: Arc<ReconnectionManager>,
    token: CancellationToken,
) -> (LifecycleSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(LIFECYCLE_QUEUE_CAPACITY);

    let handle = tokio::spawn(async move {
        info!("Lifecycle worker started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => apply(&health, &reconnection, event),
                    None => break,
                },
            }
        }
        info!("Lifecycle worker stopped");
    });

    (LifecycleSender { tx }, handle)
}
