//! Events published to external consumers (UI, transport layer, automation)
//!
//! Each component owns one [`EventChannel`] carrying a closed enum for its
//! category. Subscribers get their own `broadcast::Receiver`; a slow
//! subscriber lags and loses old events instead of blocking the publisher.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::devices::Device;
use crate::health::{ErrorRecord, HealthPrediction};
use crate::reconnect::{DisconnectionAnalysis, ReconnectionRecommendation};
use crate::transport::ConnectionState;

/// Device availability from the debug bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "device", rename_all = "camelCase")]
pub enum DeviceEvent {
    DeviceConnected(Device),
    DeviceDisconnected(Device),
}

impl DeviceEvent {
    pub fn device(&self) -> &Device {
        match self {
            DeviceEvent::DeviceConnected(device) | DeviceEvent::DeviceDisconnected(device) => device,
        }
    }
}

/// Per-connection health output
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HealthEvent {
    #[serde(rename_all = "camelCase")]
    HealthPrediction {
        connection_id: String,
        prediction: HealthPrediction,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionError {
        connection_id: String,
        error: ErrorRecord,
    },
}

/// Advice produced after a disconnect
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ReconnectionEvent {
    #[serde(rename_all = "camelCase")]
    ReconnectionRecommendation {
        connection_id: String,
        analysis: DisconnectionAnalysis,
        recommendation: ReconnectionRecommendation,
    },
}

/// Aggregate connection state changes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "state", rename_all = "camelCase")]
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionState),
}

/// Typed broadcast channel owned by a publishing component
#[derive(Debug)]
pub struct EventChannel<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventChannel<T> {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain everything currently queued on a receiver (tests and diagnostics)
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let channel: EventChannel<u32> = EventChannel::new();
        channel.emit(1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_drain_in_order() {
        let channel: EventChannel<u32> = EventChannel::with_capacity(8);
        let mut rx = channel.subscribe();
        channel.emit(1);
        channel.emit(2);
        channel.emit(3);

        assert_eq!(drain(&mut rx), vec![1, 2, 3]);
        assert!(drain(&mut rx).is_empty());
    }
}
