//! Transport handshakes
//!
//! The manager only switches transports through a [`TransportConnector`], so
//! "connected" is never reported before a handshake returned `Ok`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::transport::TransportKind;

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Transports this connector can attempt
    fn available(&self) -> Vec<TransportKind>;

    /// Establish the session on `kind` and return the round trip it took.
    /// Must stop early when `token` is cancelled.
    async fn handshake(
        &self,
        kind: TransportKind,
        token: CancellationToken,
    ) -> Result<Duration, TransportError>;
}

/// Handshakes by opening a TCP connection to the configured endpoint
pub struct TcpConnector {
    endpoints: BTreeMap<TransportKind, String>,
}

impl TcpConnector {
    pub fn new(endpoints: BTreeMap<TransportKind, String>) -> Self {
        Self { endpoints }
    }

    /// Endpoints whose name is a known transport; others are skipped
    pub fn from_config(config: &TransportConfig) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .filter_map(|(name, address)| match TransportKind::parse(name) {
                Some(kind) => Some((kind, address.clone())),
                None => {
                    debug!("Ignoring endpoint for unknown transport {}", name);
                    None
                }
            })
            .collect();
        Self::new(endpoints)
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    fn available(&self) -> Vec<TransportKind> {
        self.endpoints.keys().copied().collect()
    }

    async fn handshake(
        &self,
        kind: TransportKind,
        token: CancellationToken,
    ) -> Result<Duration, TransportError> {
        let address = self
            .endpoints
            .get(&kind)
            .ok_or_else(|| TransportError::NoEndpoint(kind.to_string()))?;

        let started = Instant::now();
        tokio::select! {
            _ = token.cancelled() => Err(TransportError::HandshakeFailed {
                transport: kind.to_string(),
                reason: "cancelled".to_string(),
            }),
            result = TcpStream::connect(address.as_str()) => match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    Ok(started.elapsed())
                }
                Err(e) => Err(TransportError::HandshakeFailed {
                    transport: kind.to_string(),
                    reason: format!("{}: {}", address, e),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let mut endpoints = BTreeMap::new();
        endpoints.insert(TransportKind::Socket, address);
        let connector = TcpConnector::new(endpoints);

        assert_eq!(connector.available(), vec![TransportKind::Socket]);
        assert!(connector
            .handshake(TransportKind::Socket, CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let connector = TcpConnector::new(BTreeMap::new());
        let result = connector
            .handshake(TransportKind::Relay, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::NoEndpoint(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        // bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut endpoints = BTreeMap::new();
        endpoints.insert(TransportKind::UsbForwarded, address);
        let connector = TcpConnector::new(endpoints);
        let result = connector
            .handshake(TransportKind::UsbForwarded, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed { .. })));
    }

    #[test]
    fn test_from_config_skips_unknown_names() {
        let mut config = TransportConfig::default();
        config
            .endpoints
            .insert("carrier_pigeon".to_string(), "127.0.0.1:1".to_string());
        config
            .endpoints
            .insert("relay".to_string(), "10.0.0.5:8765".to_string());
        let connector = TcpConnector::from_config(&config);
        assert_eq!(connector.available(), vec![TransportKind::Relay]);
    }
}
