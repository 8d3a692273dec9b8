//! Session listener for mobile peers
//!
//! Peers speak newline-delimited JSON [`PeerMessage`]s. Each accepted socket
//! gets a fresh connection id and is reported to the lifecycle worker; the
//! host pings on a fixed interval and times the pongs. Reconnection advice
//! produced after a disconnect is held per peer address and handed over
//! once, on that peer's next connection.

use bytes::BytesMut;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{MAX_PEER_LINE_BYTES, MAX_PENDING_ADVICE};
use crate::error::{ProtocolError, Result};
use crate::events::ReconnectionEvent;
use crate::health::{ClientInfo, ErrorKind};
use crate::lifecycle::{LifecycleEvent, LifecycleSender};
use crate::protocol::PeerMessage;
use crate::reconnect::ReconnectionRecommendation;

const REASON_CLIENT: &str = "client namespace disconnect";
const REASON_TRANSPORT_CLOSE: &str = "transport close";
const REASON_TRANSPORT_ERROR: &str = "transport error";
const REASON_SHUTDOWN: &str = "server shutting down";

/// How long an ended connection's address is kept waiting for its advice
const PEER_ADVICE_GRACE: Duration = Duration::from_secs(30);

/// Newline-delimited UTF-8 frames with a length cap.
///
/// Oversized and non-UTF-8 lines are yielded as protocol errors instead of
/// failing the stream, so one bad line does not end the session.
pub struct PeerLineCodec {
    inner: LinesCodec,
}

impl PeerLineCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn map(
        result: std::result::Result<Option<String>, LinesCodecError>,
    ) -> io::Result<Option<std::result::Result<String, ProtocolError>>> {
        match result {
            Ok(line) => Ok(line.map(Ok)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(
                ProtocolError::Malformed("line exceeds the length limit".to_string()),
            ))),
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(
                Err(ProtocolError::Malformed("line is not valid UTF-8".to_string())),
            )),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for PeerLineCodec {
    type Item = std::result::Result<String, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        Self::map(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        Self::map(self.inner.decode_eof(buf))
    }
}

struct PeerEntry {
    ip: IpAddr,
    ended_at: Option<Instant>,
}

struct PendingAdvice {
    recommendation: ReconnectionRecommendation,
    filed_at: Instant,
}

pub struct SessionServer {
    lifecycle: LifecycleSender,
    ping_interval: Duration,
    /// Connection id to peer address. Dropped once advice is filed or the
    /// grace period after the disconnect runs out.
    peers: DashMap<String, PeerEntry>,
    advice: DashMap<IpAddr, PendingAdvice>,
}

impl SessionServer {
    pub fn new(lifecycle: LifecycleSender, ping_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            ping_interval,
            peers: DashMap::new(),
            advice: DashMap::new(),
        })
    }

    /// Advice waiting for the next connection from `ip`
    pub fn pending_advice(&self, ip: IpAddr) -> Option<ReconnectionRecommendation> {
        self.advice.get(&ip).map(|entry| entry.recommendation.clone())
    }

    /// Hold `recommendation` for `ip`, evicting the oldest entry at capacity
    fn file_advice(&self, ip: IpAddr, recommendation: ReconnectionRecommendation) {
        if !self.advice.contains_key(&ip) && self.advice.len() >= MAX_PENDING_ADVICE {
            let oldest = self
                .advice
                .iter()
                .min_by_key(|entry| entry.filed_at)
                .map(|entry| *entry.key());
            if let Some(oldest) = oldest {
                self.advice.remove(&oldest);
            }
        }
        self.advice.insert(
            ip,
            PendingAdvice {
                recommendation,
                filed_at: Instant::now(),
            },
        );
    }

    fn mark_ended(&self, id: &str) {
        if let Some(mut entry) = self.peers.get_mut(id) {
            entry.ended_at = Some(Instant::now());
        }
    }

    /// Forget ended connections whose advice never arrived
    fn prune_peers(&self, now: Instant) {
        self.peers.retain(|_, entry| match entry.ended_at {
            Some(ended) => now.saturating_duration_since(ended) < PEER_ADVICE_GRACE,
            None => true,
        });
    }

    /// File reconnection advice under the peer address it belongs to
    pub fn spawn_advice_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<ReconnectionEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(ReconnectionEvent::ReconnectionRecommendation {
                        connection_id,
                        recommendation,
                        ..
                    }) => {
                        if let Some((_, entry)) = server.peers.remove(&connection_id) {
                            server.file_advice(entry.ip, recommendation);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Advice listener lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Accept peers until `token` is cancelled
    pub async fn run(self: Arc<Self>, listener: TcpListener, token: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Session listener on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let server = Arc::clone(&self);
                    let token = token.child_token();
                    tokio::spawn(async move { server.serve_peer(stream, remote, token).await });
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }

        info!("Session listener stopped");
        Ok(())
    }

    async fn serve_peer(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, token: CancellationToken) {
        let id = Uuid::new_v4().to_string();
        let _ = stream.set_nodelay(true);
        let (read, mut write) = stream.into_split();
        let mut frames = FramedRead::new(read, PeerLineCodec::new(MAX_PEER_LINE_BYTES));

        let client_info = ClientInfo::new("unknown", "socket").with_remote_address(remote.ip().to_string());
        if self
            .lifecycle
            .send(LifecycleEvent::Connected {
                connection_id: id.clone(),
                client_info,
            })
            .await
            .is_err()
        {
            return;
        }
        self.peers.insert(
            id.clone(),
            PeerEntry {
                ip: remote.ip(),
                ended_at: None,
            },
        );
        info!("Peer {} connected as {}", remote, id);

        if let Some((_, pending)) = self.advice.remove(&remote.ip()) {
            let advice = PeerMessage::ReconnectAdvice {
                recommendation: pending.recommendation,
            };
            if let Err(e) = send_message(&mut write, &advice).await {
                debug!("Could not deliver advice to {}: {}", id, e);
            }
        }

        let mut ticker = tokio::time::interval(self.ping_interval);
        let mut next_ping = 0u64;

        let reason = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break REASON_SHUTDOWN,
                frame = frames.next() => match frame {
                    Some(Ok(Ok(line))) => {
                        if self.handle_line(&id, &line).await {
                            break REASON_CLIENT;
                        }
                    }
                    Some(Ok(Err(e))) => {
                        self.report_error(&id, ErrorKind::Protocol, e.to_string()).await;
                    }
                    None => break REASON_TRANSPORT_CLOSE,
                    Some(Err(e)) => {
                        self.report_error(&id, ErrorKind::Transport, e.to_string()).await;
                        break REASON_TRANSPORT_ERROR;
                    }
                },
                _ = ticker.tick() => {
                    let ping = PeerMessage::ping(next_ping, Utc::now().timestamp_millis());
                    next_ping += 1;
                    if let Err(e) = send_message(&mut write, &ping).await {
                        self.report_error(&id, ErrorKind::Transport, e.to_string()).await;
                        break REASON_TRANSPORT_ERROR;
                    }
                }
            }
        };

        info!("Peer {} ({}) disconnected: {}", remote, id, reason);
        let _ = self
            .lifecycle
            .send(LifecycleEvent::Disconnected {
                connection_id: id.clone(),
                reason: reason.to_string(),
            })
            .await;
        self.mark_ended(&id);
        self.prune_peers(Instant::now());
    }

    /// Returns true when the peer said goodbye
    async fn handle_line(&self, id: &str, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }

        let message = match PeerMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                self.report_error(id, ErrorKind::Protocol, e.to_string()).await;
                return false;
            }
        };
        if message == PeerMessage::Bye {
            return true;
        }

        match message.to_lifecycle(id, Utc::now().timestamp_millis()) {
            Ok(Some(event)) => {
                let _ = self.lifecycle.send(event).await;
            }
            Ok(None) => {}
            Err(e) => self.report_error(id, ErrorKind::Protocol, e.to_string()).await,
        }
        false
    }

    async fn report_error(&self, id: &str, kind: ErrorKind, message: String) {
        let _ = self
            .lifecycle
            .send(LifecycleEvent::Error {
                connection_id: id.to_string(),
                kind,
                message,
            })
            .await;
    }
}

async fn send_message(write: &mut OwnedWriteHalf, message: &PeerMessage) -> Result<()> {
    let mut json = message.to_json()?;
    json.push('\n');
    write.write_all(json.as_bytes()).await?;
    Ok(())
}
