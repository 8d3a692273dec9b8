//! # AudioLink Resilience
//!
//! Keeps the link between a mobile client and the desktop audio-routing host
//! usable across flaky Wi-Fi, transport upgrades, USB unplug events and host
//! restarts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           DESKTOP HOST                                │
//! │                                                                       │
//! │  ┌──────────────┐   deviceConnected / deviceDisconnected              │
//! │  │DeviceTracker │──────────────────────────────► automation           │
//! │  │ (debug bridge│   port forwarding per serial                        │
//! │  │   polling)   │                                                     │
//! │  └──────────────┘                                                     │
//! │                                                                       │
//! │  transport layer                                                      │
//! │   connect / ping / upgrade / error / disconnect                       │
//! │        │                                                              │
//! │        ▼  (single FIFO lifecycle worker)                              │
//! │  ┌──────────────┐  healthPrediction    ┌─────────────────────┐        │
//! │  │HealthMonitor │─────────────────────►│ subscribers (UI,    │        │
//! │  │ ping/error   │  connectionError     │ transport, logging) │        │
//! │  │  ledger      │                      └─────────────────────┘        │
//! │  └──────┬───────┘                                ▲                    │
//! │         │ history snapshot on disconnect         │                    │
//! │         ▼                                        │                    │
//! │  ┌────────────────────┐  reconnectionRecommendation                   │
//! │  │ReconnectionManager │──────────────────────────┘                    │
//! │  └────────────────────┘                                               │
//! │                                                                       │
//! │  per-transport metrics ──► ┌─────────────────┐ connectionStateChanged │
//! │  (socket, usb, relay)      │TransportManager │───────────────────────►│
//! │                            │ rank + failover │                        │
//! │                            └─────────────────┘                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every wait in the crate (delays, retries, polling, handshakes) takes an
//! explicit [`tokio_util::sync::CancellationToken`].

pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod protocol;
pub mod reconnect;
pub mod retry;
pub mod session;
pub mod transport;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Latency samples kept per connection
    pub const DEFAULT_PING_WINDOW: usize = 50;

    /// Error records kept per connection
    pub const DEFAULT_ERROR_WINDOW: usize = 50;

    /// Device enumeration polling interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

    /// Default retry attempts before giving up
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// First backoff delay
    pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

    /// Backoff ceiling
    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

    /// Longest accepted peer protocol line
    pub const MAX_PEER_LINE_BYTES: usize = 64 * 1024;

    /// Reconnection advice held for peers that have not come back yet
    pub const MAX_PENDING_ADVICE: usize = 256;

    /// Port the session protocol runs on (both ends of the USB forward)
    pub const DEFAULT_SESSION_PORT: u16 = 8765;

    /// Status API port
    pub const DEFAULT_HTTP_PORT: u16 = 8081;

    /// Capacity of each broadcast event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Capacity of the lifecycle event queue
    pub const LIFECYCLE_QUEUE_CAPACITY: usize = 1024;
}
