//! Error types for the connection resilience core

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// The caller cancelled the operation. Not a failure of the operation itself.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Debug bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Health monitor error: {0}")]
    Health(#[from] HealthError),

    #[error("Failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Scheduler is already running")]
    SchedulerAlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error is a caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Debug-bridge (device enumeration) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The bridge daemon or binary cannot be reached at all
    #[error("Debug bridge daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Bridge command failed: {0}")]
    CommandFailed(String),

    #[error("Unexpected bridge output: {0}")]
    InvalidOutput(String),
}

/// Transport-level errors (recoverable)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Handshake failed on {transport}: {reason}")]
    HandshakeFailed { transport: String, reason: String },

    #[error("No healthy transport available")]
    NoViableTransport,

    #[error("No endpoint configured for {0}")]
    NoEndpoint(String),

    #[error("Transport I/O failure: {0}")]
    Io(String),
}

/// Malformed or unexpected peer messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Health ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("Connection already tracked: {0}")]
    AlreadyTracked(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
