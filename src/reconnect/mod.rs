//! Disconnection analysis and reconnection recommendations

pub mod analysis;
pub mod manager;

pub use analysis::{
    analyze_disconnection_cause, recommend_reconnection, ConnectionHistorySnapshot,
    DisconnectCause, DisconnectReason, DisconnectionAnalysis, ReconnectionRecommendation,
    ReconnectionStrategy, Recoverability, Severity,
};
pub use manager::{ReconnectionManager, ReconnectionOutcome, ReconnectionStats};
