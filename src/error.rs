//! Error taxonomy for the realtime client.
//!
//! Only `AuthExpired`, `NotConnected`, `Closed` and write failures of a
//! user-requested send ever reach callers. Everything else is logged and
//! handled inside the client loop.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors produced by the realtime transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// Transport-level failure. Recoverable through a scheduled reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame could not be decoded. The frame is dropped.
    #[error("decode error: {0}")]
    Decode(String),

    /// The broker rejected a subscription.
    #[error("subscription to `{topic}` rejected: {reason}")]
    Subscription { topic: String, reason: String },

    /// The credential was rejected during the handshake. Never retried.
    #[error("authentication expired")]
    AuthExpired,

    /// An outbound send was requested while no connection is live.
    #[error("not connected")]
    NotConnected,

    /// The client loop has shut down.
    #[error("realtime client closed")]
    Closed,
}

impl RealtimeError {
    /// Whether the transport should schedule a reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RealtimeError::Connection(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Decode(err.to_string())
    }
}
