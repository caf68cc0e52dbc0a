//! Error types for WebSocket endpoints and connections.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::transport::ConnectionId;

/// Normal closure; the purpose of the connection has been fulfilled.
pub const CLOSE_NORMAL: u16 = 1000;

/// The endpoint is going away (server shutdown, browser navigation).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// The peer sent a close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Reason sent to every live connection when an endpoint shuts down.
pub const SHUTDOWN_REASON: &str = "websocket shutdown";

/// Numeric code and textual reason of a graceful close.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloseReason {
    /// Close status code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseReason {
    /// Create a close reason.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the code may be sent in a close frame.
    ///
    /// Codes below 1000, the reserved 1004, 1005, 1006 and 1015, the
    /// unassigned 1016..=2999 range and anything above 4999 are rejected.
    #[must_use]
    pub const fn is_sendable(&self) -> bool {
        is_sendable_close_code(self.code)
    }

    /// The reason used by [`Endpoint::close`](crate::Endpoint::close).
    #[must_use]
    pub fn shutdown() -> Self {
        Self::new(CLOSE_NORMAL, SHUTDOWN_REASON)
    }

    /// Convert into the error delivered to `on_close`.
    #[must_use]
    pub fn into_error(self) -> WsError {
        WsError::Closed {
            code: self.code,
            reason: self.reason,
        }
    }
}

/// Check if `code` may appear in a close frame on the wire.
#[must_use]
pub const fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// Errors that can occur on a WebSocket endpoint or connection.
#[derive(Debug, Error)]
pub enum WsError {
    /// The connection was closed with a close frame.
    #[error("ws closed: {code} {reason}")]
    Closed {
        /// Close status code.
        code: u16,
        /// Close reason text.
        reason: String,
    },

    /// I/O error on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error reported by the codec.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A deadline or timeout elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to bind a listener.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to establish an outbound connection.
    #[error("failed to connect to {addr}: {reason}")]
    DialFailed {
        /// Address that was dialed.
        addr: String,
        /// Why the dial or handshake failed.
        reason: String,
    },

    /// The HTTP request is not a valid WebSocket upgrade.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The endpoint is already listening on this address.
    #[error("already listening on {0}")]
    AlreadyListening(String),

    /// The endpoint has been closed.
    #[error("websocket endpoint closed")]
    EndpointClosed,

    /// Write attempted on a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The write queue of the connection is full.
    #[error("write queue full")]
    Backpressure,

    /// Payload cannot be sent with the configured message type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No connection handle was found after an HTTP upgrade.
    #[error("connection handle {0} not found after upgrade")]
    HandleMissing(ConnectionId),

    /// Close code that must not be sent in a close frame.
    #[error("close code {0} cannot be sent")]
    InvalidCloseCode(u16),

    /// Operation not allowed in the current state of the object.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WsError {
    /// Close code and reason, if this is a graceful close.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Closed { code, reason } => Some(CloseReason::new(*code, reason.clone())),
            _ => None,
        }
    }

    /// Check if this error was returned because the endpoint or connection is closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. } | Self::ConnectionClosed | Self::EndpointClosed
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::error::ProtocolError;
        use tokio_tungstenite::tungstenite::Error as TgError;

        match err {
            TgError::ConnectionClosed
            | TgError::AlreadyClosed
            | TgError::Protocol(ProtocolError::SendAfterClosing) => Self::ConnectionClosed,
            TgError::Io(e) => Self::Io(e),
            other => Self::WebSocket(other.to_string()),
        }
    }
}

impl From<hyper::Error> for WsError {
    fn from(err: hyper::Error) -> Self {
        Self::Handshake(err.to_string())
    }
}

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;
