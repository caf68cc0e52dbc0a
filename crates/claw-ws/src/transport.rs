//! Capability interfaces between the endpoint core and the transport layer.
//!
//! The core (registry, adapter, endpoint) only talks to these traits. The
//! bundled [`TungsteniteEngine`](crate::engine::TungsteniteEngine) implements
//! them on top of `tokio-tungstenite`; tests implement them in memory.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;

use crate::adapter::EventAdapter;
use crate::config::EndpointConfig;
use crate::conn::Conn;
use crate::error::{WsError, WsResult};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate the next process-wide identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw identifier.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the handshake a connection was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound connection created by `open`.
    Client,
    /// Inbound connection accepted by a listener or an HTTP upgrade.
    Server,
}

impl Role {
    /// Check if this is a client connection.
    #[must_use]
    pub const fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }
}

/// Why a transport became inactive, as reported by the transport layer.
#[derive(Debug)]
pub enum Disconnect {
    /// Closed locally without an error.
    Local,
    /// The peer sent a close frame.
    PeerClose(Option<CloseFrame<'static>>),
    /// Read, write or protocol failure.
    Error(WsError),
}

/// One live connection as seen by the core.
///
/// Implementations must make `close` idempotent and must fail writes with
/// [`WsError::ConnectionClosed`] once closed.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Local socket address, if known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote socket address, if known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// HTTP headers received from the peer during the handshake.
    fn header(&self) -> &HeaderMap;

    /// Deadline for pending and future reads (`None` disables it).
    fn set_read_deadline(&self, deadline: Option<Instant>);

    /// Deadline for pending and future writes (`None` disables it).
    fn set_write_deadline(&self, deadline: Option<Instant>);

    /// Write one message and wait until the codec accepted it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed, the write deadline
    /// passes, or the codec rejects the payload.
    fn write<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, WsResult<()>>;

    /// Queue one message without waiting.
    ///
    /// # Errors
    ///
    /// Returns `WsError::Backpressure` if the write queue is full.
    fn try_write(&self, payload: &[u8]) -> WsResult<()>;

    /// Write a close frame with a code and reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be written.
    fn write_close<'a>(&'a self, code: u16, reason: &'a str) -> BoxFuture<'a, WsResult<()>>;

    /// Tear the connection down. `cause` is reported to the inactive event.
    fn close(&self, cause: Option<WsError>);
}

/// A bound accept loop.
pub trait Listener: Send + Sync + fmt::Debug {
    /// Address the listener is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Run the accept loop until the listener is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop fails fatally.
    fn sync(&self) -> BoxFuture<'_, WsResult<()>>;

    /// Stop accepting. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener could not be released.
    fn close(&self) -> WsResult<()>;
}

/// Everything a transport needs to attach a new connection to an endpoint.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Receives lifecycle events of every connection.
    pub adapter: Arc<EventAdapter>,
    /// Cancelled when the endpoint shuts down.
    pub cancel: CancellationToken,
    /// Options consumed by the engine.
    pub config: Arc<EndpointConfig>,
}

impl ChannelContext {
    /// Cancellation scope for a new connection: a child of the endpoint token.
    #[must_use]
    pub fn connection_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// Factory for outbound connections and listeners.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Dial `addr`, complete the handshake and attach the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial or handshake fails, or the endpoint is closed.
    fn connect<'a>(&'a self, addr: &'a str, ctx: ChannelContext) -> BoxFuture<'a, WsResult<Conn>>;

    /// Bind `addr`. Accepted connections are attached with `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    fn listen<'a>(
        &'a self,
        addr: &'a str,
        ctx: ChannelContext,
    ) -> BoxFuture<'a, WsResult<Arc<dyn Listener>>>;

    /// Release engine resources. Called when an endpoint that owns the engine closes.
    fn shutdown(&self) {}
}
