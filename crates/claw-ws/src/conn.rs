//! Connection handle handed to user callbacks.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{is_sendable_close_code, WsError, WsResult};
use crate::transport::{ConnectionId, Role, Transport};

type Userdata = Arc<dyn Any + Send + Sync>;

/// A WebSocket connection.
///
/// Cheap to clone; all clones refer to the same connection. A handle stays
/// usable for inspection after the connection closed (for example inside
/// `on_close`), but writes fail with [`WsError::ConnectionClosed`].
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: ConnectionId,
    role: Role,
    transport: Arc<dyn Transport>,
    context: CancellationToken,
    closed: AtomicBool,
    userdata: Mutex<Option<Userdata>>,
}

impl Conn {
    /// Wrap a transport in a connection handle with its own cancellation scope.
    #[must_use]
    pub fn new(id: ConnectionId, role: Role, transport: Arc<dyn Transport>) -> Self {
        Self::with_context(id, role, transport, CancellationToken::new())
    }

    /// Wrap a transport in a connection handle scoped by `context`.
    ///
    /// `context` is usually a child of the endpoint token, see
    /// [`ChannelContext::connection_token`](crate::ChannelContext::connection_token).
    #[must_use]
    pub fn with_context(
        id: ConnectionId,
        role: Role,
        transport: Arc<dyn Transport>,
        context: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id,
                role,
                transport,
                context,
                closed: AtomicBool::new(false),
                userdata: Mutex::new(None),
            }),
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Get the side of the handshake this connection was created on.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Cancellation scope of the connection.
    ///
    /// Cancelled when the connection closes or its endpoint shuts down, so
    /// tasks working on behalf of the connection can stop with it.
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.inner.context.clone()
    }

    /// Local network address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Remote network address.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.remote_addr()
    }

    /// HTTP headers of the handshake request.
    #[must_use]
    pub fn header(&self) -> &HeaderMap {
        self.inner.transport.header()
    }

    /// Set both the read and write deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the deadline for pending and future reads.
    ///
    /// When it passes, the connection is closed with [`WsError::Timeout`].
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.transport.set_read_deadline(deadline);
    }

    /// Set the deadline for pending and future writes.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.transport.set_write_deadline(deadline);
    }

    /// Write a message and wait until it is handed to the socket.
    ///
    /// # Errors
    ///
    /// Returns `WsError::ConnectionClosed` after close, `WsError::Timeout` if
    /// the write deadline passes, or the codec error.
    pub async fn write(&self, message: &[u8]) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::ConnectionClosed);
        }
        self.inner.transport.write(message).await
    }

    /// Queue a message without waiting.
    ///
    /// Usable from the synchronous callbacks.
    ///
    /// # Errors
    ///
    /// Returns `WsError::ConnectionClosed` after close or
    /// `WsError::Backpressure` if the write queue is full.
    pub fn send(&self, message: &[u8]) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::ConnectionClosed);
        }
        self.inner.transport.try_write(message)
    }

    /// Write a close frame with a code and reason.
    ///
    /// The connection stays open until the peer answers or [`close`](Self::close)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns `WsError::InvalidCloseCode` for reserved codes such as 1005,
    /// or an error if the frame could not be written.
    pub async fn write_close(&self, code: u16, reason: &str) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::ConnectionClosed);
        }
        if !is_sendable_close_code(code) {
            return Err(WsError::InvalidCloseCode(code));
        }
        self.inner.transport.write_close(code, reason).await
    }

    /// Close the connection.
    ///
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.close_with_cause(None)
    }

    /// Close the connection, reporting `cause` to `on_close`.
    pub(crate) fn close_with(&self, cause: WsError) -> bool {
        self.close_with_cause(Some(cause))
    }

    fn close_with_cause(&self, cause: Option<WsError>) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!(conn_id = %self.inner.id, "Closing connection");
        self.inner.transport.close(cause);
        self.inner.context.cancel();
        true
    }

    /// Record that the transport is gone without closing it again.
    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.context.cancel();
    }

    /// Check if the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the user data.
    #[must_use]
    pub fn userdata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.userdata.lock().clone()
    }

    /// Get the user data if it has type `T`.
    #[must_use]
    pub fn userdata_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.userdata().and_then(|data| data.downcast::<T>().ok())
    }

    /// Set the user data, replacing any previous value.
    pub fn set_userdata<T: Any + Send + Sync>(&self, userdata: T) {
        *self.inner.userdata.lock() = Some(Arc::new(userdata));
    }

    /// Remove and return the user data.
    pub fn take_userdata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.userdata.lock().take()
    }

    /// Check if two handles refer to the same connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport that records what the core asked it to do.

    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::transport::BoxFuture;

    /// Transport that records writes, close frames and closes.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) header: HeaderMap,
        pub(crate) writes: Mutex<Vec<Vec<u8>>>,
        pub(crate) close_frames: Mutex<Vec<(u16, String)>>,
        pub(crate) closes: AtomicUsize,
        pub(crate) causes: Mutex<Vec<Option<String>>>,
        pub(crate) fail_close_frames: AtomicBool,
        pub(crate) read_deadline: Mutex<Option<Instant>>,
        pub(crate) write_deadline: Mutex<Option<Instant>>,
    }

    impl RecordingTransport {
        pub(crate) fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl Transport for RecordingTransport {
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            Some(SocketAddr::from(([127, 0, 0, 1], 9001)))
        }

        fn header(&self) -> &HeaderMap {
            &self.header
        }

        fn set_read_deadline(&self, deadline: Option<Instant>) {
            *self.read_deadline.lock() = deadline;
        }

        fn set_write_deadline(&self, deadline: Option<Instant>) {
            *self.write_deadline.lock() = deadline;
        }

        fn write<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, WsResult<()>> {
            Box::pin(async move { self.try_write(payload) })
        }

        fn try_write(&self, payload: &[u8]) -> WsResult<()> {
            if self.close_count() > 0 {
                return Err(WsError::ConnectionClosed);
            }
            self.writes.lock().push(payload.to_vec());
            Ok(())
        }

        fn write_close<'a>(&'a self, code: u16, reason: &'a str) -> BoxFuture<'a, WsResult<()>> {
            Box::pin(async move {
                if self.fail_close_frames.load(Ordering::SeqCst) {
                    return Err(WsError::ConnectionClosed);
                }
                self.close_frames.lock().push((code, reason.to_string()));
                Ok(())
            })
        }

        fn close(&self, cause: Option<WsError>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.causes.lock().push(cause.map(|e| e.to_string()));
        }
    }

    /// Create a server-side handle backed by a recording transport.
    pub(crate) fn recording_conn() -> (Conn, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let conn = Conn::new(ConnectionId::next(), Role::Server, transport.clone());
        (conn, transport)
    }
}
