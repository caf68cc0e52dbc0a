//! Bridge from transport lifecycle events to the user callbacks.

use std::fmt;
use std::sync::Arc;

use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::conn::Conn;
use crate::error::{WsError, WsResult, CLOSE_NO_STATUS};
use crate::registry::ConnectionRegistry;
use crate::transport::Disconnect;

/// Called once a connection is established and registered.
pub type OnOpenFn = dyn Fn(&Conn) + Send + Sync;

/// Called for every inbound message. The payload is only valid for the call.
pub type OnDataFn = dyn Fn(&Conn, &[u8]) + Send + Sync;

/// Called once a connection is gone. `None` means a clean local close.
pub type OnCloseFn = dyn Fn(&Conn, Option<&WsError>) + Send + Sync;

/// The three user callbacks of an endpoint.
///
/// Missing callbacks are no-ops.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_open: Option<Arc<OnOpenFn>>,
    on_data: Option<Arc<OnDataFn>>,
    on_close: Option<Arc<OnCloseFn>>,
}

impl Callbacks {
    /// Create an empty callback set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection-opened callback.
    #[must_use]
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Set the data-received callback.
    #[must_use]
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, &[u8]) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Set the connection-closed callback.
    #[must_use]
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, Option<&WsError>) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Routes lifecycle events of every connection of one endpoint.
///
/// Transports call the four event methods from the connection's own task,
/// in order: `activate`, any number of `data`, then `inactive`.
pub struct EventAdapter {
    callbacks: Callbacks,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl EventAdapter {
    /// Create an adapter that registers connections in `registry`.
    #[must_use]
    pub fn new(
        callbacks: Callbacks,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            callbacks,
            registry,
            cancel,
        }
    }

    /// The registry connections are tracked in.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Connection established: register it and call `on_open`.
    ///
    /// # Errors
    ///
    /// Returns `WsError::EndpointClosed` if the endpoint is shutting down. The
    /// connection is closed and not registered in that case.
    pub fn activate(&self, conn: &Conn) -> WsResult<()> {
        if self.cancel.is_cancelled() {
            conn.close();
            return Err(WsError::EndpointClosed);
        }

        self.registry.add(conn.clone());

        // close() may have drained the registry between the check and the add.
        if self.cancel.is_cancelled() {
            self.registry.remove(conn.id());
            conn.close();
            return Err(WsError::EndpointClosed);
        }

        match &self.callbacks.on_open {
            Some(on_open) => on_open(conn),
            None => trace!(conn_id = %conn.id(), "Connection active"),
        }
        Ok(())
    }

    /// Message received.
    pub fn data(&self, conn: &Conn, payload: &[u8]) {
        match &self.callbacks.on_data {
            Some(on_data) => on_data(conn, payload),
            None => trace!(conn_id = %conn.id(), len = payload.len(), "Message dropped"),
        }
    }

    /// Transport failure: close the connection with `err` as the cause.
    pub fn exception(&self, conn: &Conn, err: WsError) {
        debug!(conn_id = %conn.id(), error = %err, "Connection exception");
        conn.close_with(err);
    }

    /// Connection gone: unregister it and call `on_close`.
    pub fn inactive(&self, conn: &Conn, cause: Disconnect) {
        self.registry.remove(conn.id());
        conn.mark_closed();

        let err = normalize(cause);
        match &self.callbacks.on_close {
            Some(on_close) => on_close(conn, err.as_ref()),
            None => trace!(
                conn_id = %conn.id(),
                cause = ?err,
                "Connection inactive"
            ),
        }
    }
}

impl fmt::Debug for EventAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAdapter")
            .field("callbacks", &self.callbacks)
            .field("connections", &self.registry.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Convert a transport disconnect into the error reported to `on_close`.
///
/// Peer close frames become [`WsError::Closed`]; a frame without a status
/// code reports 1005. Other errors pass through unchanged.
#[must_use]
pub fn normalize(cause: Disconnect) -> Option<WsError> {
    match cause {
        Disconnect::Local => None,
        Disconnect::PeerClose(Some(frame)) => Some(closed_error(&frame)),
        Disconnect::PeerClose(None) => Some(WsError::Closed {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
        }),
        Disconnect::Error(err) => Some(err),
    }
}

fn closed_error(frame: &CloseFrame<'_>) -> WsError {
    WsError::Closed {
        code: u16::from(frame.code),
        reason: frame.reason.to_string(),
    }
}
