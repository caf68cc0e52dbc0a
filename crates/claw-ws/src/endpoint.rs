//! Endpoint orchestrator: outbound dials, listeners, HTTP upgrades and shutdown.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{Callbacks, EventAdapter};
use crate::config::EndpointConfig;
use crate::conn::Conn;
use crate::engine::TungsteniteEngine;
use crate::error::{CloseReason, WsError, WsResult};
use crate::registry::ConnectionRegistry;
use crate::transport::{ChannelContext, Engine, Listener};
use crate::upgrade::{self, Upgrading};

/// Body of the response `serve_http` sends once the endpoint is closed.
const SHUTDOWN_BODY: &str = "http: server shutdown";

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Accepting new connections.
    Running,
    /// Closed; new connections are refused.
    Closed,
}

enum ListenerSlot {
    /// Address reserved while the engine binds it.
    Binding,
    Active(Arc<dyn Listener>),
}

/// Builder for [`Endpoint`].
#[derive(Debug, Default)]
pub struct EndpointBuilder {
    config: EndpointConfig,
    engine: Option<Arc<dyn Engine>>,
    callbacks: Callbacks,
}

impl EndpointBuilder {
    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom engine. The endpoint shuts it down when it closes.
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Replace all callbacks.
    #[must_use]
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Set the connection-opened callback.
    #[must_use]
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn) + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_open(f);
        self
    }

    /// Set the data-received callback.
    #[must_use]
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_data(f);
        self
    }

    /// Set the connection-closed callback.
    #[must_use]
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, Option<&WsError>) + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_close(f);
        self
    }

    /// Build the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `WsError::Config` if the configuration is invalid.
    pub fn build(self) -> WsResult<Endpoint> {
        self.config.validate()?;

        let (engine, owns_engine) = match self.engine {
            Some(engine) => (engine, true),
            None => (TungsteniteEngine::shared() as Arc<dyn Engine>, false),
        };

        let cancel = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::with_close_timeout(
            self.config.close_timeout(),
        ));
        let adapter = Arc::new(EventAdapter::new(
            self.callbacks,
            Arc::clone(&registry),
            cancel.clone(),
        ));

        Ok(Endpoint {
            inner: Arc::new(EndpointInner {
                engine,
                owns_engine,
                config: Arc::new(self.config),
                cancel,
                listeners: Mutex::new(HashMap::new()),
                registry,
                adapter,
                close_lock: tokio::sync::Mutex::new(false),
            }),
        })
    }
}

/// A WebSocket endpoint.
///
/// One endpoint can dial any number of peers ([`open`](Self::open)), listen
/// on any number of addresses ([`listen`](Self::listen)) and accept upgrades
/// from an existing HTTP server ([`serve_http`](Self::serve_http)). Every
/// connection reports to the same callbacks and is closed by
/// [`close`](Self::close).
///
/// Cheap to clone; all clones refer to the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    engine: Arc<dyn Engine>,
    owns_engine: bool,
    config: Arc<EndpointConfig>,
    cancel: CancellationToken,
    listeners: Mutex<HashMap<String, ListenerSlot>>,
    registry: Arc<ConnectionRegistry>,
    adapter: Arc<EventAdapter>,
    /// Set once shutdown completed.
    close_lock: tokio::sync::Mutex<bool>,
}

impl Endpoint {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }

    fn context(&self) -> ChannelContext {
        ChannelContext {
            adapter: Arc::clone(&self.inner.adapter),
            cancel: self.inner.cancel.clone(),
            config: Arc::clone(&self.inner.config),
        }
    }

    fn ensure_running(&self) -> WsResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(WsError::EndpointClosed);
        }
        Ok(())
    }

    /// Dial `addr` and return the registered connection.
    ///
    /// `addr` is a `ws://` or `wss://` URL, or `host:port`.
    ///
    /// # Errors
    ///
    /// Returns `WsError::EndpointClosed` after close, or the dial or
    /// handshake error.
    pub async fn open(&self, addr: &str) -> WsResult<Conn> {
        self.ensure_running()?;
        let conn = self.inner.engine.connect(addr, self.context()).await?;
        debug!(addr = %addr, conn_id = %conn.id(), "Connection opened");
        Ok(conn)
    }

    /// Bind `addr` and accept connections until the endpoint closes.
    ///
    /// Blocks for the lifetime of the accept loop.
    ///
    /// # Errors
    ///
    /// Returns `WsError::AlreadyListening` if this endpoint already listens on
    /// `addr`, `WsError::EndpointClosed` after close, or the bind error.
    pub async fn listen(&self, addr: &str) -> WsResult<()> {
        self.ensure_running()?;
        {
            let mut listeners = self.inner.listeners.lock();
            if listeners.contains_key(addr) {
                return Err(WsError::AlreadyListening(addr.to_string()));
            }
            listeners.insert(addr.to_string(), ListenerSlot::Binding);
        }

        // close() may have drained the listener set before the reservation.
        if self.inner.cancel.is_cancelled() {
            self.release_reservation(addr);
            return Err(WsError::EndpointClosed);
        }

        let listener = match self.inner.engine.listen(addr, self.context()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.release_reservation(addr);
                return Err(e);
            }
        };

        let activated = {
            let mut listeners = self.inner.listeners.lock();
            if self.inner.cancel.is_cancelled() {
                listeners.remove(addr);
                false
            } else {
                listeners.insert(addr.to_string(), ListenerSlot::Active(Arc::clone(&listener)));
                true
            }
        };
        if !activated {
            close_listener(addr, listener.as_ref());
            return Err(WsError::EndpointClosed);
        }

        info!(addr = %addr, local = ?listener.local_addr(), "Endpoint listening");
        let result = listener.sync().await;

        // Whoever removes the slot closes the listener.
        let owned = {
            let mut listeners = self.inner.listeners.lock();
            let ours = matches!(
                listeners.get(addr),
                Some(ListenerSlot::Active(current)) if Arc::ptr_eq(current, &listener)
            );
            if ours {
                listeners.remove(addr);
            }
            ours
        };
        if owned {
            close_listener(addr, listener.as_ref());
        }

        debug!(addr = %addr, "Endpoint stopped listening");
        result
    }

    fn release_reservation(&self, addr: &str) {
        let mut listeners = self.inner.listeners.lock();
        if matches!(listeners.get(addr), Some(ListenerSlot::Binding)) {
            listeners.remove(addr);
        }
    }

    /// Bound socket address of the listener started for `addr`.
    #[must_use]
    pub fn listener_addr(&self, addr: &str) -> Option<SocketAddr> {
        match self.inner.listeners.lock().get(addr) {
            Some(ListenerSlot::Active(listener)) => listener.local_addr(),
            _ => None,
        }
    }

    /// Addresses with an active listener.
    #[must_use]
    pub fn listening(&self) -> Vec<String> {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, ListenerSlot::Active(_)))
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Close the endpoint, sending `1000 websocket shutdown` to every connection.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; listener close errors are logged.
    pub async fn close(&self) -> WsResult<()> {
        self.close_with(CloseReason::shutdown()).await
    }

    /// Close the endpoint with a custom close reason.
    ///
    /// Idempotent. Concurrent callers wait until the first one finished.
    ///
    /// # Errors
    ///
    /// Returns `WsError::InvalidCloseCode` if `reason.code` may not be sent
    /// in a close frame; the endpoint stays open. Listener close errors are
    /// logged.
    pub async fn close_with(&self, reason: CloseReason) -> WsResult<()> {
        if !reason.is_sendable() {
            return Err(WsError::InvalidCloseCode(reason.code));
        }

        let mut closed = self.inner.close_lock.lock().await;
        if *closed {
            return Ok(());
        }

        info!(reason = %reason, "Closing endpoint");
        self.inner.cancel.cancel();

        let listeners: Vec<_> = self.inner.listeners.lock().drain().collect();
        for (addr, slot) in listeners {
            if let ListenerSlot::Active(listener) = slot {
                close_listener(&addr, listener.as_ref());
            }
        }

        let count = self.inner.registry.close_all(Some(reason)).await;

        if self.inner.owns_engine {
            self.inner.engine.shutdown();
        }

        *closed = true;
        info!(connections = count, "Endpoint closed");
        Ok(())
    }

    /// Upgrade a request received by a `hyper` server.
    ///
    /// Returns the `101 Switching Protocols` response to send and a future
    /// that completes the upgrade after the response went out.
    ///
    /// # Errors
    ///
    /// Returns `WsError::EndpointClosed` after close, or `WsError::Handshake`
    /// if `req` is not a valid WebSocket upgrade.
    pub fn upgrade_http<B>(
        &self,
        req: &mut Request<B>,
    ) -> WsResult<(Response<Full<Bytes>>, Upgrading)> {
        self.ensure_running()?;
        upgrade::upgrade(req, self.context())
    }

    /// Answer a request received by a `hyper` server.
    ///
    /// Upgrades the connection in a background task. After close the
    /// request is refused with `406 Not Acceptable`, invalid upgrade requests
    /// with `400 Bad Request`.
    pub fn serve_http<B>(&self, mut req: Request<B>) -> Response<Full<Bytes>> {
        match self.upgrade_http(&mut req) {
            Ok((response, upgrading)) => {
                tokio::spawn(async move {
                    if let Err(e) = upgrading.await {
                        debug!(error = %e, "HTTP upgrade failed");
                    }
                });
                response
            }
            Err(WsError::EndpointClosed) => {
                plain_response(StatusCode::NOT_ACCEPTABLE, SHUTDOWN_BODY.to_string())
            }
            Err(e) => {
                debug!(error = %e, "Rejected upgrade request");
                plain_response(StatusCode::BAD_REQUEST, e.to_string())
            }
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EndpointState {
        if self.inner.cancel.is_cancelled() {
            EndpointState::Closed
        } else {
            EndpointState::Running
        }
    }

    /// Check if the endpoint has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// The endpoint configuration.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the live connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Conn> {
        self.inner.registry.snapshot()
    }

    /// The registry of live connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("state", &self.state())
            .field("engine", &self.inner.engine)
            .field("listening", &self.listening())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

fn close_listener(addr: &str, listener: &dyn Listener) {
    if let Err(e) = listener.close() {
        warn!(addr = %addr, error = %e, "Failed to close listener");
    }
}

fn plain_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
