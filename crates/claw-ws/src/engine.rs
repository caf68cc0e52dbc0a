//! TCP engine built on `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::error::{WsError, WsResult};
use crate::pipeline::{self, Peer};
use crate::transport::{BoxFuture, ChannelContext, Engine, Listener, Role};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

static SHARED: Lazy<Arc<TungsteniteEngine>> = Lazy::new(|| Arc::new(TungsteniteEngine::new()));

/// Default engine: plain TCP listeners, `ws://` and `wss://` dialing.
#[derive(Debug, Default)]
pub struct TungsteniteEngine;

impl TungsteniteEngine {
    /// Create an engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Process-wide engine used when an endpoint is built without one.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::clone(&SHARED)
    }
}

impl Engine for TungsteniteEngine {
    fn connect<'a>(&'a self, addr: &'a str, ctx: ChannelContext) -> BoxFuture<'a, WsResult<Conn>> {
        Box::pin(connect(addr, ctx))
    }

    fn listen<'a>(
        &'a self,
        addr: &'a str,
        ctx: ChannelContext,
    ) -> BoxFuture<'a, WsResult<Arc<dyn Listener>>> {
        Box::pin(async move {
            let acceptor = TcpAcceptor::bind(addr, ctx).await?;
            Ok(Arc::new(acceptor) as Arc<dyn Listener>)
        })
    }
}

async fn connect(addr: &str, ctx: ChannelContext) -> WsResult<Conn> {
    if ctx.cancel.is_cancelled() {
        return Err(WsError::EndpointClosed);
    }

    let url = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    };
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| dial_failed(addr, e))?;
    request.headers_mut().extend(ctx.config.client_header_map()?);

    let dial = tokio_tungstenite::connect_async_with_config(
        request,
        Some(ctx.config.websocket_config()),
        ctx.config.no_delay,
    );

    let (ws, response) = tokio::select! {
        () = ctx.cancel.cancelled() => return Err(WsError::EndpointClosed),
        result = tokio::time::timeout(ctx.config.dial_timeout(), dial) => match result {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => return Err(dial_failed(addr, e)),
            Err(_) => return Err(dial_failed(addr, format!(
                "timed out after {:?}",
                ctx.config.dial_timeout()
            ))),
        },
    };

    let (local_addr, remote_addr) = match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => (stream.local_addr().ok(), stream.peer_addr().ok()),
        _ => (None, None),
    };
    let peer = Peer {
        local_addr,
        remote_addr,
        header: response.headers().clone(),
    };

    debug!(addr = %addr, remote = ?remote_addr, "WebSocket client connected");
    pipeline::spawn(ws, Role::Client, peer, &ctx)
}

fn dial_failed(addr: &str, reason: impl ToString) -> WsError {
    WsError::DialFailed {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

/// Turn a listen address into a bindable socket address string.
///
/// Accepts `host:port`, `:port` (all interfaces) and `ws://host:port/path`.
fn bind_target(addr: &str) -> String {
    let host = addr
        .strip_prefix("ws://")
        .or_else(|| addr.strip_prefix("wss://"))
        .unwrap_or(addr);
    let host = host.split('/').next().unwrap_or(host);
    if host.starts_with(':') {
        format!("0.0.0.0{host}")
    } else {
        host.to_string()
    }
}

/// Plain TCP accept loop performing server handshakes.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    ctx: ChannelContext,
}

impl TcpAcceptor {
    /// Bind `addr` with the configured backlog.
    ///
    /// # Errors
    ///
    /// Returns `WsError::BindFailed` if the address cannot be resolved or bound.
    pub async fn bind(addr: &str, ctx: ChannelContext) -> WsResult<Self> {
        let bind_failed = |source: std::io::Error| WsError::BindFailed {
            addr: addr.to_string(),
            source,
        };

        let target = bind_target(addr);
        let socket_addr = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(bind_failed)?
            .next()
            .ok_or_else(|| {
                bind_failed(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address resolved for {target}"),
                ))
            })?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_failed)?;
        socket.set_reuseaddr(true).map_err(bind_failed)?;
        socket.bind(socket_addr).map_err(bind_failed)?;
        let listener = socket.listen(ctx.config.backlog).map_err(bind_failed)?;
        let local_addr = listener.local_addr().map_err(bind_failed)?;

        info!(addr = %local_addr, "WebSocket listener bound");

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: CancellationToken::new(),
            ctx,
        })
    }
}

impl Listener for TcpAcceptor {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn sync(&self) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(async move {
            let Some(listener) = self.listener.lock().take() else {
                return Err(WsError::InvalidState(format!(
                    "accept loop for {} already ran",
                    self.local_addr
                )));
            };

            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    () = self.ctx.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "New connection");
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                match accept_connection(stream, peer_addr, ctx).await {
                                    Ok(()) => {}
                                    Err(WsError::EndpointClosed) => {
                                        debug!(peer = %peer_addr, "Handshake aborted by shutdown");
                                    }
                                    Err(e) => {
                                        warn!(peer = %peer_addr, error = %e, "WebSocket handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                }
            }

            info!(addr = %self.local_addr, "WebSocket listener stopped");
            Ok(())
        })
    }

    fn close(&self) -> WsResult<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ChannelContext,
) -> WsResult<()> {
    stream.set_nodelay(ctx.config.no_delay)?;
    let local_addr = stream.local_addr().ok();
    let extra_headers = ctx.config.server_header_map()?;

    let mut request_headers = HeaderMap::new();
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        request_headers = request.headers().clone();
        response.headers_mut().extend(extra_headers);
        Ok(response)
    };

    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(ctx.config.websocket_config()),
    );

    let ws = tokio::select! {
        () = ctx.cancel.cancelled() => return Err(WsError::EndpointClosed),
        result = tokio::time::timeout(ctx.config.handshake_timeout(), handshake) => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(WsError::Handshake(e.to_string())),
            Err(_) => return Err(WsError::Timeout(ctx.config.handshake_timeout())),
        },
    };

    let peer = Peer {
        local_addr,
        remote_addr: Some(peer_addr),
        header: request_headers,
    };
    pipeline::spawn(ws, Role::Server, peer, &ctx)?;
    Ok(())
}
