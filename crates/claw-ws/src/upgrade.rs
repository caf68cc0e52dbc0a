//! Server-side upgrade of an HTTP/1.1 request served by `hyper`.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::conn::Conn;
use crate::error::{WsError, WsResult};
use crate::pipeline::{self, Peer};
use crate::transport::{BoxFuture, ChannelContext, Role};

const WEBSOCKET_VERSION: &str = "13";

/// Completes an accepted upgrade once the `101` response has been sent.
///
/// Resolves to the registered connection handle.
#[must_use = "the connection is only established when this future is driven"]
pub struct Upgrading {
    inner: BoxFuture<'static, WsResult<Conn>>,
}

impl Future for Upgrading {
    type Output = WsResult<Conn>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for Upgrading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrading").finish_non_exhaustive()
    }
}

/// Check that `req` is a valid WebSocket upgrade and return the client key.
fn validate<B>(req: &Request<B>) -> WsResult<&HeaderValue> {
    if req.method() != Method::GET {
        return Err(WsError::Handshake(format!(
            "upgrade request method must be GET, got {}",
            req.method()
        )));
    }

    let headers = req.headers();
    let has_upgrade_token = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !has_upgrade_token {
        return Err(WsError::Handshake(
            "missing 'upgrade' token in Connection header".to_string(),
        ));
    }

    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Err(WsError::Handshake(
            "Upgrade header must be 'websocket'".to_string(),
        ));
    }

    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(HeaderValue::as_bytes)
        != Some(WEBSOCKET_VERSION.as_bytes())
    {
        return Err(WsError::Handshake(format!(
            "unsupported Sec-WebSocket-Version, expected {WEBSOCKET_VERSION}"
        )));
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or_else(|| WsError::Handshake("missing Sec-WebSocket-Key header".to_string()))
}

/// Validate `req`, build the `101 Switching Protocols` response and prepare
/// the connection.
///
/// Takes the hyper upgrade handle out of the request extensions, so it can
/// only succeed once per request.
pub(crate) fn upgrade<B>(
    req: &mut Request<B>,
    ctx: ChannelContext,
) -> WsResult<(Response<Full<Bytes>>, Upgrading)> {
    let accept_key = derive_accept_key(validate(req)?.as_bytes());
    let extra_headers = ctx.config.server_header_map()?;

    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| WsError::Handshake("connection does not support upgrades".to_string()))?;
    let remote_addr = req.extensions().get::<SocketAddr>().copied();
    let request_headers = req.headers().clone();

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))
        .map_err(|e| WsError::Handshake(e.to_string()))?;
    response.headers_mut().extend(extra_headers);

    let inner = Box::pin(async move {
        let upgraded = on_upgrade.await?;
        if ctx.cancel.is_cancelled() {
            return Err(WsError::EndpointClosed);
        }

        let ws = WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            WsRole::Server,
            Some(ctx.config.websocket_config()),
        )
        .await;
        let peer = Peer {
            local_addr: None,
            remote_addr,
            header: request_headers,
        };
        complete(ws, peer, &ctx)
    });

    Ok((response, Upgrading { inner }))
}

/// Attach an upgraded stream and hand back its registered handle.
///
/// The registry lookup runs before the reader task starts, so a peer that
/// closes right away cannot remove the entry first.
fn complete<S>(ws: WebSocketStream<S>, peer: Peer, ctx: &ChannelContext) -> WsResult<Conn>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_addr = peer.remote_addr;
    let registry = ctx.adapter.registry();
    let conn = pipeline::spawn_with(ws, Role::Server, peer, ctx, |conn| {
        registry
            .get(conn.id())
            .map(|_| ())
            .ok_or(WsError::HandleMissing(conn.id()))
    })?;
    debug!(conn_id = %conn.id(), remote = ?remote_addr, "HTTP connection upgraded");
    Ok(conn)
}
