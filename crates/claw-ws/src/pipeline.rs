//! Per-connection reader and writer tasks over a `tokio-tungstenite` stream.
//!
//! The reader task is the only place lifecycle events are emitted for a
//! connection, so `data` never overlaps `inactive`. Writes go through a
//! bounded queue to the writer task, which owns the sink.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::adapter::EventAdapter;
use crate::config::MessageType;
use crate::conn::Conn;
use crate::error::{WsError, WsResult};
use crate::transport::{BoxFuture, ChannelContext, ConnectionId, Disconnect, Role, Transport};

type Ack = oneshot::Sender<WsResult<()>>;

/// Work item for the writer task.
#[derive(Debug)]
enum Outbound {
    Message(Message, Option<Ack>),
    Close(CloseFrame<'static>, Ack),
}

/// Addressing and handshake data of a freshly established stream.
#[derive(Debug, Default)]
pub(crate) struct Peer {
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) header: HeaderMap,
}

/// [`Transport`] backed by a reader and a writer task.
#[derive(Debug)]
pub struct WsChannel {
    peer: Peer,
    message_type: MessageType,
    check_utf8: bool,
    outbound: mpsc::Sender<Outbound>,
    write_deadline: Mutex<Option<Instant>>,
    read_deadline: watch::Sender<Option<Instant>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_sent: AtomicBool,
    cause: Mutex<Option<WsError>>,
}

impl WsChannel {
    fn encode(&self, payload: &[u8]) -> WsResult<Message> {
        match self.message_type {
            MessageType::Binary => Ok(Message::Binary(payload.to_vec())),
            MessageType::Text if self.check_utf8 => std::str::from_utf8(payload)
                .map(|text| Message::Text(text.to_owned()))
                .map_err(|e| WsError::InvalidPayload(format!("text message is not UTF-8: {e}"))),
            MessageType::Text => Ok(Message::Text(
                String::from_utf8_lossy(payload).into_owned(),
            )),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Data frames are refused once a close frame was queued.
    fn check_writable(&self) -> WsResult<()> {
        if self.is_closed() || self.close_sent.load(Ordering::Acquire) {
            return Err(WsError::ConnectionClosed);
        }
        Ok(())
    }

    /// Stop both tasks without recording a cause.
    fn finish(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
    }

    fn take_cause(&self) -> Disconnect {
        self.cause
            .lock()
            .take()
            .map_or(Disconnect::Local, Disconnect::Error)
    }

    /// Hand `item` to the writer and wait for its result, bounded by the write deadline.
    async fn submit(&self, item: Outbound, done: oneshot::Receiver<WsResult<()>>) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::ConnectionClosed);
        }

        let deadline = *self.write_deadline.lock();
        let started = Instant::now();
        let write = async {
            self.outbound
                .send(item)
                .await
                .map_err(|_| WsError::ConnectionClosed)?;
            done.await.map_err(|_| WsError::ConnectionClosed)?
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), write)
                .await
                .map_err(|_| WsError::Timeout(deadline.saturating_duration_since(started)))?,
            None => write.await,
        }
    }
}

impl Transport for WsChannel {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.peer.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer.remote_addr
    }

    fn header(&self) -> &HeaderMap {
        &self.peer.header
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.send_replace(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }

    fn write<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(async move {
            self.check_writable()?;
            let message = self.encode(payload)?;
            let (ack, done) = oneshot::channel();
            self.submit(Outbound::Message(message, Some(ack)), done).await
        })
    }

    fn try_write(&self, payload: &[u8]) -> WsResult<()> {
        self.check_writable()?;
        let message = self.encode(payload)?;
        self.outbound
            .try_send(Outbound::Message(message, None))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WsError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => WsError::ConnectionClosed,
            })
    }

    fn write_close<'a>(&'a self, code: u16, reason: &'a str) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(async move {
            if self.is_closed() || self.close_sent.swap(true, Ordering::AcqRel) {
                return Err(WsError::ConnectionClosed);
            }
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_owned()),
            };
            let (ack, done) = oneshot::channel();
            self.submit(Outbound::Close(frame, ack), done).await
        })
    }

    fn close(&self, cause: Option<WsError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cause) = cause {
            *self.cause.lock() = Some(cause);
        }
        self.shutdown.cancel();
    }
}

/// Attach an established WebSocket stream to an endpoint.
///
/// Spawns the writer task, activates the connection through the adapter
/// (registration and `on_open`), then spawns the reader task.
///
/// # Errors
///
/// Returns `WsError::EndpointClosed` if the endpoint shut down before the
/// connection could be registered; the stream is dropped.
pub(crate) fn spawn<S>(
    ws: WebSocketStream<S>,
    role: Role,
    peer: Peer,
    ctx: &ChannelContext,
) -> WsResult<Conn>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    spawn_with(ws, role, peer, ctx, |_| Ok(()))
}

/// Like [`spawn`], running `check` after activation and before the reader
/// task starts.
///
/// If `check` fails the connection is closed, the reader still delivers
/// `on_close`, and the error is returned.
pub(crate) fn spawn_with<S, F>(
    ws: WebSocketStream<S>,
    role: Role,
    peer: Peer,
    ctx: &ChannelContext,
    check: F,
) -> WsResult<Conn>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(&Conn) -> WsResult<()>,
{
    let (sink, stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.config.write_queue_size.max(1));
    let (deadline_tx, deadline_rx) = watch::channel(None);

    let channel = Arc::new(WsChannel {
        peer,
        message_type: ctx.config.message_type,
        check_utf8: ctx.config.check_utf8,
        outbound: outbound_tx,
        write_deadline: Mutex::new(None),
        read_deadline: deadline_tx,
        shutdown: CancellationToken::new(),
        closed: AtomicBool::new(false),
        close_sent: AtomicBool::new(false),
        cause: Mutex::new(None),
    });
    let id = ConnectionId::next();
    let conn = Conn::with_context(id, role, channel.clone(), ctx.connection_token());

    tokio::spawn(write_loop(
        sink,
        outbound_rx,
        Arc::clone(&channel),
        ctx.config.close_timeout(),
    ));

    ctx.adapter.activate(&conn)?;
    debug!(conn_id = %id, role = ?role, remote = ?conn.remote_addr(), "Connection active");

    let checked = check(&conn);
    if checked.is_err() {
        conn.close();
    }

    tokio::spawn(read_loop(
        stream,
        conn.clone(),
        channel,
        Arc::clone(&ctx.adapter),
        deadline_rx,
    ));

    checked.map(|()| conn)
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    conn: Conn,
    channel: Arc<WsChannel>,
    adapter: Arc<EventAdapter>,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let disconnect = loop {
        let deadline = *deadline_rx.borrow_and_update();
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = channel.shutdown.cancelled() => break channel.take_cause(),
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    break channel.take_cause();
                }
            }
            () = expired => {
                let elapsed = deadline.map_or(Duration::ZERO, |d| d.elapsed());
                adapter.exception(&conn, WsError::Timeout(elapsed));
            }
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => adapter.data(&conn, text.as_bytes()),
                Some(Ok(Message::Binary(data))) => adapter.data(&conn, &data),
                Some(Ok(Message::Close(frame))) => {
                    channel.finish();
                    break Disconnect::PeerClose(frame.map(CloseFrame::into_owned));
                }
                Some(Ok(_)) => trace!(conn_id = %conn.id(), "Control frame"),
                Some(Err(e)) => adapter.exception(&conn, e.into()),
                None => {
                    channel.finish();
                    break Disconnect::Error(WsError::ConnectionClosed);
                }
            },
        }
    };

    channel.finish();
    adapter.inactive(&conn, disconnect);
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    channel: Arc<WsChannel>,
    close_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            () = channel.shutdown.cancelled() => break,
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let (message, ack) = match item {
            Outbound::Message(message, ack) => (message, ack),
            Outbound::Close(frame, ack) => (Message::Close(Some(frame)), Some(ack)),
        };

        let result = tokio::select! {
            biased;
            () = channel.shutdown.cancelled() => Err(WsError::ConnectionClosed),
            sent = sink.send(message) => sent.map_err(WsError::from),
        };

        if let Err(e) = &result {
            if !matches!(e, WsError::ConnectionClosed) {
                channel.close(Some(WsError::WebSocket(format!("write failed: {e}"))));
            }
        }
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
    }

    // Flushes a pending close reply, or starts the close handshake.
    if tokio::time::timeout(close_timeout, sink.close()).await.is_err() {
        debug!("Timed out closing WebSocket sink");
    }
}
