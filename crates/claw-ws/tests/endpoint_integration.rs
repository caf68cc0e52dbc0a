//! Integration tests for `Endpoint` over real loopback sockets.
//!
//! These tests verify:
//! 1. Listener accept, echo and peer-initiated close
//! 2. Endpoint shutdown sends close frames to every peer
//! 3. Client-mode `open` against a listening endpoint
//! 4. Read deadlines and handshake headers
//! 5. Upgrades of connections served by `hyper`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use claw_ws::{CloseReason, Endpoint, EndpointConfig, WsError, CLOSE_GOING_AWAY};
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Open,
    Data(Vec<u8>),
    Close(Option<CloseReason>),
    Timeout,
    Header(Option<String>),
}

fn echo_server(config: EndpointConfig) -> (Endpoint, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let open_tx = tx.clone();
    let data_tx = tx.clone();
    let endpoint = Endpoint::builder()
        .config(config)
        .on_open(move |conn| {
            let token = conn
                .header()
                .get("x-claw-token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = open_tx.send(Event::Header(token));
            let _ = open_tx.send(Event::Open);
        })
        .on_data(move |conn, payload| {
            let _ = data_tx.send(Event::Data(payload.to_vec()));
            let _ = conn.send(payload);
        })
        .on_close(move |_, err| {
            let event = match err {
                Some(WsError::Timeout(_)) => Event::Timeout,
                other => Event::Close(other.and_then(WsError::close_reason)),
            };
            let _ = tx.send(event);
        })
        .build()
        .unwrap();
    (endpoint, rx)
}

async fn start_listening(endpoint: &Endpoint) -> (SocketAddr, JoinHandle<Result<(), WsError>>) {
    let listen = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.listen("127.0.0.1:0").await })
    };
    let addr = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(addr) = endpoint.listener_addr("127.0.0.1:0") {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    (addr, listen)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

/// Skip events until one matching `pred` arrives.
async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .unwrap();
    client
}

async fn next_message(client: &mut Client) -> Message {
    tokio::time::timeout(WAIT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

// ============================================================================
// Listener Tests
// ============================================================================

#[tokio::test]
async fn test_echo_and_peer_close() {
    let (endpoint, mut events) = echo_server(EndpointConfig::default());
    let (addr, listen) = start_listening(&endpoint).await;

    let mut client = connect(addr).await;
    wait_for(&mut events, |e| *e == Event::Open).await;
    assert_eq!(endpoint.connection_count(), 1);
    let context = endpoint.connections().pop().unwrap().context();

    client.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::Text("ping".into()));
    assert_eq!(next_event(&mut events).await, Event::Data(b"ping".to_vec()));

    client
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })))
        .await
        .unwrap();

    let closed = wait_for(&mut events, |e| matches!(e, Event::Close(_))).await;
    assert_eq!(closed, Event::Close(Some(CloseReason::new(1000, "bye"))));
    assert_eq!(endpoint.connection_count(), 0);
    assert!(context.is_cancelled());
    assert!(!endpoint.is_closed());

    endpoint.close().await.unwrap();
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_notifies_every_peer() {
    let (endpoint, mut events) = echo_server(EndpointConfig::default());
    let (addr, listen) = start_listening(&endpoint).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(addr).await);
        wait_for(&mut events, |e| *e == Event::Open).await;
    }

    endpoint.close().await.unwrap();

    for client in &mut clients {
        match next_message(client).await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason, "websocket shutdown");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
    for _ in 0..3 {
        match wait_for(&mut events, |e| matches!(e, Event::Close(_))).await {
            Event::Close(Some(reason)) => assert_eq!(reason.code, 1000),
            other => panic!("expected close event, got {other:?}"),
        }
    }

    assert!(endpoint.is_closed());
    assert_eq!(endpoint.connection_count(), 0);
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_with_going_away() {
    let (endpoint, mut events) = echo_server(EndpointConfig::default());
    let (addr, listen) = start_listening(&endpoint).await;

    let mut client = connect(addr).await;
    wait_for(&mut events, |e| *e == Event::Open).await;

    endpoint
        .close_with(CloseReason::new(CLOSE_GOING_AWAY, "going away"))
        .await
        .unwrap();

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), CLOSE_GOING_AWAY);
            assert_eq!(frame.reason, "going away");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicate_listen_address() {
    let (endpoint, _events) = echo_server(EndpointConfig::default());
    let (_addr, listen) = start_listening(&endpoint).await;

    let result = endpoint.listen("127.0.0.1:0").await;
    assert!(matches!(result, Err(WsError::AlreadyListening(_))));
    assert!(endpoint.listener_addr("127.0.0.1:0").is_some());

    endpoint.close().await.unwrap();
    listen.await.unwrap().unwrap();
    assert!(matches!(
        endpoint.listen("127.0.0.1:0").await,
        Err(WsError::EndpointClosed)
    ));
}

// ============================================================================
// Client Tests
// ============================================================================

#[tokio::test]
async fn test_open_against_listening_endpoint() {
    let (server, mut server_events) = echo_server(EndpointConfig::default());
    let (addr, listen) = start_listening(&server).await;

    let (tx, mut replies) = mpsc::unbounded_channel();
    let client = Endpoint::builder()
        .config(EndpointConfig::new().with_client_header("x-claw-token", "secret"))
        .on_data(move |_, payload| {
            let _ = tx.send(payload.to_vec());
        })
        .build()
        .unwrap();

    let conn = client.open(&format!("ws://{addr}/")).await.unwrap();
    assert!(conn.role().is_client());
    assert_eq!(conn.remote_addr(), Some(addr));
    assert_eq!(client.connection_count(), 1);

    assert_eq!(
        next_event(&mut server_events).await,
        Event::Header(Some("secret".to_string()))
    );

    conn.write(b"hello").await.unwrap();
    let reply = tokio::time::timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply, b"hello");

    client.close().await.unwrap();
    assert!(conn.is_closed());
    assert!(matches!(
        client.open(&format!("ws://{addr}/")).await,
        Err(WsError::EndpointClosed)
    ));

    let closed = wait_for(&mut server_events, |e| matches!(e, Event::Close(_))).await;
    assert_eq!(
        closed,
        Event::Close(Some(CloseReason::new(1000, "websocket shutdown")))
    );

    server.close().await.unwrap();
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_open_unreachable_address() {
    let vacated = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = vacated.local_addr().unwrap();
    drop(vacated);

    let client = Endpoint::builder()
        .config(EndpointConfig::new().with_dial_timeout(Duration::from_secs(2)))
        .build()
        .unwrap();

    let result = client.open(&addr.to_string()).await;
    assert!(matches!(result, Err(WsError::DialFailed { .. })));
    assert_eq!(client.connection_count(), 0);
}

// ============================================================================
// Deadline Tests
// ============================================================================

#[tokio::test]
async fn test_read_deadline_closes_idle_connection() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let endpoint = Endpoint::builder()
        .on_open(|conn| conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(100))))
        .on_close(move |_, err| {
            let _ = tx.send(matches!(err, Some(WsError::Timeout(_))));
        })
        .build()
        .unwrap();
    let (addr, listen) = start_listening(&endpoint).await;

    let _client = connect(addr).await;

    let timed_out = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(timed_out);
    assert_eq!(endpoint.connection_count(), 0);

    endpoint.close().await.unwrap();
    listen.await.unwrap().unwrap();
}

// ============================================================================
// HTTP Upgrade Tests
// ============================================================================

async fn serve_http(endpoint: Endpoint) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let service = service_fn(move |mut req: Request<Incoming>| {
                    req.extensions_mut().insert(peer);
                    let response = endpoint.serve_http(req);
                    async move { Ok::<_, Infallible>(response) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_serve_http_upgrades_connection() {
    let (endpoint, mut events) =
        echo_server(EndpointConfig::new().with_server_header("x-claw-node", "node-1"));
    let addr = serve_http(endpoint.clone()).await;

    let (mut client, response) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-claw-node").unwrap(),
        "node-1"
    );
    wait_for(&mut events, |e| *e == Event::Open).await;

    let conn = endpoint.connections().pop().unwrap();
    assert_eq!(conn.remote_addr().map(|a| a.ip()), Some(addr.ip()));

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(vec![1, 2, 3]));
    assert_eq!(
        next_message(&mut client).await,
        Message::Text("\u{1}\u{2}\u{3}".into())
    );

    endpoint.close().await.unwrap();
    assert!(matches!(next_message(&mut client).await, Message::Close(_)));
}

#[tokio::test]
async fn test_serve_http_refuses_after_close() {
    let (endpoint, _events) = echo_server(EndpointConfig::default());
    let addr = serve_http(endpoint.clone()).await;
    endpoint.close().await.unwrap();

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;

    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 406);
        }
        Err(e) => panic!("expected HTTP error, got {e}"),
        Ok(_) => panic!("upgrade succeeded after close"),
    }
}

#[tokio::test]
async fn test_upgrade_http_resolves_registered_conn() {
    let (endpoint, mut events) = echo_server(EndpointConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, mut upgraded) = mpsc::unbounded_channel();

    {
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let service = service_fn(move |mut req: Request<Incoming>| {
                req.extensions_mut().insert(peer);
                let (response, upgrading) = endpoint.upgrade_http(&mut req).unwrap();
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let _ = conn_tx.send(upgrading.await);
                });
                async move { Ok::<_, Infallible>(response) }
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await;
        });
    }

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-claw-token", "upgraded".parse().unwrap());
    let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let conn = tokio::time::timeout(WAIT, upgraded.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(endpoint.registry().get(conn.id()).unwrap().ptr_eq(&conn));
    assert_eq!(conn.header().get("x-claw-token").unwrap(), "upgraded");
    assert_eq!(conn.remote_addr().map(|a| a.ip()), Some(addr.ip()));
    assert!(!conn.role().is_client());
    assert_eq!(
        next_event(&mut events).await,
        Event::Header(Some("upgraded".to_string()))
    );

    conn.write(b"direct").await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::Text("direct".into()));

    let context = conn.context();
    endpoint.close().await.unwrap();
    assert!(context.is_cancelled());
    assert!(conn.is_closed());
    assert!(matches!(next_message(&mut client).await, Message::Close(_)));
}
