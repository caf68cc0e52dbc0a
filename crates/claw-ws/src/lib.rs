//! # claw-ws
//!
//! Embeddable WebSocket endpoint for Clawbernetes services.
//!
//! An [`Endpoint`] acts as a client (dialing peers with [`Endpoint::open`]),
//! a server (accepting on any number of addresses with [`Endpoint::listen`]),
//! or both, and can take over connections from an existing `hyper` server
//! ([`Endpoint::serve_http`]). Every connection reports to the same three
//! callbacks and is tracked in one [`ConnectionRegistry`], so a single
//! [`Endpoint::close`] sends a close frame to every peer and stops all
//! listeners.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   open / listen   ┌──────────────┐   connect / listen  ┌─────────────────┐
//! │   Endpoint   │──────────────────►│    Engine    │────────────────────►│    Transport    │
//! │              │                   │ (tungstenite)│                     │ reader + writer │
//! └──────┬───────┘                   └──────────────┘                     └────────┬────────┘
//!        │ close_all                                                                │ events
//!        ▼                                                                          ▼
//! ┌──────────────┐           add / remove            ┌──────────────┐   on_open / on_data / on_close
//! │   Registry   │◄──────────────────────────────────│ EventAdapter │──────────────────────────────►
//! └──────────────┘                                   └──────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use claw_ws::{Endpoint, EndpointConfig};
//!
//! #[tokio::main]
//! async fn main() -> claw_ws::WsResult<()> {
//!     let endpoint = Endpoint::builder()
//!         .config(EndpointConfig::new().with_binary())
//!         .on_data(|conn, payload| {
//!             let _ = conn.send(payload);
//!         })
//!         .build()?;
//!
//!     endpoint.listen("127.0.0.1:8080").await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod conn;
pub mod endpoint;
pub mod engine;
pub mod error;
mod pipeline;
pub mod registry;
pub mod transport;
mod upgrade;

// Re-export main types
pub use adapter::{normalize, Callbacks, EventAdapter};
pub use config::{CompressionConfig, EndpointConfig, MessageType};
pub use conn::Conn;
pub use endpoint::{Endpoint, EndpointBuilder, EndpointState};
pub use engine::{TcpAcceptor, TungsteniteEngine};
pub use error::{
    is_sendable_close_code, CloseReason, WsError, WsResult, CLOSE_GOING_AWAY, CLOSE_NORMAL,
    CLOSE_NO_STATUS, SHUTDOWN_REASON,
};
pub use pipeline::WsChannel;
pub use registry::ConnectionRegistry;
pub use transport::{
    BoxFuture, ChannelContext, ConnectionId, Disconnect, Engine, Listener, Role, Transport,
};
pub use upgrade::Upgrading;
