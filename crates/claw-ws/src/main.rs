//! claw-ws-echo - WebSocket echo server and client.
//!
//! Runs an endpoint that echoes every message back to its sender, or dials
//! an echo server and prints the replies.

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use claw_ws::{Endpoint, EndpointConfig};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-ws-echo")]
#[command(about = "WebSocket echo server and client")]
#[command(version)]
struct Cli {
    /// Path to a TOML endpoint config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept WebSocket connections and echo every message
    Listen {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:9001")]
        addr: String,
    },

    /// Serve plain HTTP and upgrade requests to WebSocket echo connections
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:9002")]
        addr: String,
    },

    /// Connect to an echo server and send messages
    Open {
        /// Server URL
        #[arg(long, default_value = "ws://127.0.0.1:9001")]
        url: String,

        /// Message to send
        #[arg(long, default_value = "hello")]
        message: String,

        /// Number of times to send the message
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("claw_ws=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EndpointConfig::from_file(path)?,
        None => EndpointConfig::default(),
    };

    match cli.command {
        Commands::Listen { addr } => listen(config, addr).await?,
        Commands::Serve { addr } => serve(config, addr).await?,
        Commands::Open {
            url,
            message,
            count,
        } => open(config, url, message, count).await?,
    }

    Ok(())
}

fn echo_endpoint(config: EndpointConfig) -> anyhow::Result<Endpoint> {
    let endpoint = Endpoint::builder()
        .config(config)
        .on_open(|conn| info!(conn_id = %conn.id(), remote = ?conn.remote_addr(), "connected"))
        .on_data(|conn, payload| {
            if let Err(e) = conn.send(payload) {
                warn!(conn_id = %conn.id(), error = %e, "echo failed");
            }
        })
        .on_close(|conn, err| match err {
            Some(e) => info!(conn_id = %conn.id(), cause = %e, "disconnected"),
            None => info!(conn_id = %conn.id(), "disconnected"),
        })
        .build()?;
    Ok(endpoint)
}

async fn listen(config: EndpointConfig, addr: String) -> anyhow::Result<()> {
    let endpoint = echo_endpoint(config)?;
    info!(addr = %addr, "starting echo server");

    tokio::select! {
        result = endpoint.listen(&addr) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
    }

    endpoint.close().await?;
    Ok(())
}

async fn serve(config: EndpointConfig, addr: String) -> anyhow::Result<()> {
    let endpoint = echo_endpoint(config)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "starting HTTP upgrade server");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
        };

        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let service = service_fn(move |mut req: Request<Incoming>| {
                req.extensions_mut().insert(peer);
                let response = endpoint.serve_http(req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                warn!(peer = %peer, error = %e, "HTTP connection failed");
            }
        });
    }

    endpoint.close().await?;
    Ok(())
}

async fn open(
    config: EndpointConfig,
    url: String,
    message: String,
    count: usize,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let endpoint = Endpoint::builder()
        .config(config)
        .on_data(move |_, payload| {
            let _ = tx.send(String::from_utf8_lossy(payload).into_owned());
        })
        .on_close(|_, err| {
            if let Some(e) = err {
                info!(cause = %e, "connection closed");
            }
        })
        .build()?;

    let conn = endpoint
        .open(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(url = %url, conn_id = %conn.id(), "connected");

    for _ in 0..count {
        conn.write(message.as_bytes()).await?;
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => break,
            Err(_) => {
                error!("no reply within 5s");
                break;
            }
        }
    }

    endpoint.close().await?;
    Ok(())
}
