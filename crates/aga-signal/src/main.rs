#![forbid(unsafe_code)]

//! AGA signaling relay - routes stream membership and negotiation messages
//! between hosts and viewers over WebSocket.

use std::io::ErrorKind;
use std::net::SocketAddr;

use aga_common::helpers::env_bool;
use aga_signal::{serve, ws_url_for, AppState, RelayConfig};
use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "aga-signal")]
#[command(about = "AGA signaling relay - forwards stream signaling between hosts and viewers")]
struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "AGA_SIGNAL_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Maximum concurrent sockets
    #[arg(long, env = "AGA_SIGNAL_MAX_CONNECTIONS", default_value_t = 4096)]
    max_connections: usize,

    /// Maximum concurrent sockets per client address
    #[arg(long, env = "AGA_SIGNAL_MAX_PER_IP", default_value_t = 16)]
    max_per_ip: usize,

    /// Maximum messages per socket per minute
    #[arg(long, env = "AGA_SIGNAL_RATE_PER_MINUTE", default_value_t = 600)]
    rate_per_minute: u32,

    /// Log level
    #[arg(long, env = "AGA_SIGNAL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_connections: self.max_connections,
            max_per_ip: self.max_per_ip,
            messages_per_minute: self.rate_per_minute,
            ..RelayConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.listen.ip().is_loopback() && !env_bool("AGA_SIGNAL_ALLOW_PUBLIC_BIND", false) {
        return Err(anyhow::anyhow!(
            "refusing non-loopback bind without AGA_SIGNAL_ALLOW_PUBLIC_BIND=1"
        ));
    }

    aga_common::init_tracing_with_default(&format!(
        "{},tower_http=info,hyper=warn",
        args.log_level
    ));

    info!("Starting aga-signal v{}", env!("CARGO_PKG_VERSION"));

    let listener = match TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback = SocketAddr::new(args.listen.ip(), 0);
            warn!("{} is already in use, falling back to {}", args.listen, fallback);
            TcpListener::bind(fallback).await?
        }
        Err(err) => return Err(err.into()),
    };
    let bound = listener.local_addr()?;
    info!("relay listening on {}", bound);
    info!("signaling url {}", ws_url_for(bound));

    tokio::select! {
        result = serve(listener, AppState::new(args.relay_config())) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
