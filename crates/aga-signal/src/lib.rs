//! WebSocket signaling relay for AGA live streams.
//!
//! Assigns every socket a connection id, tracks which host and viewers
//! belong to which stream and forwards negotiation messages between them.

#![forbid(unsafe_code)]

pub mod registry;
pub mod security;
pub mod signal;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tower_http::trace::TraceLayer;

pub use registry::{Delivery, StreamRegistry, BAD_REQUEST, STREAM_NOT_FOUND};
pub use security::{ConnectionLimiter, Rejection};
pub use signal::ConnectionMap;

/// Relay limits, see `aga-signal --help` for the command line names.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub max_text_bytes: usize,
    pub messages_per_minute: u32,
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_per_ip: 16,
            max_text_bytes: 64 * 1024,
            messages_per_minute: 600,
            outbox_capacity: 128,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub connections: ConnectionMap,
    pub registry: Arc<Mutex<StreamRegistry>>,
    pub limiter: ConnectionLimiter,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let limiter = ConnectionLimiter::new(config.max_connections, config.max_per_ip);
        Self {
            config: Arc::new(config),
            connections: Arc::new(RwLock::new(HashMap::new())),
            registry: Arc::new(Mutex::new(StreamRegistry::new())),
            limiter,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuntimeMetrics {
    pub active_connections: usize,
    pub active_streams: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active_connections = state.connections.read().await.len();
    let active_streams = state.registry.lock().await.stream_count();
    Json(RuntimeMetrics {
        active_connections,
        active_streams,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "AGA signaling relay" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on an already bound listener until the server fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// `ws://` URL clients should dial for a bound address.
pub fn ws_url_for(bound: SocketAddr) -> String {
    let host = if bound.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound.ip().to_string()
    };
    format!("ws://{}:{}/ws", host, bound.port())
}
