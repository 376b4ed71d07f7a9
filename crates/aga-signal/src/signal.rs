use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use aga_common::{helpers::is_valid_identifier, ConnectionId, SignalMessage, StreamRole};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{Delivery, StreamRegistry, BAD_REQUEST};
use crate::security::{self, ConnectionPermit, MessageBudget};
use crate::AppState;

/// Outboxes of the connected sockets, keyed by connection id.
pub type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, mpsc::Sender<Message>>>>;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let permit = match state.limiter.try_acquire(addr.ip()) {
        Ok(permit) => permit,
        Err(rejection) => {
            warn!("refusing socket from {}: {:?}", addr, rejection);
            return rejection.status().into_response();
        }
    };

    let max = state.config.max_text_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, addr, permit))
        .into_response()
}

async fn handle_socket(stream: WebSocket, state: AppState, addr: SocketAddr, permit: ConnectionPermit) {
    let connection_id: ConnectionId = Uuid::new_v4().to_string();
    info!("client {} connected from {}", connection_id, addr);

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.outbox_capacity);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        let _ = disconnect_tx.try_send(());
    });

    state
        .connections
        .write()
        .await
        .insert(connection_id.clone(), tx.clone());
    send_signal(
        &tx,
        &SignalMessage::Welcome {
            connection_id: connection_id.clone(),
        },
    )
    .await;

    let mut budget = MessageBudget::new(state.config.messages_per_minute);

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };

                if !budget.allow(Instant::now()) {
                    warn!("rate limit exceeded by {}", connection_id);
                    send_signal(&tx, &SignalMessage::error("Rate limit exceeded")).await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        send_signal(&tx, &SignalMessage::error("Binary messages are not supported")).await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let signal = match SignalMessage::from_json(&text) {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!("invalid message from {}: {}", connection_id, err);
                        send_signal(&tx, &SignalMessage::error("Invalid message")).await;
                        break;
                    }
                };
                debug!("{} from {}", signal.kind(), connection_id);

                let deliveries = {
                    let mut registry = state.registry.lock().await;
                    route(&mut registry, &connection_id, signal)
                };
                deliver(&state.connections, deliveries).await;
            }
        }
    }

    state.connections.write().await.remove(&connection_id);
    let deliveries = state.registry.lock().await.disconnect(&connection_id);
    deliver(&state.connections, deliveries).await;
    drop(permit);
    info!("client {} disconnected", connection_id);
}

/// Applies one client message to the registry.
pub fn route(registry: &mut StreamRegistry, from: &str, message: SignalMessage) -> Vec<Delivery> {
    match message {
        SignalMessage::StartStream { stream_id, host_id } => {
            if !is_valid_identifier(&stream_id) || !is_valid_identifier(&host_id) {
                return vec![Delivery::error(from, BAD_REQUEST, "Invalid start-stream payload")];
            }
            registry.start_stream(from, &stream_id, &host_id)
        }
        SignalMessage::JoinStream {
            stream_id,
            viewer_id,
        } => {
            if !is_valid_identifier(&stream_id) || !is_valid_identifier(&viewer_id) {
                return vec![Delivery::error(from, BAD_REQUEST, "Invalid join-stream payload")];
            }
            registry.join_stream(from, &stream_id, &viewer_id)
        }
        SignalMessage::LeaveStream { stream_id } => registry.leave_stream(from, &stream_id),
        SignalMessage::EndStream { stream_id } => registry.end_stream(from, &stream_id),
        message @ (SignalMessage::Offer { .. }
        | SignalMessage::Answer { .. }
        | SignalMessage::IceCandidate { .. }) => forward(registry, from, message),
        other => {
            debug!("{} sent relay-only message {}", from, other.kind());
            vec![Delivery::error(from, BAD_REQUEST, "Unsupported client message type")]
        }
    }
}

fn forward(registry: &StreamRegistry, from: &str, message: SignalMessage) -> Vec<Delivery> {
    let joined = match (registry.membership(from), message.stream_id()) {
        (Some((current, _)), Some(stream_id)) => current == stream_id,
        _ => false,
    };
    if !joined {
        return vec![Delivery::error(
            from,
            BAD_REQUEST,
            "Start or join the stream before negotiating",
        )];
    }
    if !security::is_valid_forward(&message) {
        return vec![Delivery::error(
            from,
            BAD_REQUEST,
            format!("Invalid {} payload", message.kind()),
        )];
    }
    let Some(target) = message.peer().map(str::to_string) else {
        return Vec::new();
    };
    if target == from {
        return vec![Delivery::error(from, BAD_REQUEST, "Cannot signal yourself")];
    }

    // A host negotiates with its viewers; a viewer only with its host.
    let allowed = match registry.membership(from) {
        Some((stream_id, StreamRole::Host)) => registry.viewers(stream_id).contains(&target),
        Some((stream_id, StreamRole::Viewer)) => registry.host_of(stream_id) == Some(target.as_str()),
        None => false,
    };
    if !allowed {
        debug!("dropping {} from {} to non-member {}", message.kind(), from, target);
        return Vec::new();
    }

    vec![Delivery::new(target, message.with_peer(from.to_string()))]
}

async fn send_signal(tx: &mpsc::Sender<Message>, signal: &SignalMessage) {
    match signal.to_json() {
        Ok(text) => {
            let _ = tx.send(Message::Text(text)).await;
        }
        Err(err) => warn!("failed to encode {}: {}", signal.kind(), err),
    }
}

async fn deliver(connections: &ConnectionMap, deliveries: Vec<Delivery>) {
    if deliveries.is_empty() {
        return;
    }
    let guard = connections.read().await;
    for Delivery { to, message } in deliveries {
        let Some(tx) = guard.get(&to) else {
            warn!("target connection not connected: {}", to);
            continue;
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to encode {}: {}", message.kind(), err);
                continue;
            }
        };
        if tx.try_send(Message::Text(text)).is_err() {
            warn!("failed to queue {} for {}", message.kind(), to);
        }
    }
}
