use aga_common::SignalMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{RelayConnector, RelayLink};
use crate::error::{LiveError, LiveResult};

const LINK_BUFFER: usize = 64;

/// Dials the relay over WebSocket, one JSON text frame per message.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn dial(&self) -> LiveResult<RelayLink> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(LiveError::transport)?;
        debug!("WebSocket connected to {}", self.url);

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<SignalMessage>(LINK_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel::<SignalMessage>(LINK_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            let text = match msg.to_json() {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("Failed to encode {}: {}", msg.kind(), e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!("WebSocket send failed: {}", e);
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                            Ok(msg) => {
                                if inbound_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping malformed relay frame: {}", e),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("WebSocket receive failed: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        Ok(RelayLink { outbound, inbound })
    }
}
