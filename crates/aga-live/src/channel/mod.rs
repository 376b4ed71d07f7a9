//! Persistent connection to the signaling relay.
//!
//! A background task owns the relay link. It announces the session after
//! every (re)connect, replays messages queued while the relay was away and
//! reports everything it sees as [`ChannelEvent`]s, in relay order.

mod websocket;

pub use websocket::WebSocketConnector;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aga_common::{ConnectionId, SignalMessage, StreamRole};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{LiveConfig, ReconnectPolicy};
use crate::error::{LiveError, LiveResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The relay accepted the socket and assigned it an id.
    Connected { connection_id: ConnectionId },
    /// An established connection was lost. Reconnecting.
    Disconnected { reason: String },
    Message(SignalMessage),
    /// Reconnect attempts are exhausted. No further events follow.
    GaveUp { attempts: u32, reason: String },
}

/// A dialed relay connection, as a pair of message queues.
///
/// Dropping `outbound` closes the underlying socket.
#[derive(Debug)]
pub struct RelayLink {
    pub outbound: mpsc::Sender<SignalMessage>,
    pub inbound: mpsc::Receiver<SignalMessage>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn dial(&self) -> LiveResult<RelayLink>;
}

pub struct SignalingChannel {
    connector: Arc<dyn RelayConnector>,
    reconnect: ReconnectPolicy,
    welcome_timeout: Duration,
    outbox_capacity: usize,
    close_timeout: Duration,
    connected: Arc<AtomicBool>,
    outgoing: Option<mpsc::UnboundedSender<SignalMessage>>,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn new(connector: Arc<dyn RelayConnector>, config: &LiveConfig) -> Self {
        Self {
            connector,
            reconnect: config.reconnect.clone(),
            welcome_timeout: config.welcome_timeout,
            outbox_capacity: config.outbox_capacity.max(1),
            close_timeout: config.link_close_timeout,
            connected: Arc::new(AtomicBool::new(false)),
            outgoing: None,
            task: None,
        }
    }

    /// Channel over WebSocket to `config.relay_url`.
    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(
            Arc::new(WebSocketConnector::new(config.relay_url.clone())),
            config,
        )
    }

    /// Starts the background connection and returns its event stream.
    pub fn connect(
        &mut self,
        stream_id: &str,
        role: StreamRole,
        local_id: &str,
    ) -> LiveResult<mpsc::UnboundedReceiver<ChannelEvent>> {
        if self.task.is_some() {
            return Err(LiveError::invalid_state("signaling channel already started"));
        }

        let announce = match role {
            StreamRole::Host => SignalMessage::StartStream {
                stream_id: stream_id.to_string(),
                host_id: local_id.to_string(),
            },
            StreamRole::Viewer => SignalMessage::JoinStream {
                stream_id: stream_id.to_string(),
                viewer_id: local_id.to_string(),
            },
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let task = ChannelTask {
            connector: self.connector.clone(),
            policy: self.reconnect.clone(),
            welcome_timeout: self.welcome_timeout,
            outbox_capacity: self.outbox_capacity,
            announce,
            connected: self.connected.clone(),
            outgoing: outgoing_rx,
            outbox: VecDeque::new(),
            events,
        };

        info!("Connecting signaling channel for stream {} as {}", stream_id, role);
        self.outgoing = Some(outgoing);
        self.task = Some(tokio::spawn(task.run()));
        Ok(events_rx)
    }

    /// Queues a message for the relay.
    ///
    /// Messages sent while the relay is unreachable are delivered after the
    /// next successful reconnect, as long as the outbox has room.
    pub fn send(&self, message: SignalMessage) -> LiveResult<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or(LiveError::ChannelDisconnected)?;
        outgoing
            .send(message)
            .map_err(|_| LiveError::ChannelDisconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flushes what is already queued, then closes the relay connection.
    pub async fn disconnect(&mut self) {
        self.outgoing.take();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.close_timeout, &mut task)
                .await
                .is_err()
            {
                debug!("Signaling task did not stop in time, aborting");
                task.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Attempt {
    /// The owner hung up.
    Closed,
    /// Dial or handshake failed.
    Failed(String),
    /// A served connection went away.
    Lost(String),
}

struct ChannelTask {
    connector: Arc<dyn RelayConnector>,
    policy: ReconnectPolicy,
    welcome_timeout: Duration,
    outbox_capacity: usize,
    announce: SignalMessage,
    connected: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedReceiver<SignalMessage>,
    outbox: VecDeque<SignalMessage>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut failures = 0u32;
        let mut wait = false;

        loop {
            if wait {
                // The first retry after a drop or a failed dial waits the initial backoff.
                let delay = self.policy.calculate_backoff(failures.saturating_sub(1));
                debug!("Reconnecting to relay in {:?}", delay);
                if !self.idle(delay).await {
                    return;
                }
            }

            match self.attempt().await {
                Attempt::Closed => return,
                Attempt::Failed(reason) => {
                    failures += 1;
                    warn!("Relay connection attempt {} failed: {}", failures, reason);
                    if !self.policy.should_retry(failures) {
                        warn!("Giving up on relay after {} attempts", failures);
                        let _ = self.events.send(ChannelEvent::GaveUp {
                            attempts: failures,
                            reason,
                        });
                        return;
                    }
                }
                Attempt::Lost(reason) => {
                    failures = 0;
                    warn!("Relay connection lost: {}", reason);
                    if !self.emit(ChannelEvent::Disconnected { reason }) {
                        return;
                    }
                }
            }
            wait = true;
        }
    }

    /// Waits out a backoff while still accepting outgoing messages.
    /// Returns false when the owner hung up.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                msg = self.outgoing.recv() => match msg {
                    Some(msg) => self.hold(msg),
                    None => return false,
                },
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let connector = self.connector.clone();
        let dial = connector.dial();
        tokio::pin!(dial);
        let dialed = loop {
            tokio::select! {
                res = &mut dial => break res,
                msg = self.outgoing.recv() => match msg {
                    Some(msg) => self.hold(msg),
                    None => return Attempt::Closed,
                },
            }
        };
        let RelayLink {
            outbound,
            mut inbound,
        } = match dialed {
            Ok(link) => link,
            Err(e) => return Attempt::Failed(e.to_string()),
        };

        let deadline = tokio::time::sleep(self.welcome_timeout);
        tokio::pin!(deadline);
        let connection_id = loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Attempt::Failed("timed out waiting for welcome".to_string())
                }
                msg = inbound.recv() => match msg {
                    Some(SignalMessage::Welcome { connection_id }) => break connection_id,
                    Some(other) => debug!("Ignoring {} before welcome", other.kind()),
                    None => return Attempt::Failed("relay closed before welcome".to_string()),
                },
                msg = self.outgoing.recv() => match msg {
                    Some(msg) => self.hold(msg),
                    None => return Attempt::Closed,
                },
            }
        };

        self.serve(connection_id, outbound, inbound).await
    }

    async fn serve(
        &mut self,
        connection_id: ConnectionId,
        outbound: mpsc::Sender<SignalMessage>,
        mut inbound: mpsc::Receiver<SignalMessage>,
    ) -> Attempt {
        info!("Signaling channel connected as {}", connection_id);
        self.connected.store(true, Ordering::SeqCst);
        if !self.emit(ChannelEvent::Connected { connection_id }) {
            return Attempt::Closed;
        }

        let result = self.pump(&outbound, &mut inbound).await;
        self.connected.store(false, Ordering::SeqCst);
        result
    }

    async fn pump(
        &mut self,
        outbound: &mpsc::Sender<SignalMessage>,
        inbound: &mut mpsc::Receiver<SignalMessage>,
    ) -> Attempt {
        if outbound.send(self.announce.clone()).await.is_err() {
            return Attempt::Lost("relay closed during announce".to_string());
        }
        while let Some(msg) = self.outbox.pop_front() {
            if let Err(mpsc::error::SendError(msg)) = outbound.send(msg).await {
                self.outbox.push_front(msg);
                return Attempt::Lost("relay closed while flushing".to_string());
            }
        }

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        if !self.emit(ChannelEvent::Message(msg)) {
                            return Attempt::Closed;
                        }
                    }
                    None => return Attempt::Lost("relay closed the connection".to_string()),
                },
                msg = self.outgoing.recv() => match msg {
                    Some(msg) => {
                        if let Err(mpsc::error::SendError(msg)) = outbound.send(msg).await {
                            self.outbox.push_front(msg);
                            return Attempt::Lost("relay closed the connection".to_string());
                        }
                    }
                    None => return Attempt::Closed,
                },
            }
        }
    }

    fn hold(&mut self, msg: SignalMessage) {
        if self.outbox.len() >= self.outbox_capacity {
            if let Some(dropped) = self.outbox.pop_front() {
                warn!("Signaling outbox full, dropping queued {}", dropped.kind());
            }
        }
        self.outbox.push_back(msg);
    }

    fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
