//! Stream session controller.
//!
//! [`SessionController`] binds a signaling channel and a peer manager to
//! one stream. Once started, a single task owns both and handles channel
//! events, link reports and API commands one at a time. Observers read a
//! [`SessionStatus`] snapshot through a watch channel or follow the typed
//! [`SessionEvent`] stream.

use std::time::Duration;

use aga_common::helpers::is_valid_identifier;
use aga_common::{ConnectionId, SignalMessage, StreamRole};
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, SignalingChannel};
use crate::config::LiveConfig;
use crate::error::{LiveError, LiveResult};
use crate::event::{ConnectionStatus, Lifecycle, SessionEvent, SessionStatus};
use crate::link::LinkReport;
use crate::manager::{Effects, PeerManager};
use crate::transport::{LocalMedia, MediaStreamHandle};

const COMMAND_BUFFER: usize = 32;

/// Relay error code for a join to a stream that does not exist.
pub const STREAM_NOT_FOUND: u16 = 404;

enum Command {
    Stop(oneshot::Sender<()>),
    RemoteStream(ConnectionId, oneshot::Sender<Option<MediaStreamHandle>>),
    Participants(oneshot::Sender<Vec<ConnectionId>>),
}

pub struct SessionController {
    config: LiveConfig,
    parts: Option<(SignalingChannel, PeerManager)>,
    status_tx: Option<watch::Sender<SessionStatus>>,
    status_rx: watch::Receiver<SessionStatus>,
    events_tx: Option<broadcast::Sender<SessionEvent>>,
    events_rx: broadcast::Receiver<SessionEvent>,
    commands: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(channel: SignalingChannel, manager: PeerManager, config: LiveConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (events_tx, events_rx) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            parts: Some((channel, manager)),
            status_tx: Some(status_tx),
            status_rx,
            events_tx: Some(events_tx),
            events_rx,
            commands: None,
            task: None,
        }
    }

    /// Starts the session. Must be called from within a Tokio runtime.
    ///
    /// A host needs at least one local track; this is checked before the
    /// relay is contacted.
    pub fn start(
        &mut self,
        role: StreamRole,
        stream_id: impl Into<String>,
        local_identity: impl Into<String>,
        local_media: LocalMedia,
    ) -> LiveResult<()> {
        let stream_id = stream_id.into();
        let local_identity = local_identity.into();

        if !is_valid_identifier(&stream_id) {
            return Err(LiveError::invalid_state(format!(
                "invalid stream id {stream_id:?}"
            )));
        }
        if !is_valid_identifier(&local_identity) {
            return Err(LiveError::invalid_state(format!(
                "invalid local identity {local_identity:?}"
            )));
        }
        if role == StreamRole::Host && local_media.is_empty() {
            return Err(LiveError::MediaUnavailable(
                "a host session needs at least one local track".to_string(),
            ));
        }

        let (Some((mut channel, mut manager)), Some(status), Some(events)) = (
            self.parts.take(),
            self.status_tx.take(),
            self.events_tx.take(),
        ) else {
            return Err(LiveError::invalid_state("session already started"));
        };
        let Some(reports) = manager.take_reports() else {
            return Err(LiveError::invalid_state("peer manager already in use"));
        };

        let channel_events = match channel.connect(&stream_id, role, &local_identity) {
            Ok(rx) => rx,
            Err(e) => {
                self.parts = Some((channel, manager));
                self.status_tx = Some(status);
                self.events_tx = Some(events);
                return Err(e);
            }
        };
        manager.bind(role, stream_id.clone(), local_media.clone());

        info!(
            "Starting {} session for stream {} as {}",
            role, stream_id, local_identity
        );
        status.send_modify(|s| {
            s.lifecycle = Lifecycle::Connecting;
            s.role = Some(role);
            s.stream_id = Some(stream_id.clone());
            s.connection_status = ConnectionStatus::Connecting;
            s.last_error = None;
        });
        let _ = events.send(SessionEvent::LifecycleChanged(Lifecycle::Connecting));

        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = SessionActor {
            role,
            stream_id,
            channel,
            manager,
            media: local_media,
            link_close_timeout: self.config.link_close_timeout,
            status,
            events,
            has_connected: false,
        };
        self.commands = Some(commands);
        self.task = Some(tokio::spawn(actor.run(
            commands_rx,
            channel_events,
            reports,
        )));
        Ok(())
    }

    /// Ends the session: notifies the relay, closes every link, then the channel.
    pub async fn stop(&mut self) -> LiveResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if let Some(commands) = self.commands.take() {
            let (ack, done) = oneshot::channel();
            if commands.send(Command::Stop(ack)).await.is_ok() {
                let _ = done.await;
            }
        }
        task.await
            .map_err(|e| LiveError::invalid_state(format!("session task failed: {e}")))
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// A fresh subscription to session events, starting now.
    ///
    /// Ends once the session has ended. A subscriber that falls behind
    /// skips the events it missed.
    pub fn events(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        futures::stream::unfold(self.events_rx.resubscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session event subscriber lagged, skipped {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Media received from `participant`, if a link to it exists.
    pub async fn remote_stream(&self, participant: &str) -> Option<MediaStreamHandle> {
        let commands = self.commands.as_ref()?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::RemoteStream(participant.to_string(), reply))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Connection ids of the live peer links.
    pub async fn participants(&self) -> Vec<ConnectionId> {
        let Some(commands) = self.commands.as_ref() else {
            return Vec::new();
        };
        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Participants(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct SessionActor {
    role: StreamRole,
    stream_id: String,
    channel: SignalingChannel,
    manager: PeerManager,
    media: LocalMedia,
    link_close_timeout: Duration,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    has_connected: bool,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut reports: mpsc::UnboundedReceiver<LinkReport>,
    ) {
        let mut stop_ack = None;
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop(ack)) => {
                        stop_ack = Some(ack);
                        break;
                    }
                    Some(Command::RemoteStream(peer, reply)) => {
                        let _ = reply.send(self.manager.remote_stream(&peer));
                    }
                    Some(Command::Participants(reply)) => {
                        let _ = reply.send(self.manager.participants());
                    }
                    None => {
                        debug!("Session controller dropped, shutting down");
                        break;
                    }
                },
                event = channel_events.recv() => match event {
                    Some(event) => {
                        if self.on_channel_event(event) == Flow::Stop {
                            break;
                        }
                    }
                    None => {
                        error!("Signaling channel task ended unexpectedly");
                        self.set_error("signaling channel closed".to_string());
                        break;
                    }
                },
                Some(report) = reports.recv() => {
                    let mut fx = Effects::default();
                    self.manager.handle_report(report, &mut fx);
                    self.apply(fx);
                }
            }
        }

        self.shutdown().await;
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) -> Flow {
        let mut fx = Effects::default();
        let flow = match event {
            ChannelEvent::Connected { connection_id } => {
                self.manager.set_local_id(connection_id.clone());
                let reconnect = self.has_connected;
                self.has_connected = true;
                self.status.send_modify(|s| {
                    s.connection_status = ConnectionStatus::Connected;
                    s.local_connection_id = Some(connection_id.clone());
                    if s.lifecycle == Lifecycle::Connecting {
                        s.lifecycle = Lifecycle::Live;
                    }
                });
                if reconnect {
                    info!("Signaling restored as {}", connection_id);
                    self.manager.resume(&mut fx);
                } else {
                    fx.events.push(SessionEvent::LifecycleChanged(Lifecycle::Live));
                }
                fx.events
                    .insert(0, SessionEvent::ChannelConnected { connection_id });
                Flow::Continue
            }
            ChannelEvent::Disconnected { reason } => {
                self.manager.pause();
                self.status.send_modify(|s| {
                    s.connection_status = ConnectionStatus::Reconnecting;
                });
                fx.events.push(SessionEvent::ChannelDisconnected { reason });
                Flow::Continue
            }
            ChannelEvent::GaveUp { attempts, reason } => {
                let message = format!(
                    "signaling relay unreachable after {attempts} attempts: {reason}"
                );
                error!("{}", message);
                fx.events.push(SessionEvent::Error { message });
                Flow::Stop
            }
            ChannelEvent::Message(message) => self.on_message(message, &mut fx),
        };
        self.apply(fx);
        flow
    }

    fn on_message(&mut self, message: SignalMessage, fx: &mut Effects) -> Flow {
        match message {
            SignalMessage::ViewerJoined {
                stream_id,
                viewer_id,
                viewer_connection_id,
            } if stream_id == self.stream_id => {
                self.manager
                    .participant_joined(viewer_connection_id, viewer_id, fx);
            }
            SignalMessage::ViewerLeft {
                stream_id,
                viewer_connection_id,
            } if stream_id == self.stream_id => {
                self.manager.participant_left(&viewer_connection_id, fx);
            }
            msg @ (SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. }) => {
                self.manager.route(msg, fx);
            }
            SignalMessage::StreamEnded { stream_id } if stream_id == self.stream_id => {
                if self.role == StreamRole::Viewer {
                    info!("Host ended stream {}", stream_id);
                    fx.events.push(SessionEvent::StreamEnded);
                    return Flow::Stop;
                }
                debug!("Ignoring stream-ended on the host side");
            }
            SignalMessage::Error { code, message } => {
                warn!("Relay error: {}", message);
                fx.events.push(SessionEvent::Error {
                    message: message.clone(),
                });
                if self.role == StreamRole::Viewer && code == Some(STREAM_NOT_FOUND) {
                    return Flow::Stop;
                }
            }
            other => {
                debug!(
                    "Ignoring {} for stream {:?}",
                    other.kind(),
                    other.stream_id()
                );
            }
        }
        Flow::Continue
    }

    fn apply(&mut self, fx: Effects) {
        let Effects { outgoing, events } = fx;
        for message in outgoing {
            let kind = message.kind();
            if let Err(e) = self.channel.send(message) {
                warn!("Failed to queue {}: {}", kind, e);
            }
        }

        let count = self.manager.participant_count();
        self.status.send_if_modified(|s| {
            let changed = s.participant_count != count;
            s.participant_count = count;
            changed
        });
        for event in events {
            if let SessionEvent::Error { message } = &event {
                self.set_error(message.clone());
            }
            let _ = self.events.send(event);
        }
    }

    fn set_error(&self, message: String) {
        self.status.send_modify(|s| s.last_error = Some(message));
    }

    async fn shutdown(&mut self) {
        if self.channel.is_connected() {
            let farewell = match self.role {
                StreamRole::Host => SignalMessage::EndStream {
                    stream_id: self.stream_id.clone(),
                },
                StreamRole::Viewer => SignalMessage::LeaveStream {
                    stream_id: self.stream_id.clone(),
                },
            };
            if let Err(e) = self.channel.send(farewell) {
                debug!("Could not notify relay of shutdown: {}", e);
            }
        }

        let mut fx = Effects::default();
        let handles = self.manager.close_all(&mut fx);
        self.apply(fx);
        if !handles.is_empty()
            && tokio::time::timeout(
                self.link_close_timeout,
                futures::future::join_all(handles),
            )
            .await
            .is_err()
        {
            warn!("Peer links did not close within {:?}", self.link_close_timeout);
        }

        self.channel.disconnect().await;
        self.media.stop_all();

        self.status.send_modify(|s| {
            s.lifecycle = Lifecycle::Ended;
            s.connection_status = ConnectionStatus::Disconnected;
            s.participant_count = 0;
        });
        let _ = self
            .events
            .send(SessionEvent::LifecycleChanged(Lifecycle::Ended));
        info!("Session for stream {} ended", self.stream_id);
    }
}
