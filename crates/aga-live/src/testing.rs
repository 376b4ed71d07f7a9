//! In-memory stand-ins for the relay and the media stack.
//!
//! Enabled for unit tests and through the `test-util` feature for
//! integration tests.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use aga_common::{IceCandidate, SessionDescription, SignalMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{RelayConnector, RelayLink};
use crate::error::{LiveError, LiveResult};
use crate::transport::{
    LocalMedia, MediaTrack, PeerConnector, PeerTransport, TrackKind, TransportEvents,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn video(id: impl Into<String>) -> Arc<dyn MediaTrack> {
        Self::new(id, TrackKind::Video)
    }

    pub fn audio(id: impl Into<String>) -> Arc<dyn MediaTrack> {
        Self::new(id, TrackKind::Audio)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Operation recorded by a [`FakeTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOp {
    AddTracks(usize),
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Rollback,
    Close,
}

#[derive(Default)]
struct FakeState {
    ops: HashMap<String, Vec<TransportOp>>,
    events: HashMap<String, TransportEvents>,
    failures: HashMap<String, HashSet<&'static str>>,
    refuse: HashSet<String>,
    delay: Option<Duration>,
}

/// Peer connector whose transports only record what they are asked to do.
///
/// Tests drive the transport side by hand through [`FakeConnector::events`].
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to description operations.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = Some(delay);
    }

    /// Makes the named operation fail for `peer`.
    pub fn fail_on(&self, peer: &str, op: &'static str) {
        lock(&self.state)
            .failures
            .entry(peer.to_string())
            .or_default()
            .insert(op);
    }

    /// Makes building a transport for `peer` fail.
    pub fn refuse(&self, peer: &str) {
        lock(&self.state).refuse.insert(peer.to_string());
    }

    pub fn ops(&self, peer: &str) -> Vec<TransportOp> {
        lock(&self.state).ops.get(peer).cloned().unwrap_or_default()
    }

    /// Event sink of the latest transport built for `peer`.
    pub fn events(&self, peer: &str) -> Option<TransportEvents> {
        lock(&self.state).events.get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = lock(&self.state).events.keys().cloned().collect();
        peers.sort();
        peers
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        peer: &str,
        events: TransportEvents,
    ) -> LiveResult<Box<dyn PeerTransport>> {
        let mut state = lock(&self.state);
        if state.refuse.contains(peer) {
            return Err(LiveError::transport(format!("refused to connect {peer}")));
        }
        state.events.insert(peer.to_string(), events);
        state.ops.insert(peer.to_string(), Vec::new());
        Ok(Box::new(FakeTransport {
            peer: peer.to_string(),
            state: self.state.clone(),
            offers: 0,
        }))
    }
}

pub struct FakeTransport {
    peer: String,
    state: Arc<Mutex<FakeState>>,
    offers: u32,
}

impl FakeTransport {
    async fn run(&self, op: TransportOp, name: &'static str, delayed: bool) -> LiveResult<()> {
        let delay = lock(&self.state).delay.filter(|_| delayed);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        if state
            .failures
            .get(&self.peer)
            .is_some_and(|ops| ops.contains(name))
        {
            return Err(LiveError::transport(format!("{name} failed")));
        }
        state.ops.entry(self.peer.clone()).or_default().push(op);
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_local_tracks(&mut self, media: &LocalMedia) -> LiveResult<()> {
        self.run(TransportOp::AddTracks(media.tracks().len()), "add_local_tracks", false)
            .await
    }

    async fn create_offer(&mut self) -> LiveResult<SessionDescription> {
        self.run(TransportOp::CreateOffer, "create_offer", true).await?;
        self.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.peer, self.offers
        )))
    }

    async fn create_answer(&mut self) -> LiveResult<SessionDescription> {
        self.run(TransportOp::CreateAnswer, "create_answer", true).await?;
        Ok(SessionDescription::answer(format!("answer-{}", self.peer)))
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> LiveResult<()> {
        self.run(TransportOp::SetRemote(desc), "set_remote_description", true)
            .await
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> LiveResult<()> {
        self.run(TransportOp::AddCandidate(candidate), "add_ice_candidate", false)
            .await
    }

    async fn rollback(&mut self) -> LiveResult<()> {
        self.run(TransportOp::Rollback, "rollback", false).await
    }

    async fn close(&mut self) -> LiveResult<()> {
        self.run(TransportOp::Close, "close", false).await
    }
}

/// Test end of one dialed relay connection.
///
/// Dropping it closes the connection as seen by the client.
pub struct RelaySide {
    to_client: mpsc::Sender<SignalMessage>,
    from_client: mpsc::Receiver<SignalMessage>,
}

impl RelaySide {
    pub async fn send(&self, message: SignalMessage) {
        let _ = self.to_client.send(message).await;
    }

    pub async fn welcome(&self, connection_id: &str) {
        self.send(SignalMessage::Welcome {
            connection_id: connection_id.to_string(),
        })
        .await;
    }

    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalMessage> {
        self.from_client.try_recv().ok()
    }
}

/// Relay connector handing every dialed connection to the test.
#[derive(Clone)]
pub struct MemoryConnector {
    sides: mpsc::UnboundedSender<RelaySide>,
    refuse_next: Arc<Mutex<u32>>,
    dials: Arc<Mutex<u32>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelaySide>) {
        let (sides, sides_rx) = mpsc::unbounded_channel();
        (
            Self {
                sides,
                refuse_next: Arc::new(Mutex::new(0)),
                dials: Arc::new(Mutex::new(0)),
            },
            sides_rx,
        )
    }

    /// Fails the next `count` dials.
    pub fn refuse_next(&self, count: u32) {
        *lock(&self.refuse_next) = count;
    }

    pub fn dial_count(&self) -> u32 {
        *lock(&self.dials)
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn dial(&self) -> LiveResult<RelayLink> {
        *lock(&self.dials) += 1;
        {
            let mut refuse = lock(&self.refuse_next);
            if *refuse > 0 {
                *refuse -= 1;
                return Err(LiveError::transport("relay unreachable"));
            }
        }

        let (to_client, inbound) = mpsc::channel(64);
        let (outbound, from_client) = mpsc::channel(64);
        self.sides
            .send(RelaySide {
                to_client,
                from_client,
            })
            .map_err(|_| LiveError::transport("memory relay is gone"))?;
        Ok(RelayLink { outbound, inbound })
    }
}
