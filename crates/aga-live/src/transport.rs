//! Seam between the negotiation core and the media stack.
//!
//! The core never touches a peer connection directly. A [`PeerConnector`]
//! builds one [`PeerTransport`] per peer link; the transport reports its
//! asynchronous happenings (gathered candidates, connection state, remote
//! tracks) through the [`TransportEvents`] it was given.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use aga_common::{ConnectionId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LiveResult;
use crate::link::{LinkReport, ReportBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A media track handle, local or remote.
pub trait MediaTrack: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Stops capture. Only meaningful for local tracks.
    fn stop(&self) {}

    /// Lets a transport recover its own concrete track type.
    fn as_any(&self) -> &dyn Any;
}

/// Locally captured tracks shared read-only by every peer link.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Arc<Vec<Arc<dyn MediaTrack>>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            tracks: Arc::new(tracks),
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn stop_all(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

/// Remote tracks received from one participant.
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    pub participant: ConnectionId,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

/// Connection state as reported by the media stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    TrackAdded(Arc<dyn MediaTrack>),
}

/// Sink a transport uses to report events for its link.
///
/// Every event is stamped with the link generation so the session can
/// discard events of links that were already replaced.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    peer: ConnectionId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkReport>,
}

impl TransportEvents {
    pub(crate) fn new(
        peer: ConnectionId,
        generation: u64,
        tx: mpsc::UnboundedSender<LinkReport>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns false once the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LinkReport {
                peer: self.peer.clone(),
                generation: self.generation,
                body: ReportBody::Transport(event),
            })
            .is_ok()
    }
}

/// One peer connection as seen by the negotiation core.
///
/// Calls are issued strictly one at a time by the link worker.
#[async_trait]
pub trait PeerTransport: Send {
    async fn add_local_tracks(&mut self, media: &LocalMedia) -> LiveResult<()>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&mut self) -> LiveResult<SessionDescription>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&mut self) -> LiveResult<SessionDescription>;

    async fn set_remote_description(&mut self, desc: SessionDescription) -> LiveResult<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> LiveResult<()>;

    /// Discards a local offer that lost a glare.
    async fn rollback(&mut self) -> LiveResult<()>;

    async fn close(&mut self) -> LiveResult<()>;
}

/// Factory of peer transports.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        peer: &str,
        events: TransportEvents,
    ) -> LiveResult<Box<dyn PeerTransport>>;
}
