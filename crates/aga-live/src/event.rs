//! What a running session exposes to its observers.

use aga_common::{ConnectionId, StreamRole};

use crate::negotiation::NegotiationState;
use crate::transport::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Connecting,
    Live,
    Ended,
}

/// State of the relay connection as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub lifecycle: Lifecycle,
    pub role: Option<StreamRole>,
    pub stream_id: Option<String>,
    pub connection_status: ConnectionStatus,
    pub participant_count: usize,
    pub last_error: Option<String>,
    pub local_connection_id: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LifecycleChanged(Lifecycle),
    ChannelConnected {
        connection_id: ConnectionId,
    },
    ChannelDisconnected {
        reason: String,
    },
    ParticipantJoined {
        peer: ConnectionId,
        user_id: String,
    },
    ParticipantLeft {
        peer: ConnectionId,
    },
    PeerStateChanged {
        peer: ConnectionId,
        state: NegotiationState,
    },
    /// A link was torn down because it failed or was replaced.
    PeerRemoved {
        peer: ConnectionId,
        reason: String,
    },
    RemoteTrack {
        peer: ConnectionId,
        track_id: String,
        kind: TrackKind,
    },
    /// The host ended the stream (viewer side).
    StreamEnded,
    Error {
        message: String,
    },
}
