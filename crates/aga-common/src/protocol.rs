//! Signaling wire protocol shared by stream participants and the relay.
//!
//! Every frame is a JSON object tagged by `type`. Negotiation messages
//! (`offer`, `answer`, `ice-candidate`) carry a `peer` field: the target
//! connection when a client sends it, rewritten by the relay to the
//! sender's connection before delivery.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Relay-assigned identity of one signaling socket.
///
/// Distinct from the stable application user id: a user that reconnects
/// gets a new connection id.
pub type ConnectionId = String;

/// Which side of a stream a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Host,
    Viewer,
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamRole::Host => f.write_str("host"),
            StreamRole::Viewer => f.write_str("viewer"),
        }
    }
}

/// Session description type, mirrors `RTCSdpType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Opaque negotiated-capabilities payload (`RTCSessionDescriptionInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Opaque connectivity-path descriptor (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Control message exchanged over the signaling socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// First frame from the relay: the connection id assigned to this socket.
    Welcome { connection_id: ConnectionId },

    /// Host announces (or re-announces) a stream.
    StartStream { stream_id: String, host_id: String },

    /// Viewer asks to join a running stream.
    JoinStream { stream_id: String, viewer_id: String },

    /// Viewer leaves without closing its socket.
    LeaveStream { stream_id: String },

    /// Host ends the stream for everyone.
    EndStream { stream_id: String },

    /// Relay -> host: a viewer joined.
    ViewerJoined {
        stream_id: String,
        viewer_id: String,
        viewer_connection_id: ConnectionId,
    },

    /// Relay -> host: a viewer left or disconnected.
    ViewerLeft {
        stream_id: String,
        viewer_connection_id: ConnectionId,
    },

    Offer {
        stream_id: String,
        peer: ConnectionId,
        sdp: SessionDescription,
    },

    Answer {
        stream_id: String,
        peer: ConnectionId,
        sdp: SessionDescription,
    },

    IceCandidate {
        stream_id: String,
        peer: ConnectionId,
        candidate: IceCandidate,
    },

    /// Relay -> viewers: the host ended the stream or went away.
    StreamEnded { stream_id: String },

    /// Generic error message from the relay.
    Error {
        #[serde(default)]
        code: Option<u16>,
        message: String,
    },
}

impl SignalMessage {
    /// Wire name of the message, as found in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Welcome { .. } => "welcome",
            SignalMessage::StartStream { .. } => "start-stream",
            SignalMessage::JoinStream { .. } => "join-stream",
            SignalMessage::LeaveStream { .. } => "leave-stream",
            SignalMessage::EndStream { .. } => "end-stream",
            SignalMessage::ViewerJoined { .. } => "viewer-joined",
            SignalMessage::ViewerLeft { .. } => "viewer-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::StreamEnded { .. } => "stream-ended",
            SignalMessage::Error { .. } => "error",
        }
    }

    /// Peer connection id of a negotiation message.
    pub fn peer(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { peer, .. }
            | SignalMessage::Answer { peer, .. }
            | SignalMessage::IceCandidate { peer, .. } => Some(peer),
            _ => None,
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        match self {
            SignalMessage::StartStream { stream_id, .. }
            | SignalMessage::JoinStream { stream_id, .. }
            | SignalMessage::LeaveStream { stream_id }
            | SignalMessage::EndStream { stream_id }
            | SignalMessage::ViewerJoined { stream_id, .. }
            | SignalMessage::ViewerLeft { stream_id, .. }
            | SignalMessage::Offer { stream_id, .. }
            | SignalMessage::Answer { stream_id, .. }
            | SignalMessage::IceCandidate { stream_id, .. }
            | SignalMessage::StreamEnded { stream_id } => Some(stream_id),
            SignalMessage::Welcome { .. } | SignalMessage::Error { .. } => None,
        }
    }

    /// Replace the `peer` of a negotiation message.
    ///
    /// The relay uses this to turn a target into a source before forwarding.
    pub fn with_peer(self, new_peer: ConnectionId) -> Self {
        match self {
            SignalMessage::Offer { stream_id, sdp, .. } => SignalMessage::Offer {
                stream_id,
                peer: new_peer,
                sdp,
            },
            SignalMessage::Answer { stream_id, sdp, .. } => SignalMessage::Answer {
                stream_id,
                peer: new_peer,
                sdp,
            },
            SignalMessage::IceCandidate {
                stream_id,
                candidate,
                ..
            } => SignalMessage::IceCandidate {
                stream_id,
                peer: new_peer,
                candidate,
            },
            other => other,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SignalMessage::Error {
            code: None,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
