//! Error taxonomy of the signaling and negotiation core.

use std::time::Duration;

use aga_common::ConnectionId;
use thiserror::Error;

/// Result type alias for the live core.
pub type LiveResult<T> = std::result::Result<T, LiveError>;

#[derive(Debug, Error)]
pub enum LiveError {
    /// The relay connection is down; recoverable through reconnect.
    #[error("signaling channel disconnected")]
    ChannelDisconnected,

    /// A peer link did not reach `Connected` in time. Scoped to that peer.
    #[error("negotiation with {peer} timed out after {after:?}")]
    NegotiationTimeout { peer: ConnectionId, after: Duration },

    /// The transport reported failure or an operation on it failed. Scoped to that peer.
    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: ConnectionId, reason: String },

    /// A message referenced a peer link that does not exist (any more).
    #[error("unknown peer reference: {0}")]
    UnknownPeerReference(ConnectionId),

    /// A host session was started without local media.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    /// Operation not valid in the current lifecycle or role.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Peer transport (media stack) error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Relay sent something that does not fit the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed settings or signaling frames.
    #[error(transparent)]
    Common(#[from] aga_common::Error),
}

impl LiveError {
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn invalid_state(msg: impl std::fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Whether the error only affects a single peer link.
    pub fn is_peer_scoped(&self) -> bool {
        matches!(
            self,
            LiveError::NegotiationTimeout { .. }
                | LiveError::NegotiationFailed { .. }
                | LiveError::UnknownPeerReference(_)
        )
    }
}
