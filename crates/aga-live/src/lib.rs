#![forbid(unsafe_code)]
//! Signaling and peer negotiation core for AGA live streams.
//!
//! One host broadcasts to any number of viewers over direct peer
//! connections. This crate connects both sides to the signaling relay,
//! negotiates one peer link per viewer and exposes the session state:
//!
//! - [`channel`]: reconnecting relay connection carrying [`SignalMessage`]s
//! - [`negotiation`]: per-link offer/answer state machine
//! - [`manager`]: the set of peer links of a session
//! - [`session`]: the controller tying it together
//! - [`transport`]: the seam to the media stack (webrtc-rs with the `rtc` feature)
//!
//! ```no_run
//! # async fn run() -> aga_live::LiveResult<()> {
//! use std::sync::Arc;
//! use aga_live::{LiveConfig, PeerManager, SessionController, SignalingChannel, StreamRole};
//! # fn connector() -> Arc<dyn aga_live::PeerConnector> { unimplemented!() }
//! # let media = aga_live::LocalMedia::default();
//!
//! let config = LiveConfig::from_env()?;
//! let channel = SignalingChannel::from_config(&config);
//! let manager = PeerManager::new(connector(), &config);
//! let mut session = SessionController::new(channel, manager, config);
//! session.start(StreamRole::Host, "stream-1", "host-user", media)?;
//! // ...
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod manager;
pub mod negotiation;
pub mod session;
pub mod transport;

#[cfg(feature = "rtc")]
pub mod rtc;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use aga_common::{ConnectionId, IceCandidate, SessionDescription, SignalMessage, StreamRole};
pub use channel::{ChannelEvent, RelayConnector, RelayLink, SignalingChannel, WebSocketConnector};
pub use config::{LiveConfig, ReconnectPolicy};
pub use error::{LiveError, LiveResult};
pub use event::{ConnectionStatus, Lifecycle, SessionEvent, SessionStatus};
pub use manager::{Effects, PeerManager};
pub use negotiation::{NegotiationRole, NegotiationState};
pub use session::SessionController;
pub use transport::{
    LocalMedia, MediaStreamHandle, MediaTrack, PeerConnector, PeerTransport, TrackKind,
    TransportEvent, TransportEvents, TransportState,
};
