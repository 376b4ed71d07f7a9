//! WebRTC peer transport backed by webrtc-rs.

use std::any::Any;
use std::sync::Arc;

use aga_common::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{LiveError, LiveResult};
use crate::transport::{
    LocalMedia, MediaTrack, PeerConnector, PeerTransport, TrackKind, TransportEvent,
    TransportEvents, TransportState,
};

/// Builds one `RTCPeerConnection` per peer link.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(stun_urls: Vec<String>) -> LiveResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(LiveError::transport)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(LiveError::transport)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers: stun_urls,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer: &str,
        events: TransportEvents,
    ) -> LiveResult<Box<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(LiveError::transport)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!("Peer {} connection state: {}", events.peer(), state);
                if let Some(state) = map_state(state) {
                    events.emit(TransportEvent::StateChanged(state));
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let remote = RtcRemoteTrack::new(track);
                debug!("Peer {} added {} track {}", events.peer(), remote.kind, remote.id);
                events.emit(TransportEvent::TrackAdded(Arc::new(remote)));
            })
        }));

        Ok(Box::new(RtcTransport { pc }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(desc: SessionDescription) -> LiveResult<RTCSessionDescription> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => return rollback_description(),
    }
    .map_err(LiveError::transport)
}

fn rollback_description() -> LiveResult<RTCSessionDescription> {
    serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
        .map_err(LiveError::transport)
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_local_tracks(&mut self, media: &LocalMedia) -> LiveResult<()> {
        for track in media.tracks() {
            let Some(local) = track.as_any().downcast_ref::<RtcLocalTrack>() else {
                warn!("Track {} is not backed by webrtc, skipping", track.id());
                continue;
            };
            let sample: Arc<dyn TrackLocal + Send + Sync> = local.sample.clone();
            self.pc
                .add_track(sample)
                .await
                .map_err(LiveError::transport)?;
        }
        Ok(())
    }

    async fn create_offer(&mut self) -> LiveResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(LiveError::transport)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(LiveError::transport)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> LiveResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(LiveError::transport)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(LiveError::transport)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> LiveResult<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(LiveError::transport)
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> LiveResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(LiveError::transport)
    }

    async fn rollback(&mut self) -> LiveResult<()> {
        self.pc
            .set_local_description(rollback_description()?)
            .await
            .map_err(LiveError::transport)
    }

    async fn close(&mut self) -> LiveResult<()> {
        self.pc.close().await.map_err(LiveError::transport)
    }
}

/// A locally produced track fed with encoded samples.
pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    sample: Arc<TrackLocalStaticSample>,
}

impl RtcLocalTrack {
    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        Self::with_mime(id.into(), stream_id.into(), TrackKind::Video, MIME_TYPE_VP8)
    }

    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Arc<Self> {
        Self::with_mime(id.into(), stream_id.into(), TrackKind::Audio, MIME_TYPE_OPUS)
    }

    fn with_mime(id: String, stream_id: String, kind: TrackKind, mime: &str) -> Arc<Self> {
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_string(),
                ..Default::default()
            },
            id.clone(),
            stream_id,
        ));
        Arc::new(Self { id, kind, sample })
    }

    /// The sample sink encoded media is written to.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.sample.clone()
    }
}

impl std::fmt::Debug for RtcLocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcLocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A track received from a peer.
pub struct RtcRemoteTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
}

impl RtcRemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            id: track.id().to_string(),
            kind,
            track,
        }
    }

    /// Source of received RTP packets.
    pub fn remote(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl std::fmt::Debug for RtcRemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcRemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for RtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
