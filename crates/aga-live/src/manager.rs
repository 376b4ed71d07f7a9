//! The set of peer links of one session.
//!
//! [`PeerManager`] is driven by the session loop only, so it needs no
//! locking. Methods take an [`Effects`] collector for the signaling
//! messages to send and the events to publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aga_common::{ConnectionId, SdpType, SignalMessage, StreamRole};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::event::SessionEvent;
use crate::link::{LinkOutcome, LinkReport, LinkSpec, PeerLink, ReportBody};
use crate::negotiation::{Action, NegotiationRole, NegotiationState};
use crate::transport::{
    LocalMedia, MediaStreamHandle, PeerConnector, TransportEvent, TransportState,
};

/// Output of a manager call.
#[derive(Debug, Default)]
pub struct Effects {
    pub outgoing: Vec<SignalMessage>,
    pub events: Vec<SessionEvent>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Binding {
    role: StreamRole,
    stream_id: String,
    media: LocalMedia,
}

pub struct PeerManager {
    connector: Arc<dyn PeerConnector>,
    negotiation_timeout: Duration,
    binding: Option<Binding>,
    local_id: Option<ConnectionId>,
    links: HashMap<ConnectionId, PeerLink>,
    next_generation: u64,
    paused: bool,
    /// Relay id held when signaling went down.
    paused_as: Option<ConnectionId>,
    reports_tx: mpsc::UnboundedSender<LinkReport>,
    reports_rx: Option<mpsc::UnboundedReceiver<LinkReport>>,
}

impl PeerManager {
    pub fn new(connector: Arc<dyn PeerConnector>, config: &LiveConfig) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            negotiation_timeout: config.negotiation_timeout,
            binding: None,
            local_id: None,
            links: HashMap::new(),
            next_generation: 0,
            paused: false,
            paused_as: None,
            reports_tx,
            reports_rx: Some(reports_rx),
        }
    }

    /// Receiver of link reports. Can be taken once.
    pub fn take_reports(&mut self) -> Option<mpsc::UnboundedReceiver<LinkReport>> {
        self.reports_rx.take()
    }

    pub fn bind(&mut self, role: StreamRole, stream_id: impl Into<String>, media: LocalMedia) {
        self.binding = Some(Binding {
            role,
            stream_id: stream_id.into(),
            media,
        });
    }

    /// Records the relay-assigned id of the local socket.
    pub fn set_local_id(&mut self, id: ConnectionId) {
        self.local_id = Some(id);
    }

    pub fn participant_count(&self) -> usize {
        self.links.len()
    }

    pub fn participants(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn state_of(&self, peer: &str) -> Option<NegotiationState> {
        self.links.get(peer).map(|link| link.negotiation.state())
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn remote_stream(&self, peer: &str) -> Option<MediaStreamHandle> {
        self.links.get(peer).map(|link| MediaStreamHandle {
            participant: peer.to_string(),
            tracks: link.remote_tracks.clone(),
        })
    }

    /// Host side: a viewer joined, start offering to it.
    pub fn participant_joined(&mut self, peer: ConnectionId, user_id: String, fx: &mut Effects) {
        if self.role() != Some(StreamRole::Host) {
            warn!("Ignoring viewer-joined for {} outside of a host session", peer);
            return;
        }
        if self.links.contains_key(&peer) {
            warn!("Duplicate join for {} ignored", peer);
            return;
        }

        info!("Viewer {} ({}) joined", user_id, peer);
        fx.events.push(SessionEvent::ParticipantJoined {
            peer: peer.clone(),
            user_id,
        });
        self.insert_link(peer.clone(), NegotiationRole::Offerer);
        self.with_link(&peer, fx, |link| link.negotiation.start());
    }

    pub fn participant_left(&mut self, peer: &str, fx: &mut Effects) {
        match self.links.remove(peer) {
            Some(link) => {
                info!("Participant {} left", peer);
                drop(link.shutdown());
                fx.events.push(SessionEvent::ParticipantLeft {
                    peer: peer.to_string(),
                });
            }
            None => warn!("{}", LiveError::UnknownPeerReference(peer.to_string())),
        }
    }

    /// Dispatches an offer, answer or candidate to its link.
    pub fn route(&mut self, message: SignalMessage, fx: &mut Effects) {
        let Some(bound) = self.binding.as_ref().map(|b| b.stream_id.clone()) else {
            debug!("Dropping {} before the session is bound", message.kind());
            return;
        };
        if message.stream_id() != Some(bound.as_str()) {
            warn!(
                "{}",
                LiveError::Protocol(format!(
                    "{} for stream {:?}, bound to {}",
                    message.kind(),
                    message.stream_id(),
                    bound
                ))
            );
            return;
        }

        match message {
            SignalMessage::Offer { peer, sdp, .. } => {
                if sdp.sdp_type != SdpType::Offer {
                    warn!(
                        "{}",
                        LiveError::Protocol(format!(
                            "offer from {} carries a {:?} description",
                            peer, sdp.sdp_type
                        ))
                    );
                    return;
                }
                if self.role() == Some(StreamRole::Viewer) {
                    self.prepare_answerer(&peer, fx);
                }
                if !self.links.contains_key(&peer) {
                    warn!("{}", LiveError::UnknownPeerReference(peer));
                    return;
                }
                self.with_link(&peer, fx, |link| link.negotiation.remote_description(sdp));
            }
            SignalMessage::Answer { peer, sdp, .. } => {
                if !self.links.contains_key(&peer) {
                    warn!("{}", LiveError::UnknownPeerReference(peer));
                    return;
                }
                self.with_link(&peer, fx, |link| link.negotiation.remote_description(sdp));
            }
            SignalMessage::IceCandidate {
                peer, candidate, ..
            } => {
                if !self.links.contains_key(&peer) {
                    warn!("{}", LiveError::UnknownPeerReference(peer));
                    return;
                }
                self.with_link(&peer, fx, |link| {
                    link.negotiation.remote_candidate(candidate)
                });
            }
            other => debug!("{} is not a negotiation message", other.kind()),
        }
    }

    /// Viewer side: make sure an answering link for `peer` is ready.
    ///
    /// The viewer talks to one host. A new host connection id, or a new offer
    /// on a settled link, means the host started over.
    fn prepare_answerer(&mut self, peer: &str, fx: &mut Effects) {
        let stale: Vec<ConnectionId> = self
            .links
            .iter()
            .filter(|(id, link)| {
                id.as_str() != peer
                    || matches!(
                        link.negotiation.state(),
                        NegotiationState::Connected
                            | NegotiationState::Failed
                            | NegotiationState::Closed
                    )
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(link) = self.links.remove(&id) {
                info!("Replacing link {} after a new offer from {}", id, peer);
                drop(link.shutdown());
                fx.events.push(SessionEvent::PeerRemoved {
                    peer: id,
                    reason: "replaced by a new offer".to_string(),
                });
            }
        }

        if !self.links.contains_key(peer) {
            self.insert_link(peer.to_string(), NegotiationRole::Answerer);
            self.with_link(peer, fx, |link| link.negotiation.start());
        }
    }

    pub fn handle_report(&mut self, report: LinkReport, fx: &mut Effects) {
        let LinkReport {
            peer,
            generation,
            body,
        } = report;
        match self.links.get(&peer) {
            Some(link) if link.generation == generation => {}
            _ => {
                debug!("Discarding stale report for {} (generation {})", peer, generation);
                return;
            }
        }

        match body {
            ReportBody::Transport(TransportEvent::LocalCandidate(candidate)) => {
                self.with_link(&peer, fx, |link| link.negotiation.local_candidate(candidate));
            }
            ReportBody::Transport(TransportEvent::StateChanged(state)) => {
                let paused = self.paused;
                self.with_link(&peer, fx, |link| {
                    if paused && state == TransportState::Connected {
                        debug!("Deferring connected report for {} until signaling resumes", peer);
                        link.deferred_connected = true;
                    } else {
                        link.negotiation.transport_state(state);
                    }
                    Vec::new()
                });
            }
            ReportBody::Transport(TransportEvent::TrackAdded(track)) => {
                if let Some(link) = self.links.get_mut(&peer) {
                    fx.events.push(SessionEvent::RemoteTrack {
                        peer: peer.clone(),
                        track_id: track.id().to_string(),
                        kind: track.kind(),
                    });
                    link.remote_tracks.push(track);
                }
            }
            ReportBody::Outcome(LinkOutcome::LocalDescription(desc)) => {
                self.with_link(&peer, fx, |link| {
                    link.negotiation.local_description_ready(desc)
                });
            }
            ReportBody::Outcome(LinkOutcome::RemoteApplied) => {
                self.with_link(&peer, fx, |link| link.negotiation.remote_applied());
            }
            ReportBody::Outcome(LinkOutcome::Failed(reason)) => {
                let error = LiveError::NegotiationFailed {
                    peer: peer.clone(),
                    reason,
                };
                self.fail_link(&peer, error, fx);
            }
            ReportBody::Timeout => {
                let timed_out = self
                    .links
                    .get_mut(&peer)
                    .map(|link| link.negotiation.timeout())
                    .unwrap_or(false);
                if timed_out {
                    let error = LiveError::NegotiationTimeout {
                        peer: peer.clone(),
                        after: self.negotiation_timeout,
                    };
                    self.fail_link(&peer, error, fx);
                }
            }
        }
    }

    /// Signaling is down: hold back connection reports.
    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Pausing negotiation of {} links", self.links.len());
            self.paused_as = self.local_id.clone();
        }
        self.paused = true;
    }

    /// Signaling is back. Links that connected meanwhile resume, the rest fail.
    ///
    /// Under a new relay id the relay has already dropped our membership and
    /// told the other side, so every link goes, connected or not.
    pub fn resume(&mut self, fx: &mut Effects) {
        if !self.paused {
            return;
        }
        self.paused = false;

        if self.paused_as.take() != self.local_id {
            self.remove_all("signaling session replaced", fx);
            return;
        }

        for peer in self.participants() {
            let resumed = self.with_link(&peer, fx, |link| {
                if link.deferred_connected {
                    link.deferred_connected = false;
                    link.negotiation.transport_state(TransportState::Connected);
                }
                Vec::new()
            });
            if resumed != Some(NegotiationState::Connected) {
                let error = LiveError::NegotiationFailed {
                    peer: peer.clone(),
                    reason: "signaling channel was lost during negotiation".to_string(),
                };
                self.fail_link(&peer, error, fx);
            }
        }
    }

    fn remove_all(&mut self, reason: &str, fx: &mut Effects) {
        if !self.links.is_empty() {
            info!("Dropping {} peer links: {}", self.links.len(), reason);
        }
        for peer in self.participants() {
            if let Some(link) = self.links.remove(&peer) {
                drop(link.shutdown());
                fx.events.push(SessionEvent::PeerStateChanged {
                    peer: peer.clone(),
                    state: NegotiationState::Closed,
                });
                fx.events.push(SessionEvent::PeerRemoved {
                    peer,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Tears down every link. Handles complete when the transports are closed.
    pub fn close_all(&mut self, fx: &mut Effects) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.links.len());
        for (peer, link) in self.links.drain() {
            debug!("Closing link {}", peer);
            fx.events.push(SessionEvent::PeerStateChanged {
                peer,
                state: NegotiationState::Closed,
            });
            handles.extend(link.shutdown());
        }
        handles
    }

    fn role(&self) -> Option<StreamRole> {
        self.binding.as_ref().map(|b| b.role)
    }

    fn insert_link(&mut self, peer: ConnectionId, role: NegotiationRole) {
        self.next_generation += 1;
        let spec = LinkSpec {
            role,
            local_id: self.local_id.clone().unwrap_or_default(),
            peer: peer.clone(),
            generation: self.next_generation,
            timeout: self.negotiation_timeout,
        };
        let media = self
            .binding
            .as_ref()
            .filter(|b| b.role == StreamRole::Host)
            .map(|b| b.media.clone())
            .unwrap_or_default();
        let link = PeerLink::spawn(spec, self.connector.clone(), media, self.reports_tx.clone());
        self.links.insert(peer, link);
    }

    /// Runs `f` on a link, carries out the actions it returns and publishes
    /// the resulting state changes. Returns the state the link ended in.
    fn with_link<F>(&mut self, peer: &str, fx: &mut Effects, f: F) -> Option<NegotiationState>
    where
        F: FnOnce(&mut PeerLink) -> Vec<Action>,
    {
        let stream_id = self.binding.as_ref()?.stream_id.clone();
        let link = self.links.get_mut(peer)?;

        let actions = f(link);
        let mut pending = link.dispatch(actions);
        while !pending.is_empty() {
            let mut next = Vec::new();
            for action in pending {
                match action {
                    Action::SendOffer(sdp) => {
                        fx.outgoing.push(SignalMessage::Offer {
                            stream_id: stream_id.clone(),
                            peer: peer.to_string(),
                            sdp,
                        });
                        next.extend(link.negotiation.description_sent());
                    }
                    Action::SendAnswer(sdp) => {
                        fx.outgoing.push(SignalMessage::Answer {
                            stream_id: stream_id.clone(),
                            peer: peer.to_string(),
                            sdp,
                        });
                        next.extend(link.negotiation.description_sent());
                    }
                    Action::SendCandidate(candidate) => {
                        fx.outgoing.push(SignalMessage::IceCandidate {
                            stream_id: stream_id.clone(),
                            peer: peer.to_string(),
                            candidate,
                        });
                    }
                    transport_action => next.push(transport_action),
                }
            }
            pending = link.dispatch(next);
        }

        for (_, state) in link.negotiation.take_transitions() {
            fx.events.push(SessionEvent::PeerStateChanged {
                peer: peer.to_string(),
                state,
            });
        }

        let state = link.negotiation.state();
        match state {
            NegotiationState::Connected => {
                link.cancel_timer();
                info!("Peer link {} connected", peer);
            }
            NegotiationState::Failed => {
                let error = LiveError::NegotiationFailed {
                    peer: peer.to_string(),
                    reason: "transport failed".to_string(),
                };
                self.remove_failed(peer, error, fx);
            }
            NegotiationState::Closed => {
                if let Some(link) = self.links.remove(peer) {
                    drop(link.shutdown());
                }
                fx.events.push(SessionEvent::PeerRemoved {
                    peer: peer.to_string(),
                    reason: "transport closed".to_string(),
                });
            }
            _ => {}
        }
        Some(state)
    }

    fn fail_link(&mut self, peer: &str, error: LiveError, fx: &mut Effects) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        link.negotiation.fail();
        for (_, state) in link.negotiation.take_transitions() {
            fx.events.push(SessionEvent::PeerStateChanged {
                peer: peer.to_string(),
                state,
            });
        }
        self.remove_failed(peer, error, fx);
    }

    fn remove_failed(&mut self, peer: &str, error: LiveError, fx: &mut Effects) {
        if let Some(link) = self.links.remove(peer) {
            warn!("Removing peer link: {}", error);
            drop(link.shutdown());
            fx.events.push(SessionEvent::PeerRemoved {
                peer: peer.to_string(),
                reason: error.to_string(),
            });
            fx.events.push(SessionEvent::Error {
                message: error.to_string(),
            });
        }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for (_, link) in self.links.drain() {
            drop(link.shutdown());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeTrack, TransportOp};
    use aga_common::{IceCandidate, SessionDescription};

    fn host_manager(connector: &FakeConnector) -> PeerManager {
        let mut manager = PeerManager::new(Arc::new(connector.clone()), &LiveConfig::default());
        manager.bind(
            StreamRole::Host,
            "s1",
            LocalMedia::new(vec![FakeTrack::video("cam")]),
        );
        manager.set_local_id("host-conn".into());
        manager
    }

    fn viewer_manager(connector: &FakeConnector) -> PeerManager {
        let mut manager = PeerManager::new(Arc::new(connector.clone()), &LiveConfig::default());
        manager.bind(StreamRole::Viewer, "s1", LocalMedia::default());
        manager.set_local_id("viewer-conn".into());
        manager
    }

    #[tokio::test]
    async fn test_count_follows_joins_and_leaves() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut fx = Effects::default();

        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        manager.participant_joined("b".into(), "user-b".into(), &mut fx);
        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        assert_eq!(manager.participant_count(), 2);

        manager.participant_left("a", &mut fx);
        manager.participant_left("zzz", &mut fx);
        assert_eq!(manager.participant_count(), 1);
        assert_eq!(manager.participants(), vec!["b".to_string()]);

        let handles = manager.close_all(&mut fx);
        assert_eq!(handles.len(), 1);
        assert_eq!(manager.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_viewer_side_rejects_joins() {
        let connector = FakeConnector::new();
        let mut manager = viewer_manager(&connector);
        let mut fx = Effects::default();
        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        assert_eq!(manager.participant_count(), 0);
        assert!(fx.is_empty());
    }

    #[tokio::test]
    async fn test_host_offer_goes_out_after_worker_reports() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut reports = manager.take_reports().unwrap();
        let mut fx = Effects::default();

        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        assert!(fx.outgoing.is_empty());

        let report = reports.recv().await.unwrap();
        manager.handle_report(report, &mut fx);
        assert_eq!(fx.outgoing.len(), 1);
        match &fx.outgoing[0] {
            SignalMessage::Offer { stream_id, peer, sdp } => {
                assert_eq!(stream_id, "s1");
                assert_eq!(peer, "a");
                assert_eq!(sdp.sdp_type, SdpType::Offer);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(manager.state_of("a"), Some(NegotiationState::AwaitingAnswer));
        assert_eq!(
            connector.ops("a")[..2],
            [TransportOp::AddTracks(1), TransportOp::CreateOffer]
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_messages_are_dropped() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut fx = Effects::default();

        manager.route(
            SignalMessage::Answer {
                stream_id: "s1".into(),
                peer: "ghost".into(),
                sdp: SessionDescription::answer("a"),
            },
            &mut fx,
        );
        manager.route(
            SignalMessage::IceCandidate {
                stream_id: "s1".into(),
                peer: "ghost".into(),
                candidate: IceCandidate::new("c"),
            },
            &mut fx,
        );
        assert!(fx.is_empty());
        assert_eq!(manager.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_messages_for_other_streams_are_dropped() {
        let connector = FakeConnector::new();
        let mut manager = viewer_manager(&connector);
        let mut fx = Effects::default();
        manager.route(
            SignalMessage::Offer {
                stream_id: "other".into(),
                peer: "host-conn".into(),
                sdp: SessionDescription::offer("o"),
            },
            &mut fx,
        );
        assert_eq!(manager.participant_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut fx = Effects::default();

        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        manager.participant_left("a", &mut fx);
        manager.participant_joined("a".into(), "user-a".into(), &mut fx);

        let mut fx = Effects::default();
        manager.handle_report(
            LinkReport {
                peer: "a".into(),
                generation: 1,
                body: ReportBody::Outcome(LinkOutcome::Failed("late".into())),
            },
            &mut fx,
        );
        assert!(fx.is_empty());
        assert_eq!(manager.participant_count(), 1);
        assert_eq!(manager.state_of("a"), Some(NegotiationState::New));
    }

    #[tokio::test]
    async fn test_failure_removes_only_that_link() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut fx = Effects::default();
        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        manager.participant_joined("b".into(), "user-b".into(), &mut fx);

        let mut fx = Effects::default();
        manager.handle_report(
            LinkReport {
                peer: "a".into(),
                generation: 1,
                body: ReportBody::Timeout,
            },
            &mut fx,
        );
        assert_eq!(manager.participants(), vec!["b".to_string()]);
        assert!(fx.events.contains(&SessionEvent::PeerStateChanged {
            peer: "a".into(),
            state: NegotiationState::Failed,
        }));
        assert!(fx
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { message } if message.contains("timed out"))));
    }

    #[tokio::test]
    async fn test_resume_fails_links_that_did_not_connect() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut fx = Effects::default();
        manager.participant_joined("a".into(), "user-a".into(), &mut fx);
        manager.pause();
        assert!(manager.is_paused());

        let mut fx = Effects::default();
        manager.resume(&mut fx);
        assert_eq!(manager.participant_count(), 0);
        assert!(fx
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerRemoved { peer, .. } if peer == "a")));
    }

    /// Drives a host link for `peer` through offer and answer.
    async fn answered_link(
        manager: &mut PeerManager,
        reports: &mut mpsc::UnboundedReceiver<LinkReport>,
        peer: &str,
    ) {
        let mut fx = Effects::default();
        manager.participant_joined(peer.into(), format!("user-{peer}"), &mut fx);
        while manager.state_of(peer) != Some(NegotiationState::AwaitingAnswer) {
            let report = reports.recv().await.unwrap();
            manager.handle_report(report, &mut fx);
        }
        manager.route(
            SignalMessage::Answer {
                stream_id: "s1".into(),
                peer: peer.into(),
                sdp: SessionDescription::answer("a"),
            },
            &mut fx,
        );
        while !manager.links[peer].negotiation.is_remote_applied() {
            let report = reports.recv().await.unwrap();
            manager.handle_report(report, &mut fx);
        }
    }

    fn transport_connected(manager: &mut PeerManager, peer: &str, fx: &mut Effects) {
        let generation = manager.links[peer].generation;
        manager.handle_report(
            LinkReport {
                peer: peer.into(),
                generation,
                body: ReportBody::Transport(TransportEvent::StateChanged(
                    TransportState::Connected,
                )),
            },
            fx,
        );
    }

    #[tokio::test]
    async fn test_resume_keeps_links_connected_under_same_id() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut reports = manager.take_reports().unwrap();
        answered_link(&mut manager, &mut reports, "a").await;
        answered_link(&mut manager, &mut reports, "b").await;

        manager.pause();
        let mut fx = Effects::default();
        transport_connected(&mut manager, "a", &mut fx);
        assert_eq!(manager.state_of("a"), Some(NegotiationState::Negotiating));

        let mut fx = Effects::default();
        manager.resume(&mut fx);
        assert_eq!(manager.participants(), vec!["a".to_string()]);
        assert_eq!(manager.state_of("a"), Some(NegotiationState::Connected));
    }

    #[tokio::test]
    async fn test_new_relay_id_drops_connected_links() {
        let connector = FakeConnector::new();
        let mut manager = host_manager(&connector);
        let mut reports = manager.take_reports().unwrap();
        answered_link(&mut manager, &mut reports, "a").await;
        let mut fx = Effects::default();
        transport_connected(&mut manager, "a", &mut fx);
        assert_eq!(manager.state_of("a"), Some(NegotiationState::Connected));

        manager.pause();
        manager.set_local_id("host-conn-2".into());
        let mut fx = Effects::default();
        manager.resume(&mut fx);

        assert_eq!(manager.participant_count(), 0);
        assert!(fx.events.contains(&SessionEvent::PeerRemoved {
            peer: "a".into(),
            reason: "signaling session replaced".into(),
        }));
        assert!(fx.outgoing.is_empty());
    }

    #[tokio::test]
    async fn test_viewer_replaces_settled_link_on_new_offer() {
        let connector = FakeConnector::new();
        let mut manager = viewer_manager(&connector);
        let mut fx = Effects::default();
        let offer = |peer: &str| SignalMessage::Offer {
            stream_id: "s1".into(),
            peer: peer.into(),
            sdp: SessionDescription::offer("o"),
        };

        manager.route(offer("host-1"), &mut fx);
        assert_eq!(manager.participants(), vec!["host-1".to_string()]);
        assert_eq!(
            manager.state_of("host-1"),
            Some(NegotiationState::AwaitingRemoteOffer)
        );

        // Host reconnected under a new connection id.
        manager.route(offer("host-2"), &mut fx);
        assert_eq!(manager.participants(), vec!["host-2".to_string()]);
        assert!(fx.events.contains(&SessionEvent::PeerRemoved {
            peer: "host-1".into(),
            reason: "replaced by a new offer".into(),
        }));
    }

    #[tokio::test]
    async fn test_remote_stream_exposes_received_tracks() {
        let connector = FakeConnector::new();
        let mut manager = viewer_manager(&connector);
        let mut fx = Effects::default();
        manager.route(
            SignalMessage::Offer {
                stream_id: "s1".into(),
                peer: "host-1".into(),
                sdp: SessionDescription::offer("o"),
            },
            &mut fx,
        );
        manager.handle_report(
            LinkReport {
                peer: "host-1".into(),
                generation: 1,
                body: ReportBody::Transport(TransportEvent::TrackAdded(FakeTrack::video("remote-v"))),
            },
            &mut fx,
        );
        let stream = manager.remote_stream("host-1").unwrap();
        assert_eq!(stream.tracks.len(), 1);
        assert_eq!(stream.tracks[0].id(), "remote-v");
        assert!(manager.remote_stream("nobody").is_none());
    }
}
