//! End-to-end session scenarios against the in-memory relay and fake transports.
//!
//! The test plays the relay: it welcomes the client, injects relay messages
//! and checks what the session sends back.

use std::sync::Arc;
use std::time::Duration;

use aga_live::testing::{FakeConnector, FakeTrack, MemoryConnector, RelaySide, TransportOp};
use aga_live::{
    ConnectionStatus, IceCandidate, Lifecycle, LiveConfig, LocalMedia, MediaTrack, PeerManager,
    ReconnectPolicy, SessionController, SessionDescription, SessionEvent, SessionStatus,
    SignalMessage, SignalingChannel, StreamRole, TrackKind, TransportEvent, TransportState,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(60);

struct Harness {
    session: SessionController,
    peers: FakeConnector,
    relay: MemoryConnector,
    sides: mpsc::UnboundedReceiver<RelaySide>,
}

fn harness(config: LiveConfig) -> Harness {
    let (relay, sides) = MemoryConnector::new();
    let peers = FakeConnector::new();
    let channel = SignalingChannel::new(Arc::new(relay.clone()), &config);
    let manager = PeerManager::new(Arc::new(peers.clone()), &config);
    Harness {
        session: SessionController::new(channel, manager, config),
        peers,
        relay,
        sides,
    }
}

async fn accept(h: &mut Harness, connection_id: &str) -> RelaySide {
    let side = timeout(WAIT, h.sides.recv()).await.unwrap().unwrap();
    side.welcome(connection_id).await;
    side
}

async fn next_message(side: &mut RelaySide) -> SignalMessage {
    timeout(WAIT, side.recv()).await.unwrap().unwrap()
}

async fn wait_status<F>(session: &SessionController, f: F) -> SessionStatus
where
    F: Fn(&SessionStatus) -> bool,
{
    let mut status = session.status();
    let snapshot = timeout(WAIT, status.wait_for(|s| f(s)))
        .await
        .unwrap()
        .unwrap()
        .clone();
    snapshot
}

async fn wait_until<F: Fn() -> bool>(f: F) {
    timeout(WAIT, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn has_op(peers: &FakeConnector, peer: &str, op: &TransportOp) -> bool {
    peers.ops(peer).contains(op)
}

/// Host side of a viewer joining: offer out, answer in, remote applied.
async fn negotiate_viewer(h: &Harness, side: &mut RelaySide, viewer: &str) {
    side.send(SignalMessage::ViewerJoined {
        stream_id: "s1".into(),
        viewer_id: format!("user-{viewer}"),
        viewer_connection_id: viewer.into(),
    })
    .await;

    match next_message(side).await {
        SignalMessage::Offer {
            stream_id,
            peer,
            sdp,
        } => {
            assert_eq!(stream_id, "s1");
            assert_eq!(peer, viewer);
            assert_eq!(sdp, SessionDescription::offer(format!("offer-{viewer}-1")));
        }
        other => panic!("expected offer, got {other:?}"),
    }

    let answer = SessionDescription::answer(format!("answer-from-{viewer}"));
    side.send(SignalMessage::Answer {
        stream_id: "s1".into(),
        peer: viewer.into(),
        sdp: answer.clone(),
    })
    .await;
    let op = TransportOp::SetRemote(answer);
    wait_until(|| has_op(&h.peers, viewer, &op)).await;
}

fn connect_transport(h: &Harness, peer: &str) {
    let events = h.peers.events(peer).unwrap();
    assert!(events.emit(TransportEvent::StateChanged(TransportState::Connected)));
}

fn host_media() -> (LocalMedia, Arc<FakeTrack>) {
    let camera = FakeTrack::new("camera", TrackKind::Video);
    let camera_track: Arc<dyn MediaTrack> = camera.clone();
    let media = LocalMedia::new(vec![camera_track, FakeTrack::audio("mic")]);
    (media, camera)
}

#[tokio::test]
async fn test_host_streams_to_two_viewers_then_stops() {
    let mut h = harness(LiveConfig::default());
    let mut events = Box::pin(h.session.events());
    let (media, camera) = host_media();

    h.session
        .start(StreamRole::Host, "s1", "host-user", media)
        .unwrap();
    let mut side = accept(&mut h, "host-conn").await;
    assert_eq!(
        next_message(&mut side).await,
        SignalMessage::StartStream {
            stream_id: "s1".into(),
            host_id: "host-user".into()
        }
    );
    let live = wait_status(&h.session, |s| s.lifecycle == Lifecycle::Live).await;
    assert_eq!(live.local_connection_id.as_deref(), Some("host-conn"));
    assert_eq!(live.connection_status, ConnectionStatus::Connected);

    negotiate_viewer(&h, &mut side, "A").await;
    negotiate_viewer(&h, &mut side, "B").await;
    assert_eq!(h.peers.ops("A")[0], TransportOp::AddTracks(2));

    connect_transport(&h, "A");
    connect_transport(&h, "B");
    let status = wait_status(&h.session, |s| s.participant_count == 2).await;
    assert!(status.last_error.is_none());

    // Candidates gathered after the answer go straight out.
    h.peers
        .events("A")
        .unwrap()
        .emit(TransportEvent::LocalCandidate(IceCandidate::new("cand-A")));
    assert_eq!(
        next_message(&mut side).await,
        SignalMessage::IceCandidate {
            stream_id: "s1".into(),
            peer: "A".into(),
            candidate: IceCandidate::new("cand-A"),
        }
    );
    assert_eq!(h.session.participants().await, vec!["A", "B"]);

    h.session.stop().await.unwrap();
    assert_eq!(
        next_message(&mut side).await,
        SignalMessage::EndStream {
            stream_id: "s1".into()
        }
    );

    let status = h.session.snapshot();
    assert_eq!(status.lifecycle, Lifecycle::Ended);
    assert_eq!(status.participant_count, 0);
    assert_eq!(status.connection_status, ConnectionStatus::Disconnected);
    assert!(camera.is_stopped());
    assert_eq!(h.peers.ops("A").last(), Some(&TransportOp::Close));
    assert_eq!(h.peers.ops("B").last(), Some(&TransportOp::Close));

    let seen: Vec<SessionEvent> = events.by_ref().collect().await;
    let joined: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ParticipantJoined { user_id, .. } => Some(user_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(joined, vec!["user-A", "user-B"]);
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::LifecycleChanged(Lifecycle::Ended))
    );
}

#[tokio::test]
async fn test_viewer_leaving_decrements_count() {
    let mut h = harness(LiveConfig::default());
    let (media, _camera) = host_media();
    h.session
        .start(StreamRole::Host, "s1", "host-user", media)
        .unwrap();
    let mut side = accept(&mut h, "host-conn").await;
    next_message(&mut side).await;

    negotiate_viewer(&h, &mut side, "A").await;
    negotiate_viewer(&h, &mut side, "B").await;
    wait_status(&h.session, |s| s.participant_count == 2).await;

    side.send(SignalMessage::ViewerLeft {
        stream_id: "s1".into(),
        viewer_connection_id: "A".into(),
    })
    .await;
    wait_status(&h.session, |s| s.participant_count == 1).await;
    wait_until(|| h.peers.ops("A").last() == Some(&TransportOp::Close)).await;

    // Late answer for the removed link changes nothing.
    side.send(SignalMessage::Answer {
        stream_id: "s1".into(),
        peer: "A".into(),
        sdp: SessionDescription::answer("late"),
    })
    .await;
    side.send(SignalMessage::ViewerLeft {
        stream_id: "s1".into(),
        viewer_connection_id: "A".into(),
    })
    .await;
    assert_eq!(h.session.participants().await, vec!["B"]);
    assert_eq!(h.session.snapshot().participant_count, 1);

    h.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_viewer_answers_and_applies_candidates_after_offer() {
    let mut h = harness(LiveConfig::default());
    let mut events = Box::pin(h.session.events());
    h.session
        .start(StreamRole::Viewer, "s1", "viewer-user", LocalMedia::default())
        .unwrap();
    let mut side = accept(&mut h, "viewer-conn").await;
    assert_eq!(
        next_message(&mut side).await,
        SignalMessage::JoinStream {
            stream_id: "s1".into(),
            viewer_id: "viewer-user".into()
        }
    );

    let offer = SessionDescription::offer("host-offer");
    side.send(SignalMessage::Offer {
        stream_id: "s1".into(),
        peer: "host-conn".into(),
        sdp: offer.clone(),
    })
    .await;
    for n in 1..=3 {
        side.send(SignalMessage::IceCandidate {
            stream_id: "s1".into(),
            peer: "host-conn".into(),
            candidate: IceCandidate::new(format!("c{n}")),
        })
        .await;
    }

    assert_eq!(
        next_message(&mut side).await,
        SignalMessage::Answer {
            stream_id: "s1".into(),
            peer: "host-conn".into(),
            sdp: SessionDescription::answer("answer-host-conn"),
        }
    );
    wait_until(|| {
        h.peers
            .ops("host-conn")
            .iter()
            .filter(|op| matches!(op, TransportOp::AddCandidate(_)))
            .count()
            == 3
    })
    .await;

    let ops = h.peers.ops("host-conn");
    let remote_at = ops
        .iter()
        .position(|op| *op == TransportOp::SetRemote(offer.clone()))
        .unwrap();
    let candidates: Vec<(usize, &str)> = ops
        .iter()
        .enumerate()
        .filter_map(|(i, op)| match op {
            TransportOp::AddCandidate(c) => Some((i, c.candidate.as_str())),
            _ => None,
        })
        .collect();
    assert!(candidates.iter().all(|(i, _)| *i > remote_at));
    assert_eq!(
        candidates.iter().map(|(_, c)| *c).collect::<Vec<_>>(),
        vec!["c1", "c2", "c3"]
    );
    // A viewer never sends media of its own.
    assert!(!ops.iter().any(|op| matches!(op, TransportOp::AddTracks(_))));

    let remote = FakeTrack::video("host-video");
    h.peers
        .events("host-conn")
        .unwrap()
        .emit(TransportEvent::TrackAdded(remote));
    connect_transport(&h, "host-conn");
    let stream = timeout(WAIT, async {
        loop {
            if let Some(stream) = h.session.remote_stream("host-conn").await {
                if !stream.tracks.is_empty() {
                    return stream;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stream.tracks[0].id(), "host-video");

    side.send(SignalMessage::StreamEnded {
        stream_id: "s1".into(),
    })
    .await;
    wait_status(&h.session, |s| s.lifecycle == Lifecycle::Ended).await;
    assert_eq!(
        next_message(&mut side).await,
        SignalMessage::LeaveStream {
            stream_id: "s1".into()
        }
    );

    let seen: Vec<SessionEvent> = events.by_ref().collect().await;
    assert!(seen.contains(&SessionEvent::StreamEnded));
    assert!(seen.contains(&SessionEvent::RemoteTrack {
        peer: "host-conn".into(),
        track_id: "host-video".into(),
        kind: TrackKind::Video,
    }));
    h.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_joining_missing_stream_ends_session() {
    let mut h = harness(LiveConfig::default());
    h.session
        .start(StreamRole::Viewer, "gone", "viewer-user", LocalMedia::default())
        .unwrap();
    let mut side = accept(&mut h, "viewer-conn").await;
    next_message(&mut side).await;

    side.send(SignalMessage::Error {
        code: Some(404),
        message: "Stream not found".into(),
    })
    .await;
    let status = wait_status(&h.session, |s| s.lifecycle == Lifecycle::Ended).await;
    assert_eq!(status.last_error.as_deref(), Some("Stream not found"));
    assert_eq!(status.participant_count, 0);
    h.session.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_removes_only_that_link() {
    let mut h = harness(LiveConfig::default());
    let (media, _camera) = host_media();
    h.session
        .start(StreamRole::Host, "s1", "host-user", media)
        .unwrap();
    let mut side = accept(&mut h, "host-conn").await;
    next_message(&mut side).await;

    negotiate_viewer(&h, &mut side, "A").await;
    connect_transport(&h, "A");

    // B never answers.
    side.send(SignalMessage::ViewerJoined {
        stream_id: "s1".into(),
        viewer_id: "user-B".into(),
        viewer_connection_id: "B".into(),
    })
    .await;
    assert!(matches!(
        next_message(&mut side).await,
        SignalMessage::Offer { .. }
    ));
    wait_status(&h.session, |s| s.participant_count == 2).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    let status = wait_status(&h.session, |s| s.participant_count == 1).await;
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("timed out")));
    assert_eq!(h.session.participants().await, vec!["A"]);
    wait_until(|| h.peers.ops("B").last() == Some(&TransportOp::Close)).await;

    h.session.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_host_reconnect_drops_links_of_old_relay_session() {
    let config = LiveConfig {
        reconnect: ReconnectPolicy {
            jitter: false,
            ..ReconnectPolicy::default()
        },
        ..LiveConfig::default()
    };
    let mut h = harness(config);
    let (media, _camera) = host_media();
    h.session
        .start(StreamRole::Host, "s1", "host-user", media)
        .unwrap();
    let mut side = accept(&mut h, "host-conn").await;
    next_message(&mut side).await;

    negotiate_viewer(&h, &mut side, "A").await;
    negotiate_viewer(&h, &mut side, "B").await;

    drop(side);
    wait_status(&h.session, |s| {
        s.connection_status == ConnectionStatus::Reconnecting
    })
    .await;

    // A connects while the relay is away, B does not. The relay ended the
    // old stream for both of them, so neither survives the new id.
    connect_transport(&h, "A");

    let mut side = accept(&mut h, "host-conn-2").await;
    assert!(matches!(
        next_message(&mut side).await,
        SignalMessage::StartStream { .. }
    ));
    let status = wait_status(&h.session, |s| {
        s.connection_status == ConnectionStatus::Connected && s.participant_count == 0
    })
    .await;
    assert_eq!(status.local_connection_id.as_deref(), Some("host-conn-2"));
    assert_eq!(status.lifecycle, Lifecycle::Live);
    assert!(h.session.participants().await.is_empty());
    wait_until(|| h.peers.ops("A").last() == Some(&TransportOp::Close)).await;
    wait_until(|| h.peers.ops("B").last() == Some(&TransportOp::Close)).await;
    assert_eq!(h.relay.dial_count(), 2);

    // Viewers joining the new stream negotiate from scratch.
    negotiate_viewer(&h, &mut side, "C").await;
    assert_eq!(h.session.participants().await, vec!["C"]);

    h.session.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_ends_session() {
    let config = LiveConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        },
        ..LiveConfig::default()
    };
    let h = harness(config);
    h.relay.refuse_next(10);
    let mut session = h.session;

    session
        .start(StreamRole::Viewer, "s1", "viewer-user", LocalMedia::default())
        .unwrap();
    let status = wait_status(&session, |s| s.lifecycle == Lifecycle::Ended).await;
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("unreachable")));
    assert_eq!(h.relay.dial_count(), 2);
    session.stop().await.unwrap();
}
