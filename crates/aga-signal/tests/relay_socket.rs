//! Relay behaviour over real sockets: a listener on 127.0.0.1:0 and
//! tokio-tungstenite clients playing host and viewers.

use std::net::SocketAddr;
use std::time::Duration;

use aga_common::{IceCandidate, SessionDescription, SignalMessage};
use aga_signal::{router, serve, ws_url_for, AppState, RelayConfig, STREAM_NOT_FOUND};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(config: RelayConfig) -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config);
    let served = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, served).await;
    });
    (addr, state)
}

struct Client {
    socket: Socket,
    id: String,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (mut socket, _) = connect_async(ws_url_for(addr)).await.unwrap();
        let id = match recv_on(&mut socket).await {
            SignalMessage::Welcome { connection_id } => connection_id,
            other => panic!("expected welcome, got {other:?}"),
        };
        Self { socket, id }
    }

    async fn send(&mut self, message: SignalMessage) {
        let text = message.to_json().unwrap();
        self.socket.send(Message::Text(text)).await.unwrap();
    }

    async fn recv(&mut self) -> SignalMessage {
        recv_on(&mut self.socket).await
    }

    async fn expect_silence(&mut self) {
        let next = timeout(Duration::from_millis(200), self.socket.next()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }
}

async fn recv_on(socket: &mut Socket) -> SignalMessage {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("relay went quiet")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return SignalMessage::from_json(&text).unwrap();
        }
    }
}

async fn wait_for_stream(state: &AppState, stream_id: &str) {
    timeout(WAIT, async {
        while state.registry.lock().await.host_of(stream_id).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn host_with_viewer(addr: SocketAddr, state: &AppState) -> (Client, Client) {
    let mut host = Client::connect(addr).await;
    host.send(SignalMessage::StartStream {
        stream_id: "s1".into(),
        host_id: "host-user".into(),
    })
    .await;
    wait_for_stream(state, "s1").await;

    let mut viewer = Client::connect(addr).await;
    viewer
        .send(SignalMessage::JoinStream {
            stream_id: "s1".into(),
            viewer_id: "viewer-user".into(),
        })
        .await;
    match host.recv().await {
        SignalMessage::ViewerJoined {
            viewer_id,
            viewer_connection_id,
            ..
        } => {
            assert_eq!(viewer_id, "viewer-user");
            assert_eq!(viewer_connection_id, viewer.id);
        }
        other => panic!("expected viewer-joined, got {other:?}"),
    }
    (host, viewer)
}

#[tokio::test]
async fn test_each_socket_gets_a_distinct_connection_id() {
    let (addr, _) = spawn_relay(RelayConfig::default()).await;
    let a = Client::connect(addr).await;
    let b = Client::connect(addr).await;
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn test_join_missing_stream_reports_not_found() {
    let (addr, _) = spawn_relay(RelayConfig::default()).await;
    let mut viewer = Client::connect(addr).await;
    viewer
        .send(SignalMessage::JoinStream {
            stream_id: "nope".into(),
            viewer_id: "viewer-user".into(),
        })
        .await;
    assert_eq!(
        viewer.recv().await,
        SignalMessage::Error {
            code: Some(STREAM_NOT_FOUND),
            message: "Stream not found".into(),
        }
    );
}

#[tokio::test]
async fn test_negotiation_messages_are_rewritten_to_the_sender() {
    let (addr, state) = spawn_relay(RelayConfig::default()).await;
    let (mut host, mut viewer) = host_with_viewer(addr, &state).await;

    host.send(SignalMessage::Offer {
        stream_id: "s1".into(),
        peer: viewer.id.clone(),
        sdp: SessionDescription::offer("v=0 offer"),
    })
    .await;
    assert_eq!(
        viewer.recv().await,
        SignalMessage::Offer {
            stream_id: "s1".into(),
            peer: host.id.clone(),
            sdp: SessionDescription::offer("v=0 offer"),
        }
    );

    viewer
        .send(SignalMessage::Answer {
            stream_id: "s1".into(),
            peer: host.id.clone(),
            sdp: SessionDescription::answer("v=0 answer"),
        })
        .await;
    viewer
        .send(SignalMessage::IceCandidate {
            stream_id: "s1".into(),
            peer: host.id.clone(),
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host"),
        })
        .await;

    assert!(matches!(
        host.recv().await,
        SignalMessage::Answer { ref peer, .. } if *peer == viewer.id
    ));
    assert!(matches!(
        host.recv().await,
        SignalMessage::IceCandidate { ref peer, .. } if *peer == viewer.id
    ));
}

#[tokio::test]
async fn test_leave_then_end_stream() {
    let (addr, state) = spawn_relay(RelayConfig::default()).await;
    let (mut host, mut viewer) = host_with_viewer(addr, &state).await;
    let mut second = Client::connect(addr).await;
    second
        .send(SignalMessage::JoinStream {
            stream_id: "s1".into(),
            viewer_id: "second-user".into(),
        })
        .await;
    assert!(matches!(host.recv().await, SignalMessage::ViewerJoined { .. }));

    viewer
        .send(SignalMessage::LeaveStream {
            stream_id: "s1".into(),
        })
        .await;
    assert_eq!(
        host.recv().await,
        SignalMessage::ViewerLeft {
            stream_id: "s1".into(),
            viewer_connection_id: viewer.id.clone(),
        }
    );

    host.send(SignalMessage::EndStream {
        stream_id: "s1".into(),
    })
    .await;
    assert_eq!(
        second.recv().await,
        SignalMessage::StreamEnded {
            stream_id: "s1".into()
        }
    );
    viewer.expect_silence().await;
    assert_eq!(state.registry.lock().await.stream_count(), 0);
}

#[tokio::test]
async fn test_socket_close_resolves_membership() {
    let (addr, state) = spawn_relay(RelayConfig::default()).await;
    let (mut host, mut viewer) = host_with_viewer(addr, &state).await;

    let viewer_id = viewer.id.clone();
    viewer.socket.close(None).await.unwrap();
    assert_eq!(
        host.recv().await,
        SignalMessage::ViewerLeft {
            stream_id: "s1".into(),
            viewer_connection_id: viewer_id,
        }
    );

    let mut late = Client::connect(addr).await;
    late.send(SignalMessage::JoinStream {
        stream_id: "s1".into(),
        viewer_id: "late-user".into(),
    })
    .await;
    assert!(matches!(host.recv().await, SignalMessage::ViewerJoined { .. }));

    host.socket.close(None).await.unwrap();
    assert_eq!(
        late.recv().await,
        SignalMessage::StreamEnded {
            stream_id: "s1".into()
        }
    );
}

#[tokio::test]
async fn test_per_ip_cap_refuses_upgrade() {
    let config = RelayConfig {
        max_per_ip: 1,
        ..RelayConfig::default()
    };
    let (addr, _) = spawn_relay(config).await;
    let _first = Client::connect(addr).await;
    assert!(connect_async(ws_url_for(addr)).await.is_err());
}

#[tokio::test]
async fn test_rate_limit_closes_socket() {
    let config = RelayConfig {
        messages_per_minute: 2,
        ..RelayConfig::default()
    };
    let (addr, _) = spawn_relay(config).await;
    let mut client = Client::connect(addr).await;
    for _ in 0..3 {
        client
            .send(SignalMessage::LeaveStream {
                stream_id: "s1".into(),
            })
            .await;
    }
    assert_eq!(
        client.recv().await,
        SignalMessage::error("Rate limit exceeded")
    );
}

#[tokio::test]
async fn test_health_reports_connections_and_streams() {
    let (addr, state) = spawn_relay(RelayConfig::default()).await;
    let (_host, _viewer) = host_with_viewer(addr, &state).await;

    let response = router(state)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["active_connections"], 2);
    assert_eq!(json["active_streams"], 1);
}
