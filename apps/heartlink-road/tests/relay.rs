use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use heartlink_proto::{
    ClientMessage, EndpointId, IceCandidateInit, Role, ServerMessage, SessionDescription,
    SessionErrorKind, SessionStatus,
};
use heartlink_road::Config;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let config = Config::default();
        let _ = heartlink_road::serve(listener, &config).await;
    });
    format!("ws://{addr}/ws")
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("relay message in time")
            .expect("stream open")
            .expect("websocket frame");
        if let Message::Text(text) = frame {
            return heartlink_proto::decode_server(&text).expect("server message");
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "expected no message, got {next:?}");
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    let text = heartlink_proto::encode(message).expect("encode");
    ws.send(Message::Text(text.into())).await.expect("send frame");
}

async fn connect(url: &str) -> (Ws, EndpointId) {
    let (mut ws, _) = connect_async(url).await.expect("connect to relay");
    match recv(&mut ws).await {
        ServerMessage::UserId { id } => (ws, id),
        other => panic!("expected user_id first, got {other:?}"),
    }
}

async fn join(ws: &mut Ws, room: &str) -> ServerMessage {
    send(ws, &ClientMessage::Join { room: room.into() }).await;
    recv(ws).await
}

#[test_timeout::tokio_timeout_test]
async fn second_joiner_gets_role_b_and_both_are_notified() {
    let url = start_relay().await;
    let (mut a, a_id) = connect(&url).await;
    let (mut b, b_id) = connect(&url).await;

    let a_info = join(&mut a, "r").await;
    let a_session = match a_info {
        ServerMessage::SessionInfo {
            session_id,
            role: Role::A,
            status: SessionStatus::Waiting,
        } => session_id,
        other => panic!("unexpected join reply: {other:?}"),
    };

    match join(&mut b, "r").await {
        ServerMessage::SessionInfo {
            session_id,
            role: Role::B,
            status: SessionStatus::Active,
        } => assert_eq!(session_id, a_session),
        other => panic!("unexpected join reply: {other:?}"),
    }

    assert_eq!(recv(&mut a).await, ServerMessage::UserJoined { id: b_id });
    assert_eq!(recv(&mut b).await, ServerMessage::UserJoined { id: a_id });
}

#[test_timeout::tokio_timeout_test]
async fn third_joiner_is_turned_away() {
    let url = start_relay().await;
    let (mut a, _) = connect(&url).await;
    let (mut b, _) = connect(&url).await;
    let (mut c, _) = connect(&url).await;

    join(&mut a, "r").await;
    join(&mut b, "r").await;
    recv(&mut a).await;
    recv(&mut b).await;

    match join(&mut c, "r").await {
        ServerMessage::SessionError { error, .. } => {
            assert_eq!(error, SessionErrorKind::SessionFull)
        }
        other => panic!("expected session_error, got {other:?}"),
    }
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;

    // Rejoining from a seated endpoint still reports the original seat.
    match join(&mut a, "r").await {
        ServerMessage::SessionInfo { role, status, .. } => {
            assert_eq!(role, Role::A);
            assert_eq!(status, SessionStatus::Active);
        }
        other => panic!("unexpected rejoin reply: {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn envelopes_reach_target_with_sender() {
    let url = start_relay().await;
    let (mut a, a_id) = connect(&url).await;
    let (mut b, b_id) = connect(&url).await;
    join(&mut a, "r").await;
    join(&mut b, "r").await;
    recv(&mut a).await;
    recv(&mut b).await;

    send(
        &mut b,
        &ClientMessage::Offer {
            offer: SessionDescription::offer("v=0 offer"),
            target: a_id.clone(),
        },
    )
    .await;
    let candidate = IceCandidateInit {
        candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    send(
        &mut b,
        &ClientMessage::IceCandidate {
            candidate: candidate.clone(),
            target: a_id.clone(),
        },
    )
    .await;

    assert_eq!(
        recv(&mut a).await,
        ServerMessage::Offer {
            sender: b_id.clone(),
            offer: SessionDescription::offer("v=0 offer"),
        }
    );
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::IceCandidate {
            sender: b_id.clone(),
            candidate,
        }
    );

    send(
        &mut a,
        &ClientMessage::Answer {
            answer: SessionDescription::answer("v=0 answer"),
            target: b_id,
        },
    )
    .await;
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Answer {
            sender: a_id,
            answer: SessionDescription::answer("v=0 answer"),
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn unknown_target_reports_error_to_sender() {
    let url = start_relay().await;
    let (mut a, _) = connect(&url).await;
    send(
        &mut a,
        &ClientMessage::Answer {
            answer: SessionDescription::answer("v=0"),
            target: EndpointId::from("nobody"),
        },
    )
    .await;
    match recv(&mut a).await {
        ServerMessage::Error { message } => assert!(message.contains("nobody")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_frees_seat_and_notifies_peer() {
    let url = start_relay().await;
    let (mut a, _) = connect(&url).await;
    let (mut b, b_id) = connect(&url).await;
    join(&mut a, "r").await;
    join(&mut b, "r").await;
    recv(&mut a).await;
    recv(&mut b).await;

    b.close(None).await.expect("close b");
    assert_eq!(recv(&mut a).await, ServerMessage::UserLeft { id: b_id });

    let (mut c, c_id) = connect(&url).await;
    match join(&mut c, "r").await {
        ServerMessage::SessionInfo { role, .. } => assert_eq!(role, Role::B),
        other => panic!("unexpected join reply: {other:?}"),
    }
    assert_eq!(recv(&mut a).await, ServerMessage::UserJoined { id: c_id });
}

#[test_timeout::tokio_timeout_test]
async fn leave_keeps_socket_open() {
    let url = start_relay().await;
    let (mut a, a_id) = connect(&url).await;
    let (mut b, _) = connect(&url).await;
    join(&mut a, "r").await;
    join(&mut b, "r").await;
    recv(&mut a).await;
    recv(&mut b).await;

    send(&mut a, &ClientMessage::Leave).await;
    assert_eq!(recv(&mut b).await, ServerMessage::UserLeft { id: a_id });

    send(&mut a, &ClientMessage::Ping).await;
    assert_eq!(recv(&mut a).await, ServerMessage::Pong);
}
