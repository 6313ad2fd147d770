use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use heartlink_engine::mock::{FakeMediaDevices, MockPeerConnection, MockPeerFactory};
use heartlink_engine::{
    ConnectionState, EngineConfig, EngineError, EngineEvent, NegotiationEngine, NegotiationState,
    PeerConnection, SignalingState, TrackKind,
};
use heartlink_proto::{
    ClientMessage, EndpointId, IceCandidateInit, Role, ServerMessage, SessionDescription,
    SessionErrorKind, SessionStatus,
};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// One endpoint: an engine on mock media and peer connections, plus
/// everything it has sent so far.
struct Peer {
    id: EndpointId,
    engine: NegotiationEngine,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    devices: Arc<FakeMediaDevices>,
    factory: Arc<MockPeerFactory>,
    sent: Vec<ClientMessage>,
}

impl Peer {
    fn new(id: &str) -> Self {
        Self::with_config(id, EngineConfig::localhost_only().with_auto_call(false))
    }

    fn with_config(id: &str, config: EngineConfig) -> Self {
        let devices = FakeMediaDevices::new();
        let factory = MockPeerFactory::new(id);
        let (tx, outbound) = mpsc::unbounded_channel();
        let (mut engine, events) =
            NegotiationEngine::new(config, devices.clone(), factory.clone(), tx);
        engine.set_local_id(EndpointId::from(id));
        Self {
            id: EndpointId::from(id),
            engine,
            outbound,
            events,
            devices,
            factory,
            sent: Vec::new(),
        }
    }

    fn take_outbound(&mut self) -> Vec<ClientMessage> {
        let mut drained = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            self.sent.push(message.clone());
            drained.push(message);
        }
        drained
    }

    fn offers_sent(&self) -> usize {
        self.sent
            .iter()
            .filter(|m| matches!(m, ClientMessage::Offer { .. }))
            .count()
    }

    fn answers_sent(&self) -> usize {
        self.sent
            .iter()
            .filter(|m| matches!(m, ClientMessage::Answer { .. }))
            .count()
    }

    fn pc(&self) -> Arc<MockPeerConnection> {
        self.factory.last().expect("peer connection created")
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn remote_kinds(&self) -> Vec<TrackKind> {
        let mut kinds: Vec<_> = self
            .engine
            .status()
            .remote_tracks
            .into_iter()
            .map(|t| t.kind)
            .collect();
        kinds.sort_by_key(|k| *k == TrackKind::Video);
        kinds
    }
}

async fn deliver(to: &mut Peer, from: &EndpointId, messages: Vec<ClientMessage>) {
    for message in messages {
        let Some((target, delivered)) = ServerMessage::relayed_from(from, message) else {
            continue;
        };
        assert_eq!(target, to.id);
        to.engine.handle_server_message(delivered).await;
    }
}

/// Pumps envelopes and peer callbacks both ways until nothing moves.
async fn settle(a: &mut Peer, b: &mut Peer) {
    for _ in 0..64 {
        let handled = a.engine.process_peer_events().await + b.engine.process_peer_events().await;
        let from_a = a.take_outbound();
        let from_b = b.take_outbound();
        let moved = handled > 0 || !from_a.is_empty() || !from_b.is_empty();
        deliver(b, &a.id, from_a).await;
        deliver(a, &b.id, from_b).await;
        if !moved {
            return;
        }
    }
    panic!("negotiation did not settle");
}

/// alice < bob, so alice is the polite side.
async fn connected_pair() -> (Peer, Peer) {
    init_tracing();
    let mut alice = Peer::new("alice");
    let mut bob = Peer::new("bob");
    alice.engine.acquire_local_media(false).await.unwrap();
    bob.engine.acquire_local_media(false).await.unwrap();
    bob.engine.start_call(alice.id.clone()).await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(alice.engine.state(), NegotiationState::Connected);
    assert_eq!(bob.engine.state(), NegotiationState::Connected);
    alice.drain_events();
    bob.drain_events();
    (alice, bob)
}

#[test_timeout::tokio_timeout_test]
async fn call_connects_both_sides_and_exchanges_candidates() {
    let (alice, bob) = connected_pair().await;

    assert_eq!(bob.offers_sent(), 1);
    assert_eq!(alice.answers_sent(), 1);
    assert_eq!(alice.offers_sent(), 0);
    for peer in [&alice, &bob] {
        let pc = peer.pc();
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(pc.connection_state(), ConnectionState::Connected);
        assert!(!pc.remote_candidates().is_empty());
        assert_eq!(peer.remote_kinds(), vec![TrackKind::Audio]);
    }
    assert_eq!(alice.engine.remote_id(), Some(&bob.id));
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_start_call_sends_one_offer() {
    init_tracing();
    let mut alice = Peer::new("alice");
    let mut bob = Peer::new("bob");
    alice.engine.acquire_local_media(false).await.unwrap();
    bob.engine.acquire_local_media(false).await.unwrap();

    bob.engine.start_call(alice.id.clone()).await.unwrap();
    bob.engine.start_call(alice.id.clone()).await.unwrap();

    let offers = bob.take_outbound();
    assert_eq!(offers.len(), 1);
    assert!(matches!(offers[0], ClientMessage::Offer { .. }));
    assert_eq!(bob.factory.connections().len(), 1);

    deliver(&mut alice, &bob.id, offers).await;
    settle(&mut alice, &mut bob).await;
    assert_eq!(bob.engine.state(), NegotiationState::Connected);
}

#[test_timeout::tokio_timeout_test]
async fn start_call_needs_local_media() {
    init_tracing();
    let mut bob = Peer::new("bob");
    let err = bob.engine.start_call(EndpointId::from("alice")).await;
    assert!(matches!(err, Err(EngineError::NoLocalMedia)));
    assert!(bob.factory.connections().is_empty());
    assert!(!bob.engine.status().call_initiated);

    let err = bob.engine.call_remote().await;
    assert!(matches!(err, Err(EngineError::NoRemotePeer)));
}

#[test_timeout::tokio_timeout_test]
async fn denied_media_leaves_engine_idle() {
    init_tracing();
    let mut alice = Peer::new("alice");
    alice.devices.deny_access(true);

    let err = alice.engine.acquire_local_media(true).await;
    assert!(matches!(err, Err(EngineError::MediaAccess(_))));
    assert_eq!(alice.engine.state(), NegotiationState::Idle);
    assert!(alice.engine.local_tracks().is_empty());

    alice.devices.deny_access(false);
    let tracks = alice.engine.acquire_local_media(true).await.unwrap();
    assert_eq!(tracks.len(), 2);
    // A second acquisition hands back the same tracks.
    let again = alice.engine.acquire_local_media(true).await.unwrap();
    assert_eq!(again, tracks);
    assert_eq!(alice.devices.requests().len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn simultaneous_offers_converge() {
    let (mut alice, mut bob) = connected_pair().await;

    alice.engine.enable_video().await.unwrap();
    bob.engine.enable_video().await.unwrap();
    assert_eq!(alice.pc().signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(bob.pc().signaling_state(), SignalingState::HaveLocalOffer);

    // Both offers cross in flight.
    let from_alice = alice.take_outbound();
    let from_bob = bob.take_outbound();
    deliver(&mut bob, &alice.id, from_alice).await;
    deliver(&mut alice, &bob.id, from_bob).await;
    settle(&mut alice, &mut bob).await;

    for peer in [&alice, &bob] {
        assert_eq!(peer.engine.state(), NegotiationState::Connected);
        assert_eq!(peer.pc().signaling_state(), SignalingState::Stable);
        assert_eq!(peer.pc().connection_state(), ConnectionState::Connected);
        assert_eq!(peer.remote_kinds(), vec![TrackKind::Audio, TrackKind::Video]);
        assert_eq!(peer.factory.connections().len(), 1);
    }
    // bob kept his offer; alice yielded, answered, then re-sent her change.
    assert_eq!(bob.answers_sent(), 1);
    assert_eq!(alice.answers_sent(), 2);
    assert_eq!(alice.offers_sent(), 2);
    assert_eq!(bob.offers_sent(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn crossing_initial_offers_settle_in_one_round() {
    init_tracing();
    let mut alice = Peer::new("alice");
    let mut bob = Peer::new("bob");
    alice.engine.acquire_local_media(false).await.unwrap();
    bob.engine.acquire_local_media(false).await.unwrap();

    alice.engine.start_call(bob.id.clone()).await.unwrap();
    bob.engine.start_call(alice.id.clone()).await.unwrap();
    assert_eq!(alice.pc().signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(bob.pc().signaling_state(), SignalingState::HaveLocalOffer);

    let from_alice = alice.take_outbound();
    let from_bob = bob.take_outbound();
    deliver(&mut bob, &alice.id, from_alice).await;
    // bob is not polite towards alice and keeps waiting on his own offer.
    assert_eq!(bob.pc().signaling_state(), SignalingState::HaveLocalOffer);
    deliver(&mut alice, &bob.id, from_bob).await;
    // alice rolled back and answered bob's offer.
    assert_eq!(alice.pc().signaling_state(), SignalingState::Stable);
    settle(&mut alice, &mut bob).await;

    for peer in [&alice, &bob] {
        assert_eq!(peer.engine.state(), NegotiationState::Connected);
        assert_eq!(peer.pc().signaling_state(), SignalingState::Stable);
        assert_eq!(peer.pc().connection_state(), ConnectionState::Connected);
        assert_eq!(peer.pc().rounds_completed(), 1);
        assert_eq!(peer.remote_kinds(), vec![TrackKind::Audio]);
        assert_eq!(peer.factory.connections().len(), 1);
    }
    assert_eq!(alice.offers_sent(), 1);
    assert_eq!(alice.answers_sent(), 1);
    assert_eq!(bob.offers_sent(), 1);
    assert_eq!(bob.answers_sent(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn video_renegotiates_only_when_track_set_changes() {
    let (mut alice, mut bob) = connected_pair().await;

    alice.engine.enable_video().await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(alice.offers_sent(), 1);
    assert_eq!(bob.answers_sent(), 1);
    assert_eq!(bob.remote_kinds(), vec![TrackKind::Audio, TrackKind::Video]);
    assert_eq!(alice.pc().local_track_kinds().len(), 2);
    assert!(alice.engine.status().has_video());
    assert_eq!(alice.engine.state(), NegotiationState::Connected);

    assert!(alice.engine.disable_video());
    assert!(!alice.engine.status().has_video());
    alice.engine.enable_video().await.unwrap();
    assert!(!alice.engine.toggle_video().await.unwrap());
    assert!(alice.engine.toggle_video().await.unwrap());
    settle(&mut alice, &mut bob).await;

    assert_eq!(alice.offers_sent(), 1);
    assert_eq!(alice.devices.requests().len(), 2);
    assert!(alice.engine.status().has_video());
}

#[test_timeout::tokio_timeout_test]
async fn video_enabled_before_the_call_rides_the_first_offer() {
    init_tracing();
    let mut alice = Peer::new("alice");
    let mut bob = Peer::new("bob");
    alice.engine.acquire_local_media(false).await.unwrap();
    bob.engine.acquire_local_media(false).await.unwrap();

    bob.engine.enable_video().await.unwrap();
    assert!(bob.take_outbound().is_empty());

    bob.engine.start_call(alice.id.clone()).await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(bob.offers_sent(), 1);
    assert_eq!(alice.remote_kinds(), vec![TrackKind::Audio, TrackKind::Video]);
}

#[test_timeout::tokio_timeout_test]
async fn hang_up_is_idempotent_and_late_candidates_are_dropped() {
    let (mut alice, bob) = connected_pair().await;
    let old_pc = alice.pc();

    alice.engine.hang_up().await;
    assert_eq!(alice.engine.state(), NegotiationState::Ended);
    assert_eq!(old_pc.signaling_state(), SignalingState::Closed);
    let events = alice.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::CallEnded { remote } if *remote == bob.id)));

    alice.engine.hang_up().await;
    assert_eq!(alice.engine.state(), NegotiationState::Ended);
    assert!(alice.drain_events().is_empty());

    alice
        .engine
        .handle_ice_candidate(
            bob.id.clone(),
            IceCandidateInit {
                candidate: "candidate:late".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        )
        .await;
    assert_eq!(alice.factory.connections().len(), 1);
    assert!(alice.engine.status().signaling_state.is_none());
    assert!(alice.engine.local_tracks().iter().all(|t| t.is_live()));
}

#[test_timeout::tokio_timeout_test]
async fn events_from_a_replaced_connection_are_ignored() {
    let (mut alice, mut bob) = connected_pair().await;
    let old_pc = alice.pc();

    old_pc.disconnect();
    alice.engine.hang_up().await;
    alice.engine.start_call(bob.id.clone()).await.unwrap();
    alice.drain_events();

    alice.engine.process_peer_events().await;
    assert!(!alice.drain_events().iter().any(|e| matches!(
        e,
        EngineEvent::ConnectionStateChanged(ConnectionState::Disconnected)
    )));
    assert_eq!(alice.engine.state(), NegotiationState::Connecting);

    bob.engine.hang_up().await;
    settle(&mut alice, &mut bob).await;
    assert_eq!(alice.engine.state(), NegotiationState::Connected);
    assert_eq!(bob.factory.connections().len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn connection_failure_ends_call_but_keeps_media() {
    let (mut alice, mut bob) = connected_pair().await;

    bob.pc().fail();
    bob.engine.process_peer_events().await;
    assert_eq!(bob.engine.state(), NegotiationState::Ended);
    assert!(bob
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::CallEnded { .. })));
    let tracks = bob.engine.local_tracks();
    assert_eq!(tracks.len(), 1);
    assert!(tracks[0].is_live());

    // The user can retry straight away.
    alice.engine.hang_up().await;
    bob.engine.start_call(alice.id.clone()).await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(bob.engine.state(), NegotiationState::Connected);
    assert_eq!(bob.offers_sent(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_is_only_a_warning() {
    let (_alice, mut bob) = connected_pair().await;
    bob.pc().disconnect();
    bob.engine.process_peer_events().await;
    assert_eq!(bob.engine.state(), NegotiationState::Connected);
    assert!(bob.engine.status().connection_state.is_some());
}

#[test_timeout::tokio_timeout_test]
async fn stray_answer_is_ignored() {
    let (alice, mut bob) = connected_pair().await;
    bob.engine
        .handle_server_message(ServerMessage::Answer {
            sender: alice.id.clone(),
            answer: SessionDescription::answer("v=0\r\n"),
        })
        .await;
    assert_eq!(bob.engine.state(), NegotiationState::Connected);
    assert_eq!(bob.pc().signaling_state(), SignalingState::Stable);
}

#[test_timeout::tokio_timeout_test]
async fn offer_before_media_is_answered_once_media_is_ready() {
    init_tracing();
    let mut alice = Peer::new("alice");
    let mut bob = Peer::new("bob");
    bob.engine.acquire_local_media(false).await.unwrap();
    bob.engine.start_call(alice.id.clone()).await.unwrap();

    let offer = bob.take_outbound();
    deliver(&mut alice, &bob.id, offer).await;
    bob.engine.process_peer_events().await;
    let candidates = bob.take_outbound();
    assert!(!candidates.is_empty());
    deliver(&mut alice, &bob.id, candidates).await;
    assert!(alice.take_outbound().is_empty());
    assert!(alice.factory.connections().is_empty());

    alice.engine.acquire_local_media(false).await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(alice.answers_sent(), 1);
    assert_eq!(alice.engine.state(), NegotiationState::Connected);
    assert_eq!(bob.engine.state(), NegotiationState::Connected);
    assert!(!alice.pc().remote_candidates().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn role_b_calls_automatically_when_peer_joins() {
    init_tracing();
    let config = EngineConfig::localhost_only();
    let mut alice = Peer::with_config("alice", config.clone());
    let mut bob = Peer::with_config("bob", config);
    alice.engine.acquire_local_media(false).await.unwrap();

    for (peer, role, status) in [
        (&mut alice, Role::A, SessionStatus::Waiting),
        (&mut bob, Role::B, SessionStatus::Active),
    ] {
        peer.engine
            .handle_server_message(ServerMessage::SessionInfo {
                session_id: "s1".into(),
                role,
                status,
            })
            .await;
    }
    alice
        .engine
        .handle_server_message(ServerMessage::UserJoined { id: bob.id.clone() })
        .await;
    bob.engine
        .handle_server_message(ServerMessage::UserJoined {
            id: alice.id.clone(),
        })
        .await;

    // bob has no media yet, so nobody has called.
    assert!(alice.take_outbound().is_empty());
    assert!(bob.take_outbound().is_empty());

    bob.engine.acquire_local_media(false).await.unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(bob.offers_sent(), 1);
    assert_eq!(alice.offers_sent(), 0);
    assert_eq!(alice.engine.state(), NegotiationState::Connected);
    assert_eq!(bob.engine.role(), Some(Role::B));
    assert!(bob
        .drain_events()
        .iter()
        .any(|e| matches!(e, EngineEvent::SessionAssigned { role: Role::B, .. })));
}

#[test_timeout::tokio_timeout_test]
async fn peer_leaving_ends_the_call() {
    let (mut alice, bob) = connected_pair().await;
    alice
        .engine
        .handle_server_message(ServerMessage::UserLeft { id: bob.id.clone() })
        .await;
    assert_eq!(alice.engine.state(), NegotiationState::Ended);
    assert!(alice.engine.remote_id().is_none());
    let events = alice.drain_events();
    assert!(events.iter().any(|e| matches!(e, EngineEvent::PeerLeft(id) if *id == bob.id)));

    alice.engine.cleanup().await;
    assert_eq!(alice.engine.state(), NegotiationState::Idle);
    assert!(alice.engine.local_tracks().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn captured_audio_is_chunked_for_the_consumer() {
    init_tracing();
    let config = EngineConfig::localhost_only().with_audio_window(Duration::from_millis(30), 8);
    let mut alice = Peer::with_config("alice", config);
    let (frames_tx, frames_rx) = mpsc::channel(8);
    alice.devices.set_audio_frames(frames_rx);
    let mut chunks = alice.engine.audio_chunks();
    alice.engine.acquire_local_media(false).await.unwrap();

    frames_tx.send(Bytes::from_static(b"0123456789")).await.unwrap();
    let chunk = chunks.recv().await.unwrap();
    assert_eq!(chunk.sequence, 0);
    assert_eq!(&chunk.data[..], b"0123456789");
}

#[test_timeout::tokio_timeout_test]
async fn join_rejections_are_reported_by_reason() {
    init_tracing();
    let mut alice = Peer::new("alice");

    alice
        .engine
        .handle_server_message(ServerMessage::SessionError {
            error: SessionErrorKind::AlreadySeated,
            message: "already seated in r1".into(),
        })
        .await;
    let events = alice.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::JoinRejected { message } if message.contains("r1")
    )));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::SessionFull { .. })));

    alice
        .engine
        .handle_server_message(ServerMessage::SessionError {
            error: SessionErrorKind::SessionFull,
            message: "room r2 is full".into(),
        })
        .await;
    let events = alice.drain_events();
    assert!(events.iter().any(|e| matches!(e, EngineEvent::SessionFull { .. })));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::JoinRejected { .. })));
    assert_eq!(alice.engine.state(), NegotiationState::Idle);
}
