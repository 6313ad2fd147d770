//! In-memory media and peer-connection backends.
//!
//! The mock peer connection follows the browser signaling transition table
//! and reports connectivity once the first offer/answer round completes. Its
//! session descriptions are plain text listing the sender's tracks, which is
//! enough for the far side to raise remote-track events.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use heartlink_proto::{IceCandidateInit, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{MediaError, PeerError};
use crate::media::{CapturedMedia, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEventKind, PeerEventSink,
    RemoteTrack, SignalingState,
};

/// Camera and microphone that always succeed unless told to refuse.
#[derive(Debug, Default)]
pub struct FakeMediaDevices {
    deny: AtomicBool,
    next_id: AtomicU64,
    requests: Mutex<Vec<MediaConstraints>>,
    audio_frames: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl FakeMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_access(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Feeds the next audio capture from `frames`.
    pub fn set_audio_frames(&self, frames: mpsc::Receiver<Bytes>) {
        *self.audio_frames.lock() = Some(frames);
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    fn track(&self, kind: TrackKind) -> LocalTrack {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        LocalTrack::new(format!("{kind}-{n}"), kind)
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<CapturedMedia, MediaError> {
        self.requests.lock().push(constraints);
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera and microphone".into()));
        }
        let mut tracks = Vec::new();
        let mut audio_frames = None;
        if constraints.audio {
            tracks.push(self.track(TrackKind::Audio));
            audio_frames = self.audio_frames.lock().take();
        }
        if constraints.video {
            tracks.push(self.track(TrackKind::Video));
        }
        Ok(CapturedMedia {
            tracks,
            audio_frames,
        })
    }
}

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    local_tracks: Vec<RemoteTrack>,
    remote_tracks: HashSet<String>,
    has_remote_description: bool,
    candidates: Vec<IceCandidateInit>,
    candidate_announced: bool,
    version: u64,
    offers_created: usize,
    rounds_completed: usize,
}

/// Scripted peer connection. Test hooks (`fail`, `disconnect`) drive
/// transport changes that a real stack would report on its own.
#[derive(Debug)]
pub struct MockPeerConnection {
    label: String,
    events: PeerEventSink,
    state: Mutex<MockState>,
}

impl MockPeerConnection {
    pub fn new(label: impl Into<String>, events: PeerEventSink) -> Self {
        Self {
            label: label.into(),
            events,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local_tracks: Vec::new(),
                remote_tracks: HashSet::new(),
                has_remote_description: false,
                candidates: Vec::new(),
                candidate_announced: false,
                version: 0,
                offers_created: 0,
                rounds_completed: 0,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn rounds_completed(&self) -> usize {
        self.state.lock().rounds_completed
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidateInit> {
        self.state.lock().candidates.clone()
    }

    pub fn local_track_kinds(&self) -> Vec<TrackKind> {
        self.state
            .lock()
            .local_tracks
            .iter()
            .map(|track| track.kind)
            .collect()
    }

    pub fn fail(&self) {
        self.transition(ConnectionState::Failed);
    }

    pub fn disconnect(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if state.connection == next || state.connection == ConnectionState::Closed {
            return;
        }
        state.connection = next;
        drop(state);
        self.events.emit(PeerEventKind::ConnectionState(next));
    }

    fn render(&self, sdp_type: &str, state: &mut MockState) -> String {
        state.version += 1;
        let mut sdp = format!("v=0\r\no=mock {} {} {}\r\n", self.label, state.version, sdp_type);
        for track in &state.local_tracks {
            sdp.push_str(&format!("m={} {}\r\n", track.kind, track.id));
        }
        sdp
    }

    fn ensure_open(state: &MockState) -> Result<(), PeerError> {
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn complete_round(&self, state: &mut MockState) -> bool {
        state.rounds_completed += 1;
        state.connection == ConnectionState::New
    }

    fn announce_remote_tracks(&self, sdp: &str) -> Result<(), PeerError> {
        let tracks = parse_tracks(sdp)?;
        let fresh: Vec<RemoteTrack> = {
            let mut state = self.state.lock();
            tracks
                .into_iter()
                .filter(|track| state.remote_tracks.insert(track.id.clone()))
                .collect()
        };
        for track in fresh {
            self.events.emit(PeerEventKind::RemoteTrack(track));
        }
        Ok(())
    }

    fn come_up(&self) {
        self.transition(ConnectionState::Connecting);
        self.transition(ConnectionState::Connected);
    }
}

fn parse_tracks(sdp: &str) -> Result<Vec<RemoteTrack>, PeerError> {
    if !sdp.starts_with("v=0") {
        return Err(PeerError::InvalidDescription("missing version line".into()));
    }
    let mut tracks = Vec::new();
    for line in sdp.lines().filter_map(|line| line.strip_prefix("m=")) {
        let (kind, id) = line
            .split_once(' ')
            .ok_or_else(|| PeerError::InvalidDescription(format!("bad media line: {line}")))?;
        let kind = match kind {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            other => {
                return Err(PeerError::InvalidDescription(format!(
                    "unknown media kind: {other}"
                )))
            }
        };
        tracks.push(RemoteTrack {
            id: id.to_string(),
            kind,
        });
    }
    Ok(tracks)
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !state.local_tracks.iter().any(|t| t.id == track.id()) {
            state.local_tracks.push(RemoteTrack {
                id: track.id().to_string(),
                kind: track.kind(),
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                state.offers_created += 1;
                let sdp = self.render("offer", &mut state);
                Ok(SessionDescription::offer(sdp))
            }
            other => Err(PeerError::InvalidState(other)),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match state.signaling {
            SignalingState::HaveRemoteOffer => {
                let sdp = self.render("answer", &mut state);
                Ok(SessionDescription::answer(sdp))
            }
            other => Err(PeerError::InvalidState(other)),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let (announce, connect) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    let announce = !state.candidate_announced;
                    state.candidate_announced = true;
                    (announce, false)
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    let announce = !state.candidate_announced;
                    state.candidate_announced = true;
                    (announce, self.complete_round(&mut state))
                }
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    (false, false)
                }
                (_, current) => return Err(PeerError::InvalidState(current)),
            }
        };
        if announce {
            self.events.emit(PeerEventKind::LocalCandidate(IceCandidateInit {
                candidate: format!("candidate:1 1 udp 2122260223 {} 9 typ host", self.label),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        if connect {
            self.come_up();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let connect = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.has_remote_description = true;
                    false
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.has_remote_description = true;
                    self.complete_round(&mut state)
                }
                (_, current) => return Err(PeerError::InvalidState(current)),
            }
        };
        self.announce_remote_tracks(&description.sdp)?;
        if connect {
            self.come_up();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.set_local_description(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !state.has_remote_description {
            return Err(PeerError::InvalidState(state.signaling));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.connection = ConnectionState::Closed;
    }
}

/// Hands out [`MockPeerConnection`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct MockPeerFactory {
    label: String,
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockPeerFactory {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let connection = Arc::new(MockPeerConnection::new(self.label.clone(), events));
        self.created.lock().push(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerEvent;

    fn pair() -> (
        MockPeerConnection,
        MockPeerConnection,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MockPeerConnection::new("a", PeerEventSink::new(1, tx.clone())),
            MockPeerConnection::new("b", PeerEventSink::new(2, tx)),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_round_connects_both_sides() {
        let (a, b, mut rx) = pair();
        a.add_track(&LocalTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio mic"));
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);

        let events = drain(&mut rx);
        let remote_tracks: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.kind {
                PeerEventKind::RemoteTrack(track) => Some((e.generation, track.id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(remote_tracks, vec![(2, "mic".to_string())]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rollback_only_from_local_offer() {
        let (a, _b, _rx) = pair();
        assert!(matches!(
            a.rollback().await,
            Err(PeerError::InvalidState(SignalingState::Stable))
        ));
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        a.rollback().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_need_a_remote_description() {
        let (a, _b, _rx) = pair();
        let candidate = IceCandidateInit {
            candidate: "candidate:0".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(a.add_ice_candidate(candidate.clone()).await.is_err());
        a.close().await;
        assert!(matches!(
            a.add_ice_candidate(candidate).await,
            Err(PeerError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn denied_devices_report_permission_error() {
        let devices = FakeMediaDevices::new();
        devices.deny_access(true);
        let err = devices
            .get_user_media(MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied(_)));
        assert_eq!(devices.requests().len(), 1);
    }
}
