use std::sync::Arc;

use heartlink_proto::{
    ClientMessage, EndpointId, IceCandidateInit, Role, ServerMessage, SessionDescription,
    SessionErrorKind,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, MediaError};
use crate::events::EngineEvent;
use crate::media::{
    AudioChunk, AudioChunker, LocalMedia, LocalTrack, MediaConstraints, MediaDevices, TrackKind,
};
use crate::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventKind,
    PeerEventSink, RemoteTrack, SignalingState,
};
use crate::state::{EngineStatus, NegotiationState};

/// The single peer connection of the current call.
struct Call {
    generation: u64,
    remote: EndpointId,
    pc: Arc<dyn PeerConnection>,
    remote_tracks: Vec<RemoteTrack>,
    remote_description_set: bool,
    /// Candidates that arrived before any remote description was applied.
    early_candidates: Vec<IceCandidateInit>,
    /// A track change is waiting for signaling to return to stable.
    renegotiation_pending: bool,
    /// The outstanding local offer adds tracks the remote has not seen.
    offer_changes_tracks: bool,
    connected_once: bool,
}

/// An offer that arrived before local media was ready.
struct PendingOffer {
    sender: EndpointId,
    offer: SessionDescription,
    candidates: Vec<IceCandidateInit>,
}

/// Per-peer negotiation state machine.
///
/// Every operation takes `&mut self`, so the engine only ever runs one step
/// at a time; the actor in [`crate::actor`] feeds it relay messages, peer
/// callbacks and user commands from a single task. Outbound envelopes go to
/// the `outbound` channel, notifications to the [`EngineEvent`] receiver
/// returned by [`NegotiationEngine::new`].
pub struct NegotiationEngine {
    config: EngineConfig,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<EngineEvent>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    audio_sink: Option<mpsc::Sender<AudioChunk>>,
    state: NegotiationState,
    local_id: Option<EndpointId>,
    remote_id: Option<EndpointId>,
    role: Option<Role>,
    media: Option<LocalMedia>,
    call: Option<Call>,
    call_initiated: bool,
    pending_offer: Option<PendingOffer>,
    generation: u64,
}

impl NegotiationEngine {
    pub fn new(
        config: EngineConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            config,
            devices,
            factory,
            outbound,
            events,
            peer_events_tx,
            peer_events_rx,
            audio_sink: None,
            state: NegotiationState::Idle,
            local_id: None,
            remote_id: None,
            role: None,
            media: None,
            call: None,
            call_initiated: false,
            pending_offer: None,
            generation: 0,
        };
        (engine, events_rx)
    }

    /// Opens the audio chunk stream. Takes effect on the next media acquisition.
    pub fn audio_chunks(&mut self) -> mpsc::Receiver<AudioChunk> {
        let (tx, rx) = mpsc::channel(self.config.audio_chunk_capacity.max(1));
        self.audio_sink = Some(tx);
        rx
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_id(&self) -> Option<&EndpointId> {
        self.local_id.as_ref()
    }

    pub fn remote_id(&self) -> Option<&EndpointId> {
        self.remote_id.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn set_local_id(&mut self, id: EndpointId) {
        self.local_id = Some(id);
    }

    pub fn set_remote_id(&mut self, id: EndpointId) {
        self.remote_id = Some(id);
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.media
            .as_ref()
            .map(|media| media.tracks().to_vec())
            .unwrap_or_default()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            role: self.role,
            call_initiated: self.call_initiated,
            local_tracks: self
                .local_tracks()
                .iter()
                .map(|track| (track.kind(), track.is_enabled()))
                .collect(),
            remote_tracks: self
                .call
                .as_ref()
                .map(|call| call.remote_tracks.clone())
                .unwrap_or_default(),
            signaling_state: self.call.as_ref().map(|call| call.pc.signaling_state()),
            connection_state: self.call.as_ref().map(|call| call.pc.connection_state()),
        }
    }

    /// Captures microphone (and camera when `want_video`). A second call
    /// returns the tracks already held.
    pub async fn acquire_local_media(
        &mut self,
        want_video: bool,
    ) -> Result<Vec<LocalTrack>, EngineError> {
        if let Some(media) = &self.media {
            debug!(target = "heartlink::engine", "local media already acquired");
            return Ok(media.tracks().to_vec());
        }

        let previous = self.state;
        self.set_state(NegotiationState::AcquiringMedia);
        let constraints = MediaConstraints {
            audio: true,
            video: want_video,
        };
        let captured = match self.devices.get_user_media(constraints).await {
            Ok(captured) => captured,
            Err(err) => {
                warn!(target = "heartlink::engine", "media acquisition failed: {err}");
                self.set_state(previous);
                return Err(err.into());
            }
        };
        if !captured.tracks.iter().any(|t| t.kind() == TrackKind::Audio) {
            for track in &captured.tracks {
                track.stop();
            }
            self.set_state(previous);
            return Err(MediaError::DeviceNotFound("audio".into()).into());
        }

        let mut media = LocalMedia::new(captured.tracks);
        match (captured.audio_frames, self.audio_sink.clone()) {
            (Some(frames), Some(sink)) => {
                let chunker = AudioChunker::new(
                    self.config.audio_chunk_window,
                    self.config.min_audio_chunk_bytes,
                    sink,
                );
                media.attach_chunker(chunker.spawn(frames));
            }
            (Some(_), None) => {
                debug!(target = "heartlink::engine", "no audio consumer, raw frames dropped")
            }
            _ => {}
        }
        let tracks = media.tracks().to_vec();
        self.media = Some(media);
        info!(
            target = "heartlink::engine",
            tracks = tracks.len(),
            video = want_video,
            "local media ready"
        );
        self.set_state(NegotiationState::MediaReady);
        self.emit(EngineEvent::LocalStream(tracks.clone()));

        if let Some(pending) = self.pending_offer.take() {
            info!(
                target = "heartlink::engine",
                remote = %pending.sender,
                "answering offer received before media was ready"
            );
            let sender = pending.sender.clone();
            self.handle_offer(pending.sender, pending.offer).await;
            for candidate in pending.candidates {
                self.handle_ice_candidate(sender.clone(), candidate).await;
            }
        } else if self.should_auto_call() {
            if let Some(remote) = self.remote_id.clone() {
                if let Err(err) = self.start_call(remote).await {
                    warn!(target = "heartlink::engine", "automatic call failed: {err}");
                }
            }
        }
        Ok(tracks)
    }

    /// Places the initial offer to `remote`. A second call while one is in
    /// progress is a logged no-op.
    pub async fn start_call(&mut self, remote: EndpointId) -> Result<(), EngineError> {
        if self.call_initiated || self.call.is_some() {
            warn!(
                target = "heartlink::engine",
                remote = %remote,
                "call already initiated, ignoring duplicate start"
            );
            return Ok(());
        }
        let tracks = self
            .media
            .as_ref()
            .map(|media| media.tracks().to_vec())
            .ok_or(EngineError::NoLocalMedia)?;

        self.call_initiated = true;
        self.remote_id = Some(remote.clone());
        self.set_state(NegotiationState::Calling);
        info!(target = "heartlink::engine", remote = %remote, "starting call");

        if let Err(err) = self.place_call(&remote, &tracks).await {
            error!(target = "heartlink::engine", remote = %remote, "call setup failed: {err}");
            self.abandon_call().await;
            return Err(err);
        }
        Ok(())
    }

    /// Like [`start_call`](Self::start_call) against the known remote.
    pub async fn call_remote(&mut self) -> Result<(), EngineError> {
        let remote = self.remote_id.clone().ok_or(EngineError::NoRemotePeer)?;
        self.start_call(remote).await
    }

    async fn place_call(
        &mut self,
        remote: &EndpointId,
        tracks: &[LocalTrack],
    ) -> Result<(), EngineError> {
        let pc = self.open_connection(remote, tracks).await?;
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        self.send(ClientMessage::Offer {
            offer,
            target: remote.clone(),
        })?;
        debug!(target = "heartlink::engine", remote = %remote, "offer sent");
        self.set_state(NegotiationState::Connecting);
        Ok(())
    }

    async fn open_connection(
        &mut self,
        remote: &EndpointId,
        tracks: &[LocalTrack],
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        self.generation += 1;
        let generation = self.generation;
        let sink = PeerEventSink::new(generation, self.peer_events_tx.clone());
        let pc = self.factory.create(sink).await?;
        self.call = Some(Call {
            generation,
            remote: remote.clone(),
            pc: pc.clone(),
            remote_tracks: Vec::new(),
            remote_description_set: false,
            early_candidates: Vec::new(),
            renegotiation_pending: false,
            offer_changes_tracks: false,
            connected_once: false,
        });
        for track in tracks {
            pc.add_track(track).await?;
        }
        debug!(
            target = "heartlink::engine",
            remote = %remote,
            generation,
            tracks = tracks.len(),
            "peer connection created"
        );
        Ok(pc)
    }

    /// Answers an offer from `sender`. Covers the initial offer, follow-up
    /// renegotiation and glare; failures are logged and contained.
    pub async fn handle_offer(&mut self, sender: EndpointId, offer: SessionDescription) {
        if let Err(err) = self.accept_offer(&sender, offer).await {
            warn!(
                target = "heartlink::engine",
                remote = %sender,
                "failed to handle offer: {err}"
            );
        }
    }

    async fn accept_offer(
        &mut self,
        sender: &EndpointId,
        offer: SessionDescription,
    ) -> Result<(), EngineError> {
        let existing = match &self.call {
            Some(call) if &call.remote == sender => Some((call.pc.clone(), call.connected_once)),
            Some(call) => {
                warn!(
                    target = "heartlink::engine",
                    remote = %sender,
                    current = %call.remote,
                    "offer from an endpoint other than the current peer, ignoring"
                );
                return Ok(());
            }
            None => None,
        };

        let Some((pc, connected_once)) = existing else {
            return self.accept_initial_offer(sender, offer).await;
        };

        if pc.signaling_state() == SignalingState::HaveLocalOffer {
            if !self.is_polite_towards(sender) {
                info!(
                    target = "heartlink::engine",
                    remote = %sender,
                    "offer collision, keeping local offer"
                );
                return Ok(());
            }
            info!(
                target = "heartlink::engine",
                remote = %sender,
                "offer collision, rolling back local offer"
            );
            pc.rollback().await?;
            // A rolled-back track change still has to reach the remote.
            if let Some(call) = self.call.as_mut() {
                if std::mem::take(&mut call.offer_changes_tracks) {
                    call.renegotiation_pending = true;
                }
            }
        }

        self.set_state(if connected_once {
            NegotiationState::Renegotiating
        } else {
            NegotiationState::ReceivingOffer
        });
        self.answer(pc, sender, offer).await
    }

    async fn accept_initial_offer(
        &mut self,
        sender: &EndpointId,
        offer: SessionDescription,
    ) -> Result<(), EngineError> {
        let Some(tracks) = self.media.as_ref().map(|media| media.tracks().to_vec()) else {
            info!(
                target = "heartlink::engine",
                remote = %sender,
                "offer arrived before local media, holding it"
            );
            self.remote_id = Some(sender.clone());
            self.pending_offer = Some(PendingOffer {
                sender: sender.clone(),
                offer,
                candidates: Vec::new(),
            });
            return Ok(());
        };

        self.call_initiated = true;
        self.remote_id = Some(sender.clone());
        self.set_state(NegotiationState::ReceivingOffer);
        info!(target = "heartlink::engine", remote = %sender, "answering incoming call");

        let result = match self.open_connection(sender, &tracks).await {
            Ok(pc) => self.answer(pc, sender, offer).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.abandon_call().await;
        }
        result
    }

    /// Applies a remote offer and replies with an answer. Runs without
    /// yielding to other engine input between the two descriptions.
    async fn answer(
        &mut self,
        pc: Arc<dyn PeerConnection>,
        sender: &EndpointId,
        offer: SessionDescription,
    ) -> Result<(), EngineError> {
        pc.set_remote_description(offer).await?;
        self.flush_early_candidates().await;
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.send(ClientMessage::Answer {
            answer,
            target: sender.clone(),
        })?;
        debug!(target = "heartlink::engine", remote = %sender, "answer sent");
        self.settle_round().await;
        Ok(())
    }

    /// Applies the answer to our outstanding offer. Answers that do not
    /// match an outstanding offer are ignored.
    pub async fn handle_answer(&mut self, sender: EndpointId, answer: SessionDescription) {
        let pc = match &self.call {
            Some(call) if call.remote == sender => call.pc.clone(),
            Some(_) | None => {
                debug!(
                    target = "heartlink::engine",
                    remote = %sender,
                    "answer without a matching call, ignoring"
                );
                return;
            }
        };
        let signaling = pc.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            info!(
                target = "heartlink::engine",
                remote = %sender,
                state = %signaling,
                "answer with no outstanding offer, ignoring"
            );
            return;
        }
        if let Err(err) = pc.set_remote_description(answer).await {
            warn!(
                target = "heartlink::engine",
                remote = %sender,
                "failed to apply answer: {err}"
            );
            return;
        }
        debug!(target = "heartlink::engine", remote = %sender, "answer applied");
        self.flush_early_candidates().await;
        self.settle_round().await;
    }

    /// Adds a remote candidate to the current connection. Never fails:
    /// candidates for a finished or unknown call are dropped.
    pub async fn handle_ice_candidate(&mut self, sender: EndpointId, candidate: IceCandidateInit) {
        if let Some(pending) = self.pending_offer.as_mut() {
            if pending.sender == sender {
                pending.candidates.push(candidate);
                return;
            }
        }
        let Some(call) = self.call.as_mut() else {
            debug!(
                target = "heartlink::engine",
                remote = %sender,
                "ICE candidate with no active call, ignoring"
            );
            return;
        };
        if call.remote != sender {
            debug!(
                target = "heartlink::engine",
                remote = %sender,
                "ICE candidate from an unexpected endpoint, ignoring"
            );
            return;
        }
        if !call.remote_description_set {
            call.early_candidates.push(candidate);
            return;
        }
        let pc = call.pc.clone();
        if let Err(err) = pc.add_ice_candidate(candidate).await {
            debug!(
                target = "heartlink::engine",
                remote = %sender,
                "ignoring ICE candidate: {err}"
            );
        }
    }

    async fn flush_early_candidates(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.remote_description_set = true;
        let pc = call.pc.clone();
        let early = std::mem::take(&mut call.early_candidates);
        for candidate in early {
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                debug!(target = "heartlink::engine", "ignoring early ICE candidate: {err}");
            }
        }
    }

    /// After an offer/answer round: report where the transport stands and
    /// send any track change that was held back during the round.
    async fn settle_round(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let connected = call.pc.connection_state() == ConnectionState::Connected;
        call.offer_changes_tracks = false;
        let pending = std::mem::take(&mut call.renegotiation_pending);
        self.set_state(if connected {
            NegotiationState::Connected
        } else {
            NegotiationState::Connecting
        });
        if pending {
            if let Err(err) = self.renegotiate().await {
                warn!(target = "heartlink::engine", "renegotiation failed: {err}");
            }
        }
    }

    /// Sends a fresh offer on the live connection, or defers it until the
    /// current round finishes.
    async fn renegotiate(&mut self) -> Result<(), EngineError> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        let signaling = call.pc.signaling_state();
        if signaling != SignalingState::Stable {
            debug!(
                target = "heartlink::engine",
                state = %signaling,
                "negotiation in flight, deferring renegotiation"
            );
            call.renegotiation_pending = true;
            return Ok(());
        }
        let pc = call.pc.clone();
        let remote = call.remote.clone();
        call.offer_changes_tracks = true;

        self.set_state(NegotiationState::Renegotiating);
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        self.send(ClientMessage::Offer {
            offer,
            target: remote.clone(),
        })?;
        info!(target = "heartlink::engine", remote = %remote, "renegotiation offer sent");
        Ok(())
    }

    /// Turns the camera on. An existing video track is re-enabled in place;
    /// otherwise a camera track is captured and, during a call, the
    /// connection is renegotiated once.
    pub async fn enable_video(&mut self) -> Result<(), EngineError> {
        let existing = self
            .media
            .as_ref()
            .ok_or(EngineError::NoLocalMedia)?
            .track(TrackKind::Video)
            .cloned();
        if let Some(track) = existing {
            if !track.is_enabled() {
                track.set_enabled(true);
                info!(target = "heartlink::engine", track = track.id(), "video re-enabled");
            }
            return Ok(());
        }

        let captured = self
            .devices
            .get_user_media(MediaConstraints::video_only())
            .await?;
        let mut video = None;
        for track in captured.tracks {
            if track.kind() == TrackKind::Video && video.is_none() {
                video = Some(track);
            } else {
                track.stop();
            }
        }
        let video = video.ok_or_else(|| MediaError::DeviceNotFound("video".into()))?;

        let tracks = match self.media.as_mut() {
            Some(media) => {
                media.add_track(video.clone());
                media.tracks().to_vec()
            }
            None => {
                video.stop();
                return Err(EngineError::NoLocalMedia);
            }
        };
        info!(target = "heartlink::engine", track = video.id(), "video track added");
        self.emit(EngineEvent::LocalStream(tracks));

        let Some(pc) = self.call.as_ref().map(|call| call.pc.clone()) else {
            debug!(target = "heartlink::engine", "no call yet, video goes out with the first offer");
            return Ok(());
        };
        pc.add_track(&video).await?;
        self.renegotiate().await
    }

    /// Mutes the camera without renegotiating. Returns whether a video
    /// track existed.
    pub fn disable_video(&mut self) -> bool {
        let Some(track) = self
            .media
            .as_ref()
            .and_then(|media| media.track(TrackKind::Video))
        else {
            return false;
        };
        if track.is_enabled() {
            track.set_enabled(false);
            info!(target = "heartlink::engine", track = track.id(), "video disabled");
        }
        true
    }

    /// Flips the camera. Returns whether video is now on.
    pub async fn toggle_video(&mut self) -> Result<bool, EngineError> {
        let enabled = self
            .media
            .as_ref()
            .and_then(|media| media.track(TrackKind::Video))
            .is_some_and(|track| track.is_enabled());
        if enabled {
            self.disable_video();
            Ok(false)
        } else {
            self.enable_video().await?;
            Ok(true)
        }
    }

    /// Closes the current call, keeping local media. Safe to repeat.
    pub async fn hang_up(&mut self) {
        self.call_initiated = false;
        self.pending_offer = None;
        let Some(call) = self.call.take() else {
            return;
        };
        call.pc.close().await;
        info!(
            target = "heartlink::engine",
            remote = %call.remote,
            generation = call.generation,
            "call ended"
        );
        self.set_state(NegotiationState::Ended);
        self.emit(EngineEvent::CallEnded {
            remote: call.remote,
        });
    }

    /// Stops local media and ends any call.
    pub async fn cleanup(&mut self) {
        self.hang_up().await;
        if let Some(media) = self.media.take() {
            media.stop();
            debug!(target = "heartlink::engine", "local media stopped");
        }
        self.set_state(NegotiationState::Idle);
    }

    /// Tears down a call whose setup failed part way.
    async fn abandon_call(&mut self) {
        self.call_initiated = false;
        if let Some(call) = self.call.take() {
            call.pc.close().await;
        }
        let next = if self.media.is_some() {
            NegotiationState::MediaReady
        } else {
            NegotiationState::Idle
        };
        self.set_state(next);
    }

    /// Dispatches one relay message.
    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::UserId { id } => {
                debug!(target = "heartlink::engine", id = %id, "relay assigned endpoint id");
                self.local_id = Some(id);
            }
            ServerMessage::SessionInfo {
                session_id,
                role,
                status,
            } => {
                info!(
                    target = "heartlink::engine",
                    session = %session_id,
                    role = %role,
                    status = ?status,
                    "joined session"
                );
                self.role = Some(role);
                self.emit(EngineEvent::SessionAssigned { session_id, role });
            }
            ServerMessage::SessionError { error, message } => match error {
                SessionErrorKind::SessionFull => {
                    warn!(target = "heartlink::engine", "session full: {message}");
                    self.emit(EngineEvent::SessionFull { message });
                }
                SessionErrorKind::AlreadySeated => {
                    warn!(target = "heartlink::engine", "join rejected: {message}");
                    self.emit(EngineEvent::JoinRejected { message });
                }
            },
            ServerMessage::UserJoined { id } => {
                info!(target = "heartlink::engine", remote = %id, "peer joined");
                self.remote_id = Some(id.clone());
                self.emit(EngineEvent::PeerJoined(id.clone()));
                if self.should_auto_call() {
                    if let Err(err) = self.start_call(id).await {
                        warn!(target = "heartlink::engine", "automatic call failed: {err}");
                    }
                }
            }
            ServerMessage::UserLeft { id } => {
                info!(target = "heartlink::engine", remote = %id, "peer left");
                self.emit(EngineEvent::PeerLeft(id.clone()));
                if self.remote_id.as_ref() == Some(&id) {
                    self.remote_id = None;
                    self.hang_up().await;
                }
            }
            ServerMessage::Offer { sender, offer } => self.handle_offer(sender, offer).await,
            ServerMessage::Answer { sender, answer } => self.handle_answer(sender, answer).await,
            ServerMessage::IceCandidate { sender, candidate } => {
                self.handle_ice_candidate(sender, candidate).await
            }
            ServerMessage::Pong => trace!(target = "heartlink::engine", "pong"),
            ServerMessage::Error { message } => {
                warn!(target = "heartlink::engine", "relay error: {message}")
            }
        }
    }

    /// Applies one peer-connection callback. Events from a connection that
    /// is no longer current are dropped.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(call) = self.call.as_mut() else {
            trace!(target = "heartlink::engine", "peer event with no call, dropping");
            return;
        };
        if event.generation != call.generation {
            debug!(
                target = "heartlink::engine",
                generation = event.generation,
                current = call.generation,
                "stale peer event, dropping"
            );
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let target = call.remote.clone();
                if let Err(err) = self.send(ClientMessage::IceCandidate { candidate, target }) {
                    warn!(target = "heartlink::engine", "failed to send ICE candidate: {err}");
                }
            }
            PeerEventKind::RemoteTrack(track) => {
                if call.remote_tracks.iter().any(|t| t.id == track.id) {
                    return;
                }
                debug!(
                    target = "heartlink::engine",
                    track = %track.id,
                    kind = %track.kind,
                    "remote track added"
                );
                call.remote_tracks.push(track);
                let tracks = call.remote_tracks.clone();
                self.emit(EngineEvent::RemoteStream(tracks));
            }
            PeerEventKind::ConnectionState(connection) => {
                let stable = call.pc.signaling_state() == SignalingState::Stable;
                if connection == ConnectionState::Connected {
                    call.connected_once = true;
                }
                info!(
                    target = "heartlink::engine",
                    remote = %call.remote,
                    state = %connection,
                    "connection state changed"
                );
                self.emit(EngineEvent::ConnectionStateChanged(connection));
                match connection {
                    ConnectionState::Connected if stable => {
                        self.set_state(NegotiationState::Connected)
                    }
                    ConnectionState::Failed => {
                        error!(target = "heartlink::engine", "connection failed, ending call");
                        self.hang_up().await;
                    }
                    ConnectionState::Disconnected => {
                        warn!(target = "heartlink::engine", "connection interrupted")
                    }
                    _ => {}
                }
            }
        }
    }

    /// Applies every peer callback queued so far. Returns how many ran.
    pub async fn process_peer_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.peer_events_rx.try_recv() {
            self.handle_peer_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Waits for the next peer callback.
    pub(crate) async fn next_peer_event(&mut self) -> Option<PeerEvent> {
        self.peer_events_rx.recv().await
    }

    fn should_auto_call(&self) -> bool {
        self.config.auto_call
            && self.role.is_some_and(Role::initiates_call)
            && self.remote_id.is_some()
            && self.media.is_some()
            && self.call.is_none()
            && !self.call_initiated
    }

    fn is_polite_towards(&self, remote: &EndpointId) -> bool {
        match &self.local_id {
            Some(local) => local.is_polite_towards(remote),
            None => {
                warn!(
                    target = "heartlink::engine",
                    "local endpoint id unknown, yielding on offer collision"
                );
                true
            }
        }
    }

    fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        self.outbound
            .send(message)
            .map_err(|_| EngineError::ChannelClosed)
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            trace!(target = "heartlink::engine", "no event listener");
        }
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        debug!(
            target = "heartlink::engine",
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
        self.emit(EngineEvent::StateChanged(next));
    }
}
