//! Seam between the negotiation state machine and a WebRTC stack.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use heartlink_proto::{IceCandidateInit, SessionDescription};
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidateInit),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

/// Callback from a peer connection, tagged with the generation of the
/// connection that raised it so events from a torn-down call can be dropped.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Handed to a backend at creation; every callback goes through it.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: PeerEventKind) {
        // The engine may already be gone; nothing left to notify.
        let _ = self.tx.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }
}

/// One WebRTC peer connection. Mirrors the browser API surface the engine
/// needs; every async method is a point where other events may queue up.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    /// Discards a pending local offer, returning to `Stable`.
    async fn rollback(&self) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError>;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
