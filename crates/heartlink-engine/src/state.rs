use std::fmt;

use heartlink_proto::{EndpointId, Role};

use crate::media::TrackKind;
use crate::peer::{ConnectionState, RemoteTrack, SignalingState};

/// Coarse lifecycle of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AcquiringMedia,
    MediaReady,
    /// Initial offer is being built.
    Calling,
    /// Initial offer from the remote is being answered.
    ReceivingOffer,
    /// Descriptions exchanged, transport not up yet.
    Connecting,
    Connected,
    /// A follow-up offer/answer round is in flight on a live connection.
    Renegotiating,
    Ended,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AcquiringMedia => "acquiring-media",
            NegotiationState::MediaReady => "media-ready",
            NegotiationState::Calling => "calling",
            NegotiationState::ReceivingOffer => "receiving-offer",
            NegotiationState::Connecting => "connecting",
            NegotiationState::Connected => "connected",
            NegotiationState::Renegotiating => "renegotiating",
            NegotiationState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of an engine, for UIs and diagnostics.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: NegotiationState,
    pub local_id: Option<EndpointId>,
    pub remote_id: Option<EndpointId>,
    pub role: Option<Role>,
    pub call_initiated: bool,
    /// `(kind, enabled)` per local track.
    pub local_tracks: Vec<(TrackKind, bool)>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub signaling_state: Option<SignalingState>,
    pub connection_state: Option<ConnectionState>,
}

impl EngineStatus {
    pub fn has_video(&self) -> bool {
        self.local_tracks
            .iter()
            .any(|(kind, enabled)| *kind == TrackKind::Video && *enabled)
    }
}
