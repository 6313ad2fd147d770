use heartlink_proto::{EndpointId, Role};

use crate::media::LocalTrack;
use crate::peer::{ConnectionState, RemoteTrack};
use crate::state::NegotiationState;

/// Notifications emitted by the engine to whoever renders the call.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(NegotiationState),
    /// Current local track set, sent after acquisition and after video is added.
    LocalStream(Vec<LocalTrack>),
    /// Current remote track set, sent whenever a new remote track arrives.
    RemoteStream(Vec<RemoteTrack>),
    ConnectionStateChanged(ConnectionState),
    SessionAssigned {
        session_id: String,
        role: Role,
    },
    /// The relay refused the join (room already has two occupants).
    SessionFull {
        message: String,
    },
    /// The relay refused the join for another reason, such as this
    /// endpoint already holding a seat elsewhere.
    JoinRejected {
        message: String,
    },
    PeerJoined(EndpointId),
    PeerLeft(EndpointId),
    CallEnded {
        remote: EndpointId,
    },
}
