//! Wire protocol shared by the HeartLink relay and the negotiation engine.
//! Keeping it in its own crate lets both sides agree on envelope shapes
//! without the relay pulling in the media stack.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one live connection to the relay.
///
/// Ordering is byte-wise lexicographic over the UTF-8 identifier. Glare
/// resolution depends on both peers computing the same order, so it must
/// not change with identifier format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lower identity of a pair is the polite peer: it yields its own
    /// offer when both sides offer at once.
    pub fn is_polite_towards(&self, remote: &EndpointId) -> bool {
        self < remote
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Seat within a two-party session. `A` joined first, `B` second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    A,
    B,
}

impl Role {
    /// The second joiner places the call.
    pub fn initiates_call(self) -> bool {
        matches!(self, Role::B)
    }

    pub fn other(self) -> Role {
        match self {
            Role::A => Role::B,
            Role::B => Role::A,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::A => f.write_str("A"),
            Role::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// One seat taken, waiting for a partner.
    Waiting,
    /// Both seats taken.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the shape browsers put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        room: String,
    },
    Leave,
    Offer {
        offer: SessionDescription,
        target: EndpointId,
    },
    Answer {
        answer: SessionDescription,
        target: EndpointId,
    },
    IceCandidate {
        candidate: IceCandidateInit,
        target: EndpointId,
    },
    Ping,
}

impl ClientMessage {
    /// Target endpoint for relayed envelopes.
    pub fn target(&self) -> Option<&EndpointId> {
        match self {
            ClientMessage::Offer { target, .. }
            | ClientMessage::Answer { target, .. }
            | ClientMessage::IceCandidate { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    SessionFull,
    AlreadySeated,
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    UserId {
        id: EndpointId,
    },
    SessionInfo {
        session_id: String,
        role: Role,
        status: SessionStatus,
    },
    SessionError {
        error: SessionErrorKind,
        message: String,
    },
    UserJoined {
        id: EndpointId,
    },
    UserLeft {
        id: EndpointId,
    },
    Offer {
        sender: EndpointId,
        offer: SessionDescription,
    },
    Answer {
        sender: EndpointId,
        answer: SessionDescription,
    },
    IceCandidate {
        sender: EndpointId,
        candidate: IceCandidateInit,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Rewrites a client envelope into the form delivered to its target.
    /// Returns `None` for messages the relay does not forward.
    pub fn relayed_from(sender: &EndpointId, message: ClientMessage) -> Option<(EndpointId, Self)> {
        match message {
            ClientMessage::Offer { offer, target } => Some((
                target,
                ServerMessage::Offer {
                    sender: sender.clone(),
                    offer,
                },
            )),
            ClientMessage::Answer { answer, target } => Some((
                target,
                ServerMessage::Answer {
                    sender: sender.clone(),
                    answer,
                },
            )),
            ClientMessage::IceCandidate { candidate, target } => Some((
                target,
                ServerMessage::IceCandidate {
                    sender: sender.clone(),
                    candidate,
                },
            )),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtoError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_client(text: &str) -> Result<ClientMessage, ProtoError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_server(text: &str) -> Result<ServerMessage, ProtoError> {
    Ok(serde_json::from_str(text)?)
}
