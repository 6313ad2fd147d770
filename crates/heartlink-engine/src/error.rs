use thiserror::Error;

use crate::peer::SignalingState;

/// Failures raised by a [`MediaDevices`](crate::media::MediaDevices) backend.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no {0} device available")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Failures raised by a [`PeerConnection`](crate::peer::PeerConnection) backend.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("operation not valid in signaling state {0}")]
    InvalidState(SignalingState),
    #[error("malformed session description: {0}")]
    InvalidDescription(String),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("room is full: {0}")]
    SessionFull(String),
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("media access failed: {0}")]
    MediaAccess(#[from] MediaError),
    #[error("local media has not been acquired")]
    NoLocalMedia,
    #[error("no remote peer to call")]
    NoRemotePeer,
    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("engine task has stopped")]
    EngineStopped,
}
