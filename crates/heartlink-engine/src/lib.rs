//! Negotiation engine for a two-party HeartLink call.
//!
//! One [`NegotiationEngine`] runs per peer. It owns the local media pipeline
//! and at most one peer connection, drives the offer/answer/ICE exchange over
//! the relay, resolves glare deterministically, and reports lifecycle changes
//! as [`EngineEvent`]s. Platform primitives sit behind the [`MediaDevices`]
//! and [`PeerConnectionFactory`] traits so the state machine runs the same
//! against webrtc-rs ([`rtc`]) or the in-memory fakes ([`mock`]).

pub mod actor;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod mock;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod state;

pub use actor::{spawn_engine, EngineHandle};
pub use config::EngineConfig;
pub use engine::NegotiationEngine;
pub use error::{EngineError, MediaError, PeerError};
pub use events::EngineEvent;
pub use media::{
    AudioChunk, AudioChunker, CapturedMedia, LocalTrack, MediaConstraints, MediaDevices,
    TrackKind,
};
pub use peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventKind,
    PeerEventSink, RemoteTrack, SignalingState,
};
pub use signaling::{SessionAssignment, SignalingClient};
pub use state::{EngineStatus, NegotiationState};
