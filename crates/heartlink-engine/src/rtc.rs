//! webrtc-rs backend for [`PeerConnection`].

use std::sync::Arc;

use async_trait::async_trait;
use heartlink_proto::{IceCandidateInit, SdpType, SessionDescription};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::EngineConfig;
use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerEventKind, PeerEventSink,
    RemoteTrack, SignalingState,
};

const STREAM_ID: &str = "heartlink";

fn backend(err: webrtc::Error) -> PeerError {
    PeerError::Backend(err.to_string())
}

/// Builds peer connections on a shared webrtc-rs API instance with the
/// default codecs and interceptors.
pub struct RtcPeerConnectionFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerConnectionFactory {
    pub fn new(config: &EngineConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let configuration = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(configuration)
                .await
                .map_err(backend)?,
        );
        install_callbacks(&pc, &events);
        debug!(
            target = "heartlink::rtc",
            generation = events.generation(),
            "peer connection created"
        );
        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEventKind::LocalCandidate(IceCandidateInit {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(err) => warn!(
                    target = "heartlink::rtc",
                    "failed to serialise local candidate: {err}"
                ),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEventKind::ConnectionState(connection_state(state)));
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                other => {
                    debug!(
                        target = "heartlink::rtc",
                        "ignoring remote track of kind {other}"
                    );
                    return;
                }
            };
            sink.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                id: track.id().to_string(),
                kind,
            }));
        })
    }));
}

/// One webrtc-rs peer connection. Local tracks are attached as static
/// sample tracks; writing media into them is the capture pipeline's job.
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let SessionDescription { sdp_type, sdp } = description;
    let converted = match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    };
    converted.map_err(|err| PeerError::InvalidDescription(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::InvalidDescription(
                "unspecified description type".into(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self.pc.add_track(sample).await.map_err(backend)?;
        // RTCP has to be drained for interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        from_rtc(self.pc.create_offer(None).await.map_err(backend)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        from_rtc(self.pc.create_answer(None).await.map_err(backend)?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.set_local_description(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(backend)
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "heartlink::rtc", "error closing peer connection: {err}");
        }
    }
}
