//! [`PeerEngine`] on top of webrtc-rs
//!
//! Each connection gets its own `API` with the default codecs and
//! interceptors registered. Local capture tracks become Opus / VP8 sample
//! tracks; the capture layer feeds them through
//! [`WebRtcEngine::sample_track`]. Engine callbacks are translated into
//! [`PeerEvent`]s on the connection's event channel.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::PeerConfig;
use crate::error::{CallError, CallResult};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{
    PeerConnection, PeerConnectionState, PeerEngine, PeerEvent, PeerEventSender, SdpType, SessionDescription,
};
use crate::signaling::IceCandidate;

const STREAM_ID: &str = "pairtalk";

/// Peer engine backed by webrtc-rs
#[derive(Default)]
pub struct WebRtcEngine {
    sample_tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
}

impl WebRtcEngine {
    /// New engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample track created for the local track `id`, for the capture layer
    /// to write media into
    pub fn sample_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.sample_tracks.lock().get(id).cloned()
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create(&self, config: &PeerConfig, events: PeerEventSender) -> CallResult<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::capability(format!("codec registration failed: {}", e)))?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| CallError::capability(format!("interceptor registration failed: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| CallError::capability(format!("could not create peer connection: {}", e)))?;
        let pc = Arc::new(pc);
        install_callbacks(&pc, events);

        Ok(Arc::new(WebRtcConnection {
            pc,
            sample_tracks: self.sample_tracks.clone(),
            local_ids: Mutex::new(Vec::new()),
        }))
    }
}

fn install_callbacks(pc: &RTCPeerConnection, events: PeerEventSender) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerConnectionState::New,
                RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            };
            let _ = events.send(PeerEvent::ConnectionStateChanged(state));
        })
    }));

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!("could not serialize local candidate: {}", e),
            }
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                debug!(%kind, mime = %track.codec().capability.mime_type, "remote track");
                let _ = events.send(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: Some(track.stream_id()),
                    handle: Some(track as Arc<dyn Any + Send + Sync>),
                }));
            })
        },
    ));
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    sample_tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
    local_ids: Mutex<Vec<String>>,
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn to_rtc(description: SessionDescription) -> CallResult<RTCSessionDescription> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| CallError::negotiation(format!("invalid session description: {}", e)))
}

fn from_rtc(description: RTCSessionDescription) -> CallResult<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => return Err(CallError::negotiation(format!("unexpected description type {:?}", other))),
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> CallResult<()> {
        for local in tracks {
            let track = Arc::new(TrackLocalStaticSample::new(
                codec_for(local.kind),
                local.id.clone(),
                STREAM_ID.to_string(),
            ));
            self.pc
                .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| CallError::capability(format!("could not add {} track: {}", local.kind, e)))?;
            self.sample_tracks.lock().insert(local.id.clone(), track);
            self.local_ids.lock().push(local.id.clone());
        }
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::negotiation(e.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::negotiation(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| CallError::negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| CallError::negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CallError::candidate(e.to_string()))
    }

    async fn close(&self) -> CallResult<()> {
        {
            let mut registry = self.sample_tracks.lock();
            for id in self.local_ids.lock().drain(..) {
                registry.remove(&id);
            }
        }
        self.pc
            .close()
            .await
            .map_err(|e| CallError::internal(format!("peer connection close failed: {}", e)))
    }
}
