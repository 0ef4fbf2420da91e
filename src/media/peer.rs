use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{LocalTrack, RemoteTrack, TrackKind};
use crate::config::IceServerConfig;
use crate::error::CallError;
use crate::events::PeerEventSink;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Transport-level state of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            _ => PeerConnectionState::New,
        }
    }
}

/// Events emitted by a peer connection back to the engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Gathered locally; must reach the other party.
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(PeerConnectionState),
}

/// The negotiation layer for one call attempt.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Bind `track` to a new sender. Video senders become the target of
    /// [`replace_video_track`](Self::replace_video_track).
    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError>;

    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;

    /// Swap the track on the existing video sender in place, without renegotiation.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), CallError>;

    async fn close(&self);
}

/// Allocates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}

fn negotiation<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> CallError {
    move |e| CallError::Negotiation(format!("{}: {}", what, e))
}

/// `webrtc`-backed connector.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector;

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let peer = WebRtcPeer::new(ice_servers, events).await?;
        Ok(Arc::new(peer))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    pub async fn new(ice_servers: &[IceServerConfig], events: PeerEventSink) -> Result<Self, CallError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation("failed to register codecs"))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(negotiation("failed to register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(negotiation("failed to create peer connection"))?,
        );

        let attempt = events.attempt();

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                info!("Peer connection for attempt {} state: {}", attempt, state);
                events.emit(PeerEvent::StateChanged(state.into()));
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                info!("Received remote {:?} track {}", kind, track.id());
                events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(track),
                }));
            })
        }));

        let ice_events = events;
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = ice_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        info!("Created WebRTC peer connection for attempt {}", attempt);
        Ok(Self {
            pc,
            video_sender: Mutex::new(None),
        })
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, CallError> {
        let sdp = description.sdp.clone();
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(negotiation("malformed session description"))
    }

    fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, CallError> {
        match description.sdp_type {
            RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
            other => Err(CallError::Negotiation(format!(
                "unexpected session description type {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let rtp_sender = self
            .pc
            .add_track(track.sink() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation("failed to add track"))?;

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(rtp_sender.clone());
        }

        // Read incoming RTCP packets (needed by webrtc crate for proper operation)
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        debug!("Added local {:?} track {}", track.source(), track.id());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(negotiation("failed to create offer"))?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation("failed to create answer"))?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(negotiation("failed to set local description"))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(negotiation("failed to set remote description"))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation("failed to add ICE candidate"))
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let sender = self.video_sender.lock().await.clone();
        let sender = sender.ok_or(CallError::NoVideoSender)?;
        sender
            .replace_track(Some(track.sink() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(negotiation("failed to replace video track"))?;
        info!("Video sender now carries {:?} track {}", track.source(), track.id());
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
        self.video_sender.lock().await.take();
        info!("Closed peer connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webrtc_states_map_onto_engine_states() {
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
    }
}
