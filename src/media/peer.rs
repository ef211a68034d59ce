use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReport;

use crate::config::AppConfig;
use crate::models::StreamRole;

/// Events emitted by the peer connection back to the engine.
#[derive(Debug)]
pub enum PeerEvent {
    /// WebRTC connection state changed.
    ConnectionStateChanged { state: RTCPeerConnectionState },
    /// Remote media track arrived ("audio" or "video").
    RemoteTrack { kind: String },
    /// ICE candidate gathered, to be sent to the remote side.
    IceCandidate { candidate: String },
}

/// One WebRTC connection into a live session.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
}

impl PeerSession {
    pub async fn new(
        config: &AppConfig,
        role: StreamRole,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, String> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| format!("Failed to register codecs: {}", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| format!("Failed to register interceptors: {}", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        }];
        if let Some(turn) = &config.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                credential_type: RTCIceCredentialType::Password,
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| format!("Failed to create peer connection: {}", e))?,
        );

        // Media production and rendering live in the frontend; the
        // transceivers only declare our direction in the SDP.
        let direction = match role {
            StreamRole::Broadcaster => RTCRtpTransceiverDirection::Sendonly,
            StreamRole::Viewer => RTCRtpTransceiverDirection::Recvonly,
        };
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| format!("Failed to add {} transceiver: {}", kind, e))?;
        }

        // Connection state change
        let event_tx_state = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = event_tx_state.clone();
            Box::pin(async move {
                info!("Stream connection state: {}", state);
                let _ = tx.send(PeerEvent::ConnectionStateChanged { state }).await;
            })
        }));

        // Remote tracks
        let event_tx_track = event_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = event_tx_track.clone();
            Box::pin(async move {
                info!("Received remote {} track", track.kind());
                let _ = tx
                    .send(PeerEvent::RemoteTrack {
                        kind: track.kind().to_string(),
                    })
                    .await;
            })
        }));

        // ICE candidate gathering
        let event_tx_ice = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = event_tx_ice.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let json = match candidate.to_json() {
                        Ok(init) => serde_json::to_string(&init).unwrap_or_default(),
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };
                    let _ = tx.send(PeerEvent::IceCandidate { candidate: json }).await;
                }
            })
        }));

        Ok(Self { pc })
    }

    /// Create an SDP offer and set it as the local description.
    pub async fn create_offer(&self) -> Result<String, String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| format!("Failed to create offer: {}", e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;
        serde_json::to_string(&offer).map_err(|e| format!("Failed to serialize SDP: {}", e))
    }

    /// Apply a remote offer and return our answer.
    pub async fn handle_offer(&self, sdp_json: &str) -> Result<String, String> {
        let offer: RTCSessionDescription = serde_json::from_str(sdp_json)
            .map_err(|e| format!("Failed to parse offer SDP: {}", e))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| format!("Failed to set remote description: {}", e))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| format!("Failed to create answer: {}", e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| format!("Failed to set local description: {}", e))?;
        serde_json::to_string(&answer).map_err(|e| format!("Failed to serialize answer SDP: {}", e))
    }

    /// Apply a remote answer to our outstanding offer.
    pub async fn handle_answer(&self, sdp_json: &str) -> Result<(), String> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp_json)
            .map_err(|e| format!("Failed to parse answer SDP: {}", e))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| format!("Failed to set remote description: {}", e))
    }

    /// Add a trickled ICE candidate from the remote side.
    pub async fn add_ice_candidate(&self, candidate_json: &str) -> Result<(), String> {
        let candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit =
            serde_json::from_str(candidate_json)
                .map_err(|e| format!("Failed to parse ICE candidate: {}", e))?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| format!("Failed to add ICE candidate: {}", e))?;
        debug!("Added remote ICE candidate");
        Ok(())
    }

    pub async fn stats(&self) -> StatsReport {
        self.pc.get_stats().await
    }

    /// Weak reference for the quality sampler; upgrading fails once the
    /// session is gone, which is the sampler's cue to stop.
    pub fn downgrade(&self) -> Weak<RTCPeerConnection> {
        Arc::downgrade(&self.pc)
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing stream connection: {}", e);
        }
    }
}
