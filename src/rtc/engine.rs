//! PeerConnection factory
//!
//! Builds `RTCPeerConnection` instances with the configured ICE servers and
//! provides the SDP/candidate helpers shared by rooms and streams.

use super::RtcError;
use crate::config::WebRtcConfig;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Shared factory for peer connections and forwarding tracks
pub struct RtcEngine {
    config: WebRtcConfig,
}

impl RtcEngine {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    /// Create a peer connection with default codecs and RTCP interceptors.
    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RtcError::ConnectionFailed(format!("codec registration: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RtcError::ConnectionFailed(format!("interceptor registration: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| RtcError::ConnectionFailed(e.to_string()))?;

        Ok(Arc::new(pc))
    }

    /// Create a local RTP track that forwards a publisher's media.
    pub fn new_forwarding_track(
        capability: RTCRtpCodecCapability,
        track_id: &str,
        stream_id: &str,
    ) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            capability,
            track_id.to_string(),
            stream_id.to_string(),
        ))
    }

    /// Apply a remote offer and produce the local answer SDP.
    pub async fn answer_offer(
        pc: &Arc<RTCPeerConnection>,
        sdp: &str,
    ) -> Result<String, RtcError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| RtcError::SdpError(format!("invalid offer: {}", e)))?;

        pc.set_remote_description(offer)
            .await
            .map_err(|e| RtcError::SdpError(format!("set remote description: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| RtcError::SdpError(format!("create answer: {}", e)))?;

        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| RtcError::SdpError(format!("set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    /// Apply a remote answer.
    pub async fn apply_answer(pc: &Arc<RTCPeerConnection>, sdp: &str) -> Result<(), RtcError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| RtcError::SdpError(format!("invalid answer: {}", e)))?;

        pc.set_remote_description(answer)
            .await
            .map_err(|e| RtcError::SdpError(format!("set remote description: {}", e)))?;

        Ok(())
    }

    /// Add a trickled ICE candidate. The payload is the browser's
    /// `RTCIceCandidateInit` JSON.
    pub async fn add_ice_candidate(
        pc: &Arc<RTCPeerConnection>,
        payload: &serde_json::Value,
    ) -> Result<(), RtcError> {
        let init: RTCIceCandidateInit = serde_json::from_value(payload.clone())
            .map_err(|e| RtcError::IceError(format!("invalid candidate payload: {}", e)))?;

        pc.add_ice_candidate(init)
            .await
            .map_err(|e| RtcError::IceError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;

    #[tokio::test]
    async fn test_peer_connection_creation() {
        let engine = RtcEngine::new(WebRtcConfig::default());
        let pc = engine.new_peer_connection().await.unwrap();
        pc.close().await.unwrap();
    }

    #[test]
    fn test_invalid_candidate_payload() {
        let payload = serde_json::json!(42);
        let init: Result<RTCIceCandidateInit, _> = serde_json::from_value(payload);
        assert!(init.is_err());
    }
}
