//! Signaling wire types
//!
//! One JSON object per WebSocket text frame. Signals carried between a
//! participant and the session that terminates its peer connection.

use super::RtcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How many pending signals a session queues before dropping new ones.
/// Producers (socket readers, ICE callbacks) never block on a full queue.
pub const SIGNAL_QUEUE_CAPACITY: usize = 100;

/// Signal type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// A signaling message relayed through a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from_peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
}

impl Signal {
    /// Parse a text frame as a signal. Frames that are not JSON objects with
    /// a recognized `type` tag are rejected.
    pub fn from_json(text: &str) -> Result<Self, RtcError> {
        serde_json::from_str(text)
            .map_err(|e| RtcError::UnsupportedSignal(format!("invalid signal: {}", e)))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The peer whose connection this signal applies to.
    pub fn target(&self) -> &str {
        self.to_peer.as_deref().unwrap_or(&self.from_peer)
    }

    pub fn answer(session_id: &str, from_peer: &str, to_peer: &str, sdp: String) -> Self {
        Self {
            kind: SignalKind::Answer,
            from_peer: from_peer.to_string(),
            to_peer: Some(to_peer.to_string()),
            session_id: session_id.to_string(),
            data: serde_json::json!({ "sdp": sdp }),
        }
    }

    pub fn ice_candidate(session_id: &str, from_peer: &str, candidate: Value) -> Self {
        Self {
            kind: SignalKind::IceCandidate,
            from_peer: from_peer.to_string(),
            to_peer: None,
            session_id: session_id.to_string(),
            data: candidate,
        }
    }

    /// Extract the SDP payload. Accepts both a bare string and an
    /// `{"sdp": "..."}` object (browsers send `RTCSessionDescription` JSON).
    pub fn sdp(&self) -> Result<String, RtcError> {
        match &self.data {
            Value::String(s) => Ok(s.clone()),
            Value::Object(map) => map
                .get("sdp")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RtcError::SdpError("missing sdp field".to_string())),
            _ => Err(RtcError::SdpError("unexpected sdp payload".to_string())),
        }
    }
}

/// Work item on a session's signal queue.
///
/// Inbound signals come from sockets and are applied to peer connections;
/// outbound signals are produced by peer-connection callbacks (server ICE
/// candidates) and are delivered back over the owning sockets.
#[derive(Debug)]
pub enum SignalJob {
    Inbound(Signal),
    Outbound(Signal),
    /// Session close: the worker drains nothing further and exits.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer() {
        let json = r#"{"type":"offer","from_peer":"p1","session_id":"s1","data":{"sdp":"v=0"}}"#;
        let sig = Signal::from_json(json).unwrap();
        assert_eq!(sig.kind, SignalKind::Offer);
        assert_eq!(sig.target(), "p1");
        assert_eq!(sig.sdp().unwrap(), "v=0");
    }

    #[test]
    fn test_parse_targeted_candidate() {
        let json = r#"{"type":"ice-candidate","from_peer":"p1","to_peer":"p2","session_id":"s1","data":{"candidate":"candidate:1"}}"#;
        let sig = Signal::from_json(json).unwrap();
        assert_eq!(sig.kind, SignalKind::IceCandidate);
        assert_eq!(sig.target(), "p2");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type":"renegotiate","from_peer":"p1","session_id":"s1"}"#;
        assert!(Signal::from_json(json).is_err());
    }

    #[test]
    fn test_bare_string_sdp() {
        let json = r#"{"type":"answer","from_peer":"p1","session_id":"s1","data":"v=0\r\n"}"#;
        let sig = Signal::from_json(json).unwrap();
        assert_eq!(sig.sdp().unwrap(), "v=0\r\n");
    }

    #[test]
    fn test_serialized_tag_names() {
        let sig = Signal::answer("s1", "server", "p1", "v=0".to_string());
        let json = sig.to_json();
        assert!(json.contains(r#""type":"answer""#));
        assert!(json.contains(r#""to_peer":"p1""#));
    }
}
