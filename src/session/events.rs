//! Wire event envelopes
//!
//! One JSON object per WebSocket frame. Every event is a typed variant
//! here; the serialized shape matches the protocol the browser clients
//! already speak (`{"event": ..., "data": {...}}` for socket events,
//! `{"type":"system", ...}` for hub system frames, and
//! `{type, room, peer, timestamp, data}` for data-channel room events).

use crate::rtc::Identity;
use serde::Serialize;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Events fanned out to session sockets.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SocketEvent {
    PeerJoined {
        peer_id: String,
        user_id: String,
        username: String,
        role: String,
    },
    PeerLeft {
        peer_id: String,
        user_id: String,
    },
    StreamEnded {
        stream_id: String,
        duration_secs: u64,
        total_viewers: u64,
        peak_viewers: u64,
    },
    SettingsUpdated {
        stream_id: String,
        settings: Value,
    },
}

impl SocketEvent {
    pub fn peer_joined(peer_id: &str, identity: &Identity) -> Self {
        SocketEvent::PeerJoined {
            peer_id: peer_id.to_string(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            role: identity.role.as_str().to_string(),
        }
    }

    pub fn peer_left(peer_id: &str, identity: &Identity) -> Self {
        SocketEvent::PeerLeft {
            peer_id: peer_id.to_string(),
            user_id: identity.user_id.clone(),
        }
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Hub system frame: `{"type":"system","event":...,"time":...,"data":{...}}`
#[derive(Debug, Serialize)]
struct SystemFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'a str,
    time: u64,
    data: T,
}

fn system_frame<T: Serialize>(event: &str, data: T) -> String {
    let frame = SystemFrame {
        kind: "system",
        event,
        time: unix_now(),
        data,
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

pub fn user_joined_frame(identity: &Identity) -> String {
    system_frame(
        "user_joined",
        serde_json::json!({
            "user_id": identity.user_id,
            "username": identity.username,
        }),
    )
}

pub fn user_left_frame(identity: &Identity) -> String {
    system_frame(
        "user_left",
        serde_json::json!({
            "user_id": identity.user_id,
            "username": identity.username,
        }),
    )
}

/// History replay sent to a newly registered hub member, oldest first.
pub fn history_frame(messages: &[&str]) -> String {
    system_frame("history", serde_json::json!({ "messages": messages }))
}

/// Room events carried over peer data channels.
#[derive(Debug, Clone, Serialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: RoomEventKind,
    pub room: String,
    pub peer: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEventKind {
    PeerJoin,
    PeerLeave,
    ChatMessage,
    PeerStatus,
}

impl RoomEvent {
    pub fn new(kind: RoomEventKind, room: &str, peer: &str, data: Value) -> Self {
        Self {
            kind,
            room: room.to_string(),
            peer: peer.to_string(),
            timestamp: unix_now(),
            data,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::Role;

    #[test]
    fn test_peer_joined_envelope() {
        let identity = Identity::new("u1", "alice", Role::Moderator);
        let frame = SocketEvent::peer_joined("p1", &identity).to_frame();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "peer_joined");
        assert_eq!(parsed["data"]["peer_id"], "p1");
        assert_eq!(parsed["data"]["role"], "moderator");
    }

    #[test]
    fn test_stream_ended_envelope() {
        let frame = SocketEvent::StreamEnded {
            stream_id: "s1".to_string(),
            duration_secs: 12,
            total_viewers: 4,
            peak_viewers: 3,
        }
        .to_frame();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["event"], "stream_ended");
        assert_eq!(parsed["data"]["stream_id"], "s1");
    }

    #[test]
    fn test_history_frame_shape() {
        let frame = history_frame(&["a", "b"]);
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "system");
        assert_eq!(parsed["event"], "history");
        assert_eq!(parsed["data"]["messages"][1], "b");
    }

    #[test]
    fn test_room_event_tag() {
        let event = RoomEvent::new(
            RoomEventKind::ChatMessage,
            "r1",
            "p1",
            serde_json::json!({"message": "hi"}),
        );
        let parsed: Value = serde_json::from_slice(&event.to_payload()).unwrap();
        assert_eq!(parsed["type"], "chat_message");
        assert_eq!(parsed["room"], "r1");
        assert_eq!(parsed["data"]["message"], "hi");
    }
}
