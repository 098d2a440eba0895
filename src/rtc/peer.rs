//! Peer state
//!
//! One `Peer` wraps one participant's server-side `RTCPeerConnection`
//! together with its identity, track maps, and data channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

/// Participant role within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Moderator,
    Participant,
    Broadcaster,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Moderator => "moderator",
            Role::Participant => "participant",
            Role::Broadcaster => "broadcaster",
            Role::Viewer => "viewer",
        }
    }

    /// Room roles come from an untrusted query parameter; anything other
    /// than `moderator` is coerced to `participant`.
    pub fn from_query(value: &str) -> Role {
        match value {
            "moderator" => Role::Moderator,
            _ => Role::Participant,
        }
    }
}

/// External identity carried on join (opaque to this server)
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            role,
        }
    }
}

/// Which media kinds a peer currently publishes
#[derive(Debug, Default)]
pub struct MediaFlags {
    pub video: AtomicBool,
    pub audio: AtomicBool,
    pub screen: AtomicBool,
}

impl MediaFlags {
    pub fn video(&self) -> bool {
        self.video.load(Ordering::Relaxed)
    }

    pub fn audio(&self) -> bool {
        self.audio.load(Ordering::Relaxed)
    }

    pub fn screen(&self) -> bool {
        self.screen.load(Ordering::Relaxed)
    }

    pub fn set(&self, video: Option<bool>, audio: Option<bool>, screen: Option<bool>) {
        if let Some(v) = video {
            self.video.store(v, Ordering::Relaxed);
        }
        if let Some(a) = audio {
            self.audio.store(a, Ordering::Relaxed);
        }
        if let Some(s) = screen {
            self.screen.store(s, Ordering::Relaxed);
        }
    }
}

/// One participant's side of a peer connection
pub struct Peer {
    /// Session-unique peer ID
    pub id: String,
    pub identity: Identity,
    pub joined_at: Instant,
    pub pc: Arc<RTCPeerConnection>,
    /// Forwarding tracks attached to this peer's connection, keyed by track ID
    pub local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticRTP>>>,
    /// Media received from this peer, keyed by track ID
    pub remote_tracks: Mutex<HashMap<String, Arc<TrackRemote>>>,
    /// Data channel opened by the client, once negotiated
    pub data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    /// Mirrors the ICE connection state
    pub connected: AtomicBool,
    pub media: MediaFlags,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("connected", &self.connected)
            .finish()
    }
}

impl Peer {
    pub fn new(id: String, identity: Identity, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            id,
            identity,
            joined_at: Instant::now(),
            pc,
            local_tracks: Mutex::new(HashMap::new()),
            remote_tracks: Mutex::new(HashMap::new()),
            data_channel: Mutex::new(None),
            connected: AtomicBool::new(false),
            media: MediaFlags::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Close the underlying peer connection. Safe to call more than once;
    /// the webrtc crate treats a second close as a no-op.
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            log::debug!("peer {}: close error: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_coercion() {
        assert_eq!(Role::from_query("moderator"), Role::Moderator);
        assert_eq!(Role::from_query("participant"), Role::Participant);
        assert_eq!(Role::from_query("admin"), Role::Participant);
        assert_eq!(Role::from_query(""), Role::Participant);
    }

    #[test]
    fn test_media_flags_partial_update() {
        let flags = MediaFlags::default();
        flags.set(Some(true), None, None);
        assert!(flags.video.load(Ordering::Relaxed));
        assert!(!flags.audio.load(Ordering::Relaxed));
        flags.set(None, Some(true), Some(true));
        assert!(flags.video.load(Ordering::Relaxed));
        assert!(flags.screen.load(Ordering::Relaxed));
    }
}
