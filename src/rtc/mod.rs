//! WebRTC media plane
//!
//! Peer connection management for rooms and streams:
//! - PeerConnection factory with configured ICE servers
//! - Per-session peer bookkeeping and signal routing
//! - RTP forwarding tracks fed from publisher media

pub mod engine;
pub mod peer;
pub mod peer_manager;
pub mod signal;

pub use engine::RtcEngine;
pub use peer::{Identity, MediaFlags, Peer, Role};
pub use peer_manager::{EventSink, PeerManager};
pub use signal::{Signal, SignalJob, SignalKind};

use std::error::Error;
use std::fmt;

/// Errors surfaced by the media/signaling plane
#[derive(Debug)]
#[allow(dead_code)]
pub enum RtcError {
    /// Peer connection creation or close failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Media track error
    MediaError(String),
    /// Session not found in the registry
    SessionNotFound(String),
    /// Peer not found in its session
    PeerNotFound(String),
    /// A peer with this ID already exists
    DuplicatePeer(String),
    /// Session is no longer accepting joins or signals
    SessionClosed(String),
    /// Participant or viewer limit reached
    CapacityExceeded(String),
    /// A stream already has a broadcaster
    BroadcasterPresent(String),
    /// Chat is disabled for this stream
    ChatDisabled(String),
    /// Caller is not the owner of the session
    NotOwner(String),
    /// Signal type not understood by the router
    UnsupportedSignal(String),
}

impl fmt::Display for RtcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            RtcError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            RtcError::IceError(msg) => write!(f, "ICE error: {}", msg),
            RtcError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            RtcError::MediaError(msg) => write!(f, "Media error: {}", msg),
            RtcError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            RtcError::PeerNotFound(id) => write!(f, "Peer not found: {}", id),
            RtcError::DuplicatePeer(id) => write!(f, "Peer already exists: {}", id),
            RtcError::SessionClosed(id) => write!(f, "Session closed: {}", id),
            RtcError::CapacityExceeded(id) => write!(f, "Capacity reached: {}", id),
            RtcError::BroadcasterPresent(id) => write!(f, "Broadcaster already set: {}", id),
            RtcError::ChatDisabled(id) => write!(f, "Chat disabled: {}", id),
            RtcError::NotOwner(id) => write!(f, "Not the session owner: {}", id),
            RtcError::UnsupportedSignal(kind) => write!(f, "Unsupported signal type: {}", kind),
        }
    }
}

impl Error for RtcError {}
