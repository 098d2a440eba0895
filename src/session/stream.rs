//! Stream sessions
//!
//! A stream is asymmetric: one broadcaster publishes, viewers subscribe.
//! The stream owns one canonical video track and one canonical audio track,
//! fed from the broadcaster's remote tracks and attached to every viewer's
//! connection. Viewer events ride the main hub; chat has its own hub.
//!
//! Lifecycle: created -> live (broadcaster attached) -> ended.

use super::events::{self, SocketEvent};
use crate::config::StreamConfig;
use crate::hub::Hub;
use crate::rtc::{
    EventSink, Identity, Peer, PeerManager, RtcEngine, RtcError, Signal, SignalJob, SignalKind,
};
use crate::rtc::signal::SIGNAL_QUEUE_CAPACITY;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Created,
    Live,
    Ended,
}

/// Owner-updatable stream settings
#[derive(Debug, Clone, Serialize)]
pub struct StreamSettings {
    pub title: String,
    /// Maximum concurrent viewers; 0 means unlimited
    pub max_viewers: usize,
    pub enable_chat: bool,
}

/// Point-in-time stream statistics
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub state: StreamState,
    pub current_viewers: usize,
    pub peak_viewers: u64,
    pub total_viewers: u64,
    pub duration_secs: u64,
}

/// Viewer bookkeeping and counters, mutated under one lock.
struct Counters {
    viewers: HashSet<String>,
    total_viewers: u64,
    peak_viewers: u64,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

/// A one-to-many broadcast session
pub struct Stream {
    pub id: String,
    /// Identity of the creator; only this user may broadcast, end, or
    /// reconfigure the stream.
    pub owner: Identity,
    pub created_unix: u64,
    settings: StdRwLock<StreamSettings>,
    state: StdRwLock<StreamState>,
    counters: StdMutex<Counters>,
    broadcaster: StdRwLock<Option<String>>,
    /// Fan-out to the broadcaster's and every viewer's socket
    pub hub: Hub,
    /// Chat side-channel
    pub chat: Hub,
    pub peers: PeerManager,
    signal_tx: mpsc::Sender<SignalJob>,
    video_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    audio_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    expires_at: Option<Instant>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}

impl Stream {
    pub fn new(
        id: String,
        owner: Identity,
        title: String,
        config: &StreamConfig,
        engine: Arc<RtcEngine>,
    ) -> Arc<Stream> {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let hub = Hub::spawn(format!("{}:viewers", id), 0);
        let chat = Hub::spawn(format!("{}:chat", id), config.history_size);
        let expires_at = (config.max_age_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(config.max_age_secs));

        let stream = Arc::new(Stream {
            peers: PeerManager::new(id.clone(), engine, signal_tx.clone()),
            id,
            owner,
            created_unix: events::unix_now(),
            settings: StdRwLock::new(StreamSettings {
                title,
                max_viewers: config.max_viewers,
                enable_chat: config.enable_chat,
            }),
            state: StdRwLock::new(StreamState::Created),
            counters: StdMutex::new(Counters {
                viewers: HashSet::new(),
                total_viewers: 0,
                peak_viewers: 0,
                started_at: None,
                ended_at: None,
            }),
            broadcaster: StdRwLock::new(None),
            hub,
            chat,
            signal_tx,
            video_track: Mutex::new(None),
            audio_track: Mutex::new(None),
            expires_at,
        });

        let sink: Weak<dyn EventSink> = Arc::downgrade(&(stream.clone() as Arc<dyn EventSink>));
        stream.peers.bind_events(sink);
        tokio::spawn(Self::signal_worker(Arc::downgrade(&stream), signal_rx));
        info!("stream {} created (owner {})", stream.id, stream.owner.user_id);
        stream
    }

    pub fn state(&self) -> StreamState {
        *self.state.read().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.state() != StreamState::Ended
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub fn settings(&self) -> StreamSettings {
        self.settings.read().unwrap().clone()
    }

    pub fn chat_enabled(&self) -> bool {
        self.settings.read().unwrap().enable_chat
    }

    /// Whether a chat socket may subscribe right now.
    pub fn chat_subscription(&self) -> Result<(), RtcError> {
        if !self.is_active() {
            return Err(RtcError::SessionClosed(self.id.clone()));
        }
        if !self.chat_enabled() {
            return Err(RtcError::ChatDisabled(self.id.clone()));
        }
        Ok(())
    }

    pub fn broadcaster_id(&self) -> Option<String> {
        self.broadcaster.read().unwrap().clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.counters.lock().unwrap().viewers.len()
    }

    pub fn stats(&self) -> StreamStats {
        let counters = self.counters.lock().unwrap();
        let end = counters.ended_at.unwrap_or_else(Instant::now);
        let duration = counters
            .started_at
            .map(|start| end.saturating_duration_since(start))
            .unwrap_or_default();
        StreamStats {
            state: self.state(),
            current_viewers: counters.viewers.len(),
            peak_viewers: counters.peak_viewers,
            total_viewers: counters.total_viewers,
            duration_secs: duration.as_secs(),
        }
    }

    /// Attach the broadcaster. Fails if the stream ended or a broadcaster
    /// is already present.
    pub async fn set_broadcaster(
        &self,
        peer_id: &str,
        identity: Identity,
    ) -> Result<Arc<Peer>, RtcError> {
        if !self.is_active() {
            return Err(RtcError::SessionClosed(self.id.clone()));
        }
        if self.broadcaster.read().unwrap().is_some() {
            return Err(RtcError::BroadcasterPresent(self.id.clone()));
        }

        let peer = self.peers.create_peer(peer_id, identity).await?;

        *self.broadcaster.write().unwrap() = Some(peer_id.to_string());
        *self.state.write().unwrap() = StreamState::Live;
        self.counters.lock().unwrap().started_at.get_or_insert_with(Instant::now);

        info!("stream {} live (broadcaster {})", self.id, peer_id);
        Ok(peer)
    }

    /// Admit a viewer, enforcing the viewer limit when one is set
    /// (`max_viewers = 0` means unlimited).
    pub async fn add_viewer(
        &self,
        peer_id: &str,
        identity: Identity,
    ) -> Result<Arc<Peer>, RtcError> {
        if !self.is_active() {
            return Err(RtcError::SessionClosed(self.id.clone()));
        }
        {
            let settings = self.settings.read().unwrap();
            let counters = self.counters.lock().unwrap();
            if settings.max_viewers > 0 && counters.viewers.len() >= settings.max_viewers {
                return Err(RtcError::CapacityExceeded(self.id.clone()));
            }
        }

        let peer = self.peers.create_peer(peer_id, identity).await?;

        {
            let mut counters = self.counters.lock().unwrap();
            counters.viewers.insert(peer_id.to_string());
            counters.total_viewers += 1;
            counters.peak_viewers = counters.peak_viewers.max(counters.viewers.len() as u64);
        }

        Ok(peer)
    }

    pub async fn remove_peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.remove_peer(peer_id).await
    }

    /// Queue an inbound signal; a full queue drops it with a log line.
    pub fn submit_signal(&self, signal: Signal) -> Result<(), RtcError> {
        if !self.is_active() {
            return Err(RtcError::SessionClosed(self.id.clone()));
        }
        if self.signal_tx.try_send(SignalJob::Inbound(signal)).is_err() {
            warn!("stream {}: signal queue full, dropped inbound signal", self.id);
        }
        Ok(())
    }

    async fn signal_worker(stream: Weak<Stream>, mut rx: mpsc::Receiver<SignalJob>) {
        while let Some(job) = rx.recv().await {
            let Some(stream) = stream.upgrade() else { break };
            match job {
                SignalJob::Shutdown => break,
                SignalJob::Inbound(signal) => {
                    if let Err(e) = stream.route_signal(&signal).await {
                        warn!(
                            "stream {}: {} from {} dropped: {}",
                            stream.id,
                            signal.kind.as_str(),
                            signal.from_peer,
                            e
                        );
                    }
                }
                // Server-side candidates go straight to the socket owning
                // the peer connection that produced them.
                SignalJob::Outbound(signal) => {
                    let frame = signal.to_json();
                    stream.hub.send_to(&signal.from_peer, frame).await;
                }
            }
        }
        debug!("stream signal worker stopped");
    }

    /// Route an inbound signal by sender, unlike the symmetric room router.
    async fn route_signal(&self, signal: &Signal) -> Result<(), RtcError> {
        let broadcaster = self.broadcaster_id();
        let from_broadcaster = broadcaster.as_deref() == Some(signal.from_peer.as_str());

        match signal.kind {
            SignalKind::Offer if from_broadcaster => {
                match signal.to_peer.as_deref() {
                    // Renegotiation the broadcaster drives toward a viewer.
                    Some(viewer_id) if Some(viewer_id) != broadcaster.as_deref() => {
                        let answer = self.peers.answer_offer_for(viewer_id, &signal.sdp()?).await?;
                        let reply =
                            Signal::answer(&self.id, viewer_id, &signal.from_peer, answer);
                        self.hub.send_to(&signal.from_peer, reply.to_json()).await;
                    }
                    // The broadcaster's own publish offer.
                    _ => {
                        let answer = self
                            .peers
                            .answer_offer_for(&signal.from_peer, &signal.sdp()?)
                            .await?;
                        let reply = Signal::answer(
                            &self.id,
                            &signal.from_peer,
                            &signal.from_peer,
                            answer,
                        );
                        self.hub.send_to(&signal.from_peer, reply.to_json()).await;
                    }
                }
            }
            SignalKind::Offer => {
                // A viewer's subscribe offer: attach the canonical tracks
                // before answering so the SDP advertises them.
                let viewer_id = signal.from_peer.as_str();
                let peer = self
                    .peers
                    .get(viewer_id)
                    .await
                    .ok_or_else(|| RtcError::PeerNotFound(viewer_id.to_string()))?;
                if let Some(video) = self.video_track.lock().await.clone() {
                    self.peers.attach_track(&peer, video).await?;
                }
                if let Some(audio) = self.audio_track.lock().await.clone() {
                    self.peers.attach_track(&peer, audio).await?;
                }
                let answer = self.peers.answer_offer_for(viewer_id, &signal.sdp()?).await?;
                let reply = Signal::answer(&self.id, viewer_id, viewer_id, answer);
                self.hub.send_to(viewer_id, reply.to_json()).await;
            }
            SignalKind::Answer => {
                let broadcaster =
                    broadcaster.ok_or_else(|| RtcError::PeerNotFound("broadcaster".to_string()))?;
                self.peers.apply_answer_for(&broadcaster, &signal.sdp()?).await?;
            }
            SignalKind::IceCandidate => {
                // Routed by to_peer; an unknown target is an error.
                self.peers
                    .add_candidate_for(signal.target(), &signal.data)
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply an owner-supplied settings body and fan the update out.
    pub async fn update_settings(&self, body: &Value) -> StreamSettings {
        let applied = {
            let mut settings = self.settings.write().unwrap();
            if let Some(title) = body.get("title").and_then(Value::as_str) {
                settings.title = title.to_string();
            }
            if let Some(max) = body.get("max_viewers").and_then(Value::as_u64) {
                settings.max_viewers = max as usize;
            }
            if let Some(chat) = body.get("enable_chat").and_then(Value::as_bool) {
                settings.enable_chat = chat;
            }
            settings.clone()
        };

        let event = SocketEvent::SettingsUpdated {
            stream_id: self.id.clone(),
            settings: serde_json::to_value(&applied).unwrap_or(Value::Null),
        };
        let frame = event.to_frame();
        self.hub.broadcast(frame.clone()).await;
        self.chat.broadcast(frame).await;
        applied
    }

    /// End the stream: close every connection, emit the terminal
    /// `stream_ended` event, and drop both hubs.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().unwrap();
            if *state == StreamState::Ended {
                return;
            }
            *state = StreamState::Ended;
        }
        self.counters.lock().unwrap().ended_at = Some(Instant::now());
        info!("stream {} ending", self.id);

        let _ = self.signal_tx.try_send(SignalJob::Shutdown);
        self.peers.close_all().await;
        *self.broadcaster.write().unwrap() = None;

        let stats = self.stats();
        let event = SocketEvent::StreamEnded {
            stream_id: self.id.clone(),
            duration_secs: stats.duration_secs,
            total_viewers: stats.total_viewers,
            peak_viewers: stats.peak_viewers,
        };
        let frame = event.to_frame();
        self.hub.broadcast(frame.clone()).await;
        self.chat.broadcast(frame).await;
        self.hub.close().await;
        self.chat.close().await;
    }
}

#[async_trait]
impl EventSink for Stream {
    async fn on_peer_connected(&self, peer_id: &str) {
        info!("stream {}: peer {} connected", self.id, peer_id);
    }

    async fn on_peer_disconnected(&self, peer_id: &str) {
        info!("stream {}: peer {} disconnected", self.id, peer_id);
    }

    async fn on_peer_leave(&self, peer: &Peer) {
        let mut broadcaster = self.broadcaster.write().unwrap();
        if broadcaster.as_deref() == Some(peer.id.as_str()) {
            // The broadcaster may reconnect and re-attach.
            *broadcaster = None;
            info!("stream {}: broadcaster {} detached", self.id, peer.id);
        } else {
            drop(broadcaster);
            self.counters.lock().unwrap().viewers.remove(&peer.id);
        }
    }

    async fn on_new_track(&self, peer_id: &str, track: Arc<TrackRemote>) {
        if self.broadcaster_id().as_deref() != Some(peer_id) {
            debug!("stream {}: ignoring track from non-broadcaster {}", self.id, peer_id);
            return;
        }

        let is_video = track.kind() == RTPCodecType::Video;
        let slot = if is_video {
            &self.video_track
        } else {
            &self.audio_track
        };

        let local = {
            let mut guard = slot.lock().await;
            match &*guard {
                Some(existing) => existing.clone(),
                None => {
                    let label = if is_video { "video" } else { "audio" };
                    let local = RtcEngine::new_forwarding_track(
                        track.codec().capability.clone(),
                        label,
                        &format!("stream-{}", self.id),
                    );
                    *guard = Some(local.clone());
                    local
                }
            }
        };

        // Pump the broadcaster's RTP into the canonical track. On
        // reconnection a fresh pump feeds the same local track.
        let reader = track.clone();
        let writer = local.clone();
        let stream_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                match reader.read_rtp().await {
                    Ok((packet, _)) => {
                        if let Err(e) = writer.write_rtp(&packet).await {
                            debug!("stream {}: forward write stopped: {}", stream_id, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("stream {}: broadcaster track ended: {}", stream_id, e);
                        break;
                    }
                }
            }
        });

        self.peers.attach_track_to_others(peer_id, local).await;
    }

    async fn on_data_channel_message(&self, peer_id: &str, _data: &[u8]) {
        debug!("stream {}: data channel payload from {} ignored", self.id, peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::rtc::Role;

    fn engine() -> Arc<RtcEngine> {
        Arc::new(RtcEngine::new(WebRtcConfig::default()))
    }

    fn stream_with(config: StreamConfig) -> Arc<Stream> {
        Stream::new(
            "s1".to_string(),
            Identity::new("owner", "alice", Role::Broadcaster),
            "test stream".to_string(),
            &config,
            engine(),
        )
    }

    fn viewer(user: &str) -> Identity {
        Identity::new(user, user, Role::Viewer)
    }

    #[tokio::test]
    async fn test_zero_max_viewers_means_unlimited() {
        let stream = stream_with(StreamConfig {
            max_viewers: 0,
            ..StreamConfig::default()
        });
        for i in 0..3 {
            stream
                .add_viewer(&format!("v{}", i), viewer(&format!("u{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(stream.viewer_count(), 3);
        stream.close().await;
    }

    #[tokio::test]
    async fn test_viewer_limit_enforced() {
        let stream = stream_with(StreamConfig {
            max_viewers: 1,
            ..StreamConfig::default()
        });
        stream.add_viewer("v1", viewer("u1")).await.unwrap();
        let err = stream.add_viewer("v2", viewer("u2")).await.unwrap_err();
        assert!(matches!(err, RtcError::CapacityExceeded(_)));
        stream.close().await;
    }

    #[tokio::test]
    async fn test_single_broadcaster() {
        let stream = stream_with(StreamConfig::default());
        stream
            .set_broadcaster("b1", Identity::new("owner", "alice", Role::Broadcaster))
            .await
            .unwrap();
        assert_eq!(stream.state(), StreamState::Live);

        let err = stream
            .set_broadcaster("b2", Identity::new("owner", "alice", Role::Broadcaster))
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::BroadcasterPresent(_)));
        stream.close().await;
    }

    #[tokio::test]
    async fn test_stats_monotonic() {
        let stream = stream_with(StreamConfig::default());
        stream.add_viewer("v1", viewer("u1")).await.unwrap();
        stream.add_viewer("v2", viewer("u2")).await.unwrap();
        stream.remove_peer("v2").await;
        stream.add_viewer("v3", viewer("u3")).await.unwrap();

        let stats = stream.stats();
        assert_eq!(stats.total_viewers, 3);
        assert_eq!(stats.current_viewers, 2);
        assert!(stats.peak_viewers >= stats.current_viewers as u64);
        stream.close().await;
    }

    #[tokio::test]
    async fn test_ended_stream_rejects_everything() {
        let stream = stream_with(StreamConfig::default());
        stream.add_viewer("v1", viewer("u1")).await.unwrap();
        stream.close().await;

        let before = stream.stats();
        assert!(matches!(
            stream.add_viewer("v2", viewer("u2")).await,
            Err(RtcError::SessionClosed(_))
        ));
        assert!(matches!(
            stream
                .set_broadcaster("b1", Identity::new("owner", "alice", Role::Broadcaster))
                .await,
            Err(RtcError::BroadcasterPresent(_)) | Err(RtcError::SessionClosed(_))
        ));
        let signal = Signal::from_json(
            r#"{"type":"offer","from_peer":"v1","session_id":"s1","data":"v=0"}"#,
        )
        .unwrap();
        assert!(matches!(
            stream.submit_signal(signal),
            Err(RtcError::SessionClosed(_))
        ));

        // Rejections must not mutate state.
        let after = stream.stats();
        assert_eq!(before.total_viewers, after.total_viewers);
        assert_eq!(after.state, StreamState::Ended);
    }

    #[tokio::test]
    async fn test_settings_update() {
        let stream = stream_with(StreamConfig::default());
        assert!(stream.chat_enabled());

        let applied = stream
            .update_settings(&serde_json::json!({
                "title": "new title",
                "enable_chat": false,
                "max_viewers": 5,
            }))
            .await;
        assert_eq!(applied.title, "new title");
        assert!(!stream.chat_enabled());
        assert_eq!(stream.settings().max_viewers, 5);
        stream.close().await;
    }
}
