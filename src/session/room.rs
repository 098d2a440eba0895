//! Room sessions
//!
//! A room is symmetric: every peer may publish and every peer subscribes to
//! every other peer's media. Chat and presence ride the room hub; room
//! events also go out over the peer data channels.

use super::events::{self, RoomEvent, RoomEventKind, SocketEvent};
use crate::config::RoomConfig;
use crate::hub::Hub;
use crate::rtc::{
    EventSink, Identity, Peer, PeerManager, RtcEngine, RtcError, Signal, SignalJob,
};
use crate::rtc::signal::SIGNAL_QUEUE_CAPACITY;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

/// Application hook for opaque (non-JSON) data-channel payloads.
pub type MessageCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A symmetric multi-party session
pub struct Room {
    pub id: String,
    pub created_unix: u64,
    max_participants: usize,
    active: AtomicBool,
    pub hub: Hub,
    pub peers: PeerManager,
    signal_tx: mpsc::Sender<SignalJob>,
    /// Forwarding tracks keyed by the publisher's track ID
    forwards: Mutex<HashMap<String, Arc<TrackLocalStaticRTP>>>,
    expires_at: Option<Instant>,
    message_callback: OnceLock<MessageCallback>,
}

impl Room {
    pub fn new(id: String, config: &RoomConfig, engine: Arc<RtcEngine>) -> Arc<Room> {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let hub = Hub::spawn(id.clone(), config.history_size);
        let expires_at = (config.max_age_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(config.max_age_secs));

        let room = Arc::new(Room {
            peers: PeerManager::new(id.clone(), engine, signal_tx.clone()),
            id,
            created_unix: events::unix_now(),
            max_participants: config.max_participants,
            active: AtomicBool::new(true),
            hub,
            signal_tx,
            forwards: Mutex::new(HashMap::new()),
            expires_at,
            message_callback: OnceLock::new(),
        });

        let sink: Weak<dyn EventSink> = Arc::downgrade(&(room.clone() as Arc<dyn EventSink>));
        room.peers.bind_events(sink);
        tokio::spawn(Self::signal_worker(Arc::downgrade(&room), signal_rx));
        info!("room {} created", room.id);
        room
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.count().await
    }

    /// Register the hook that receives opaque data-channel payloads.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        let _ = self.message_callback.set(callback);
    }

    /// Admit a peer, enforcing the participant limit when one is set.
    pub async fn add_peer(&self, peer_id: &str, identity: Identity) -> Result<Arc<Peer>, RtcError> {
        if !self.is_active() {
            return Err(RtcError::SessionClosed(self.id.clone()));
        }
        if self.max_participants > 0 && self.peers.count().await >= self.max_participants {
            return Err(RtcError::CapacityExceeded(self.id.clone()));
        }

        let peer = self.peers.create_peer(peer_id, identity).await?;

        // Late joiners still get media that started before they arrived.
        let existing: Vec<Arc<TrackLocalStaticRTP>> =
            self.forwards.lock().await.values().cloned().collect();
        for track in existing {
            if let Err(e) = self.peers.attach_track(&peer, track).await {
                warn!("room {}: attach existing track to {} failed: {}", self.id, peer_id, e);
            }
        }

        let event = RoomEvent::new(
            RoomEventKind::PeerJoin,
            &self.id,
            peer_id,
            serde_json::json!({
                "user_id": peer.identity.user_id,
                "username": peer.identity.username,
                "role": peer.identity.role.as_str(),
            }),
        );
        self.peers.broadcast_to_peers(&event.to_payload()).await;

        Ok(peer)
    }

    pub async fn remove_peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.remove_peer(peer_id).await
    }

    /// Queue an inbound signal. A full queue drops the signal with a log
    /// line; the submitting socket is never blocked.
    pub fn submit_signal(&self, signal: Signal) -> Result<(), RtcError> {
        if !self.is_active() {
            return Err(RtcError::SessionClosed(self.id.clone()));
        }
        if self.signal_tx.try_send(SignalJob::Inbound(signal)).is_err() {
            warn!("room {}: signal queue full, dropped inbound signal", self.id);
        }
        Ok(())
    }

    async fn signal_worker(room: Weak<Room>, mut rx: mpsc::Receiver<SignalJob>) {
        while let Some(job) = rx.recv().await {
            let Some(room) = room.upgrade() else { break };
            match job {
                SignalJob::Shutdown => break,
                SignalJob::Inbound(signal) => match room.peers.process_signal(&signal).await {
                    Ok(Some(answer)) => {
                        room.hub.send_to(&signal.from_peer, answer.to_json()).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "room {}: {} from {} dropped: {}",
                            room.id,
                            signal.kind.as_str(),
                            signal.from_peer,
                            e
                        );
                    }
                },
                // Server-side candidates are broadcast to the room; clients
                // filter on from_peer.
                SignalJob::Outbound(signal) => room.hub.broadcast(signal.to_json()).await,
            }
        }
        debug!("room signal worker stopped");
    }

    /// Fan a socket event out to every member of the room hub.
    pub async fn broadcast_event(&self, event: &SocketEvent) {
        self.hub.broadcast(event.to_frame()).await;
    }

    /// Flip inactive, stop the signal worker, close every peer connection,
    /// and drop all hub members.
    pub async fn close(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            info!("room {} closing", self.id);
            let _ = self.signal_tx.try_send(SignalJob::Shutdown);
            self.peers.close_all().await;
            self.hub.close().await;
        }
    }
}

#[async_trait]
impl EventSink for Room {
    async fn on_peer_connected(&self, peer_id: &str) {
        info!("room {}: peer {} connected", self.id, peer_id);
    }

    async fn on_peer_disconnected(&self, peer_id: &str) {
        info!("room {}: peer {} disconnected", self.id, peer_id);
    }

    async fn on_peer_leave(&self, peer: &Peer) {
        let event = RoomEvent::new(
            RoomEventKind::PeerLeave,
            &self.id,
            &peer.id,
            serde_json::json!({ "user_id": peer.identity.user_id }),
        );
        self.peers.broadcast_to_peers(&event.to_payload()).await;
    }

    async fn on_new_track(&self, peer_id: &str, track: Arc<TrackRemote>) {
        let track_id = track.id();
        let mut forwards = self.forwards.lock().await;
        let local = match forwards.get(&track_id) {
            Some(existing) => existing.clone(),
            None => {
                let local = RtcEngine::new_forwarding_track(
                    track.codec().capability.clone(),
                    &track_id,
                    &format!("room-{}", self.id),
                );
                forwards.insert(track_id.clone(), local.clone());

                let reader = track.clone();
                let writer = local.clone();
                let room_id = self.id.clone();
                tokio::spawn(async move {
                    loop {
                        match reader.read_rtp().await {
                            Ok((packet, _)) => {
                                if let Err(e) = writer.write_rtp(&packet).await {
                                    debug!("room {}: forward write stopped: {}", room_id, e);
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("room {}: publisher track {} ended: {}", room_id, track_id, e);
                                break;
                            }
                        }
                    }
                });
                local
            }
        };
        drop(forwards);

        self.peers.attach_track_to_others(peer_id, local).await;
    }

    async fn on_data_channel_message(&self, peer_id: &str, data: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(data) else {
            if let Some(callback) = self.message_callback.get() {
                callback(peer_id, data);
            }
            return;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("chat") => {
                let payload = value.get("data").cloned().unwrap_or(Value::Null);
                let event =
                    RoomEvent::new(RoomEventKind::ChatMessage, &self.id, peer_id, payload);
                self.peers.broadcast_to_peers(&event.to_payload()).await;
            }
            Some("status") => {
                let payload = value.get("data").cloned().unwrap_or(Value::Null);
                if let Some(peer) = self.peers.get(peer_id).await {
                    peer.media.set(
                        payload.get("video").and_then(Value::as_bool),
                        payload.get("audio").and_then(Value::as_bool),
                        payload.get("screen").and_then(Value::as_bool),
                    );
                }
                let event =
                    RoomEvent::new(RoomEventKind::PeerStatus, &self.id, peer_id, payload);
                self.peers.broadcast_to_peers(&event.to_payload()).await;
            }
            Some(other) => {
                debug!("room {}: ignoring data channel type '{}'", self.id, other);
            }
            None => {
                if let Some(callback) = self.message_callback.get() {
                    callback(peer_id, data);
                }
            }
        }
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

    fn identity(user: &str) -> Identity {
        Identity::new(user, user, Role::Participant)
    }

    #[tokio::test]
    async fn test_participant_limit() {
        let config = RoomConfig {
            max_participants: 1,
            ..RoomConfig::default()
        };
        let room = Room::new("r1".to_string(), &config, engine());

        room.add_peer("p1", identity("u1")).await.unwrap();
        let err = room.add_peer("p2", identity("u2")).await.unwrap_err();
        assert!(matches!(err, RtcError::CapacityExceeded(_)));

        room.close().await;
    }

    #[tokio::test]
    async fn test_unlimited_when_zero() {
        let config = RoomConfig::default();
        let room = Room::new("r1".to_string(), &config, engine());

        room.add_peer("p1", identity("u1")).await.unwrap();
        room.add_peer("p2", identity("u2")).await.unwrap();
        room.add_peer("p3", identity("u3")).await.unwrap();
        assert_eq!(room.peer_count().await, 3);

        room.close().await;
    }

    #[tokio::test]
    async fn test_opaque_payloads_reach_the_callback() {
        let room = Room::new("r1".to_string(), &RoomConfig::default(), engine());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        room.set_message_callback(Box::new(move |peer_id, data| {
            sink.lock().unwrap().push((peer_id.to_string(), data.to_vec()));
        }));

        // Binary garbage and type-less JSON are opaque; a recognized type
        // is handled in-protocol; an unknown type is dropped.
        room.on_data_channel_message("p1", &[0x01, 0x02]).await;
        room.on_data_channel_message("p1", br#"{"hello":1}"#).await;
        room.on_data_channel_message("p1", br#"{"type":"bogus"}"#).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "p1");
        assert_eq!(seen[0].1, vec![0x01, 0x02]);
        drop(seen);
        room.close().await;
    }

    #[tokio::test]
    async fn test_closed_room_rejects_joins_and_signals() {
        let room = Room::new("r1".to_string(), &RoomConfig::default(), engine());
        room.close().await;

        let err = room.add_peer("p1", identity("u1")).await.unwrap_err();
        assert!(matches!(err, RtcError::SessionClosed(_)));

        let signal = Signal::from_json(
            r#"{"type":"offer","from_peer":"p1","session_id":"r1","data":"v=0"}"#,
        )
        .unwrap();
        assert!(matches!(
            room.submit_signal(signal),
            Err(RtcError::SessionClosed(_))
        ));
        assert_eq!(room.peer_count().await, 0);
    }
}
