//! Per-session peer bookkeeping and signal routing
//!
//! The peer manager owns the peers of one session, wires the
//! peer-connection callbacks, and applies inbound signals. Session-level
//! reactions (track forwarding, lifecycle events) are delivered through the
//! `EventSink` capability the session binds after construction, so neither
//! rooms nor streams are referenced from here directly.

use super::engine::RtcEngine;
use super::peer::{Identity, Peer};
use super::signal::{Signal, SignalJob, SignalKind};
use super::RtcError;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{mpsc, RwLock};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Session-side reactions to peer lifecycle and media events.
///
/// Implemented by both `Room` and `Stream`; the manager holds only a weak
/// handle, so a closed session simply stops receiving callbacks.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_peer_connected(&self, peer_id: &str);
    async fn on_peer_disconnected(&self, peer_id: &str);
    /// Fired after a peer has been removed and its connection closed.
    async fn on_peer_leave(&self, peer: &Peer);
    /// A publisher started sending media on a new remote track.
    async fn on_new_track(&self, peer_id: &str, track: Arc<TrackRemote>);
    async fn on_data_channel_message(&self, peer_id: &str, data: &[u8]);
}

/// Owns the peers of one session
pub struct PeerManager {
    session_id: String,
    engine: Arc<RtcEngine>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    events: OnceLock<Weak<dyn EventSink>>,
    signal_tx: mpsc::Sender<SignalJob>,
}

impl PeerManager {
    pub fn new(
        session_id: String,
        engine: Arc<RtcEngine>,
        signal_tx: mpsc::Sender<SignalJob>,
    ) -> Self {
        Self {
            session_id,
            engine,
            peers: RwLock::new(HashMap::new()),
            events: OnceLock::new(),
            signal_tx,
        }
    }

    /// Bind the owning session's event sink. Called once, right after the
    /// session is wrapped in an `Arc`.
    pub fn bind_events(&self, sink: Weak<dyn EventSink>) {
        let _ = self.events.set(sink);
    }

    fn events(&self) -> Option<Arc<dyn EventSink>> {
        self.events.get().and_then(Weak::upgrade)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Create a peer, wire its connection callbacks, and insert it.
    /// Fails if a peer with this ID already exists.
    pub async fn create_peer(
        &self,
        id: &str,
        identity: Identity,
    ) -> Result<Arc<Peer>, RtcError> {
        if self.peers.read().await.contains_key(id) {
            return Err(RtcError::DuplicatePeer(id.to_string()));
        }

        let pc = self.engine.new_peer_connection().await?;
        let peer = Arc::new(Peer::new(id.to_string(), identity, pc));
        self.wire_callbacks(&peer);

        let mut peers = self.peers.write().await;
        if peers.contains_key(id) {
            drop(peers);
            peer.close().await;
            return Err(RtcError::DuplicatePeer(id.to_string()));
        }
        peers.insert(id.to_string(), peer.clone());
        drop(peers);

        info!(
            "session {}: peer {} created (user {})",
            self.session_id, id, peer.identity.user_id
        );
        Ok(peer)
    }

    fn wire_callbacks(&self, peer: &Arc<Peer>) {
        let events: Option<Weak<dyn EventSink>> = self.events.get().cloned();

        // ICE connection state mirrors into `peer.connected`; the session
        // is told only about edges, not every repeated state.
        let peer_state = peer.clone();
        let events_state = events.clone();
        peer.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let peer = peer_state.clone();
                let events = events_state.clone();
                Box::pin(async move {
                    debug!("peer {}: ice state {}", peer.id, state);
                    match state {
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                            let was = peer
                                .connected
                                .swap(true, std::sync::atomic::Ordering::Relaxed);
                            if !was {
                                if let Some(sink) = events.as_ref().and_then(Weak::upgrade) {
                                    sink.on_peer_connected(&peer.id).await;
                                }
                            }
                        }
                        RTCIceConnectionState::Disconnected
                        | RTCIceConnectionState::Failed
                        | RTCIceConnectionState::Closed => {
                            let was = peer
                                .connected
                                .swap(false, std::sync::atomic::Ordering::Relaxed);
                            if was {
                                if let Some(sink) = events.as_ref().and_then(Weak::upgrade) {
                                    sink.on_peer_disconnected(&peer.id).await;
                                }
                            }
                        }
                        _ => {}
                    }
                })
            }));

        // Server-side candidates go onto the session's signal queue and are
        // delivered back over the owning socket. Never blocks.
        let session_id = self.session_id.clone();
        let peer_id = peer.id.clone();
        let signal_tx = self.signal_tx.clone();
        peer.pc.on_ice_candidate(Box::new(move |candidate| {
            let session_id = session_id.clone();
            let peer_id = peer_id.clone();
            let signal_tx = signal_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return; // end of gathering
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("peer {}: candidate marshal failed: {}", peer_id, e);
                        return;
                    }
                };
                match serde_json::to_value(&init) {
                    Ok(payload) => {
                        let signal = Signal::ice_candidate(&session_id, &peer_id, payload);
                        if signal_tx.try_send(SignalJob::Outbound(signal)).is_err() {
                            warn!("peer {}: signal queue full, candidate dropped", peer_id);
                        }
                    }
                    Err(e) => warn!("peer {}: candidate encode failed: {}", peer_id, e),
                }
            })
        }));

        let peer_track = peer.clone();
        let events_track = events.clone();
        peer.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let peer = peer_track.clone();
            let events = events_track.clone();
            Box::pin(async move {
                let track_id = track.id();
                info!(
                    "peer {}: remote track {} ({}, ssrc {})",
                    peer.id,
                    track_id,
                    track.kind(),
                    track.ssrc()
                );
                peer.remote_tracks
                    .lock()
                    .await
                    .insert(track_id, track.clone());
                if let Some(sink) = events.as_ref().and_then(Weak::upgrade) {
                    sink.on_new_track(&peer.id, track).await;
                }
            })
        }));

        let peer_dc = peer.clone();
        let events_dc = events;
        peer.pc.on_data_channel(Box::new(move |channel| {
            let peer = peer_dc.clone();
            let events = events_dc.clone();
            Box::pin(async move {
                info!("peer {}: data channel '{}'", peer.id, channel.label());

                let peer_id = peer.id.clone();
                let events_msg = events.clone();
                channel.on_message(Box::new(move |msg: DataChannelMessage| {
                    let peer_id = peer_id.clone();
                    let events = events_msg.clone();
                    Box::pin(async move {
                        if let Some(sink) = events.as_ref().and_then(Weak::upgrade) {
                            sink.on_data_channel_message(&peer_id, &msg.data).await;
                        }
                    })
                }));

                *peer.data_channel.lock().await = Some(channel);
            })
        }));
    }

    /// Remove a peer, close its connection, and fire the leave hook.
    pub async fn remove_peer(&self, id: &str) -> Option<Arc<Peer>> {
        let peer = self.peers.write().await.remove(id)?;
        peer.close().await;
        if let Some(sink) = self.events() {
            sink.on_peer_leave(&peer).await;
        }
        info!("session {}: peer {} removed", self.session_id, id);
        Some(peer)
    }

    /// Close every peer connection and clear the map. Leave hooks are not
    /// fired; the session is tearing down as a whole.
    pub async fn close_all(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close().await;
        }
    }

    /// Apply an inbound signal (symmetric room semantics): the target peer
    /// is `to_peer` when present, otherwise the sender's own connection.
    /// Offers yield the answer to relay back to `from_peer`.
    pub async fn process_signal(&self, signal: &Signal) -> Result<Option<Signal>, RtcError> {
        let target = self
            .get(signal.target())
            .await
            .ok_or_else(|| RtcError::PeerNotFound(signal.target().to_string()))?;

        match signal.kind {
            SignalKind::Offer => {
                let answer = RtcEngine::answer_offer(&target.pc, &signal.sdp()?).await?;
                Ok(Some(Signal::answer(
                    &self.session_id,
                    &target.id,
                    &signal.from_peer,
                    answer,
                )))
            }
            SignalKind::Answer => {
                RtcEngine::apply_answer(&target.pc, &signal.sdp()?).await?;
                Ok(None)
            }
            SignalKind::IceCandidate => {
                RtcEngine::add_ice_candidate(&target.pc, &signal.data).await?;
                Ok(None)
            }
        }
    }

    /// Apply an offer on one peer's connection and return the answer SDP.
    pub async fn answer_offer_for(&self, peer_id: &str, sdp: &str) -> Result<String, RtcError> {
        let peer = self
            .get(peer_id)
            .await
            .ok_or_else(|| RtcError::PeerNotFound(peer_id.to_string()))?;
        RtcEngine::answer_offer(&peer.pc, sdp).await
    }

    pub async fn apply_answer_for(&self, peer_id: &str, sdp: &str) -> Result<(), RtcError> {
        let peer = self
            .get(peer_id)
            .await
            .ok_or_else(|| RtcError::PeerNotFound(peer_id.to_string()))?;
        RtcEngine::apply_answer(&peer.pc, sdp).await
    }

    pub async fn add_candidate_for(
        &self,
        peer_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RtcError> {
        let peer = self
            .get(peer_id)
            .await
            .ok_or_else(|| RtcError::PeerNotFound(peer_id.to_string()))?;
        RtcEngine::add_ice_candidate(&peer.pc, payload).await
    }

    /// Attach a forwarding track to one peer's connection and drain RTCP on
    /// the resulting sender. Deduplicated by track ID.
    pub async fn attach_track(
        &self,
        peer: &Arc<Peer>,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<(), RtcError> {
        let mut locals = peer.local_tracks.lock().await;
        if locals.contains_key(track.id()) {
            return Ok(());
        }

        let sender = peer
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RtcError::MediaError(format!("add track: {}", e)))?;
        locals.insert(track.id().to_string(), track);
        drop(locals);

        // RTCP must be read off the sender or interceptor feedback stalls.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        Ok(())
    }

    /// Attach a forwarding track to every peer except its publisher.
    pub async fn attach_track_to_others(
        &self,
        from_peer_id: &str,
        track: Arc<TrackLocalStaticRTP>,
    ) {
        for peer in self.snapshot().await {
            if peer.id == from_peer_id {
                continue;
            }
            if let Err(e) = self.attach_track(&peer, track.clone()).await {
                warn!(
                    "session {}: attach track to {} failed: {}",
                    self.session_id, peer.id, e
                );
            }
        }
    }

    /// Send a payload to every peer's data channel (best effort).
    pub async fn broadcast_to_peers(&self, payload: &[u8]) {
        let data = Bytes::copy_from_slice(payload);
        for peer in self.snapshot().await {
            let channel = peer.data_channel.lock().await.clone();
            if let Some(channel) = channel {
                if let Err(e) = channel.send(&data).await {
                    debug!("peer {}: data channel send failed: {}", peer.id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::rtc::peer::Role;
    use crate::rtc::signal::SIGNAL_QUEUE_CAPACITY;

    fn manager() -> PeerManager {
        let (tx, _rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        PeerManager::new(
            "session-1".to_string(),
            Arc::new(RtcEngine::new(WebRtcConfig::default())),
            tx,
        )
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let manager = manager();
        let identity = Identity::new("u1", "alice", Role::Participant);
        manager.create_peer("p1", identity.clone()).await.unwrap();
        let err = manager.create_peer("p1", identity).await.unwrap_err();
        assert!(matches!(err, RtcError::DuplicatePeer(_)));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_signal_for_unknown_peer() {
        let manager = manager();
        let signal = Signal::from_json(
            r#"{"type":"answer","from_peer":"ghost","session_id":"session-1","data":"v=0"}"#,
        )
        .unwrap();
        let err = manager.process_signal(&signal).await.unwrap_err();
        assert!(matches!(err, RtcError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_peer_twice() {
        let manager = manager();
        let identity = Identity::new("u1", "alice", Role::Participant);
        manager.create_peer("p1", identity).await.unwrap();
        assert!(manager.remove_peer("p1").await.is_some());
        assert!(manager.remove_peer("p1").await.is_none());
        assert_eq!(manager.count().await, 0);
    }
}
