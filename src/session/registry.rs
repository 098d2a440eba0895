//! Session registry
//!
//! Process-wide mapping from session ID to room or stream (distinct
//! namespaces). Created once at startup and passed into handlers; tests
//! instantiate a fresh registry per case.

use super::room::Room;
use super::stream::Stream;
use crate::config::Config;
use crate::rtc::{Identity, RtcEngine, RtcError};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// How often the expiry sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Aggregate counts for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub active_streams: usize,
    pub active_connections: usize,
    pub active_viewers: usize,
}

pub struct Registry {
    config: Arc<Config>,
    engine: Arc<RtcEngine>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Arc<Registry> {
        let engine = Arc::new(RtcEngine::new(config.webrtc.clone()));
        Arc::new(Registry {
            config,
            engine,
            rooms: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub async fn create_room(&self) -> Arc<Room> {
        let id = Uuid::new_v4().to_string();
        let room = Room::new(id.clone(), &self.config.room, self.engine.clone());
        self.rooms.write().await.insert(id, room.clone());
        room
    }

    pub async fn room(&self, id: &str) -> Result<Arc<Room>, RtcError> {
        self.rooms
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RtcError::SessionNotFound(id.to_string()))
    }

    pub async fn remove_room(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.write().await.remove(id)
    }

    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn create_stream(&self, owner: Identity, title: String) -> Arc<Stream> {
        let id = Uuid::new_v4().to_string();
        let stream = Stream::new(
            id.clone(),
            owner,
            title,
            &self.config.stream,
            self.engine.clone(),
        );
        self.streams.write().await.insert(id, stream.clone());
        stream
    }

    /// Resolve a stream for its broadcaster: absent streams are created on
    /// the spot; an existing stream with a different owner is refused.
    pub async fn stream_for_broadcaster(
        &self,
        id: &str,
        owner: Identity,
    ) -> Result<Arc<Stream>, RtcError> {
        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(id) {
            if existing.owner.user_id != owner.user_id {
                return Err(RtcError::NotOwner(id.to_string()));
            }
            return Ok(existing.clone());
        }

        let title = format!("{}'s stream", owner.username);
        let stream = Stream::new(
            id.to_string(),
            owner,
            title,
            &self.config.stream,
            self.engine.clone(),
        );
        streams.insert(id.to_string(), stream.clone());
        Ok(stream)
    }

    pub async fn stream(&self, id: &str) -> Result<Arc<Stream>, RtcError> {
        self.streams
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RtcError::SessionNotFound(id.to_string()))
    }

    pub async fn remove_stream(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.write().await.remove(id)
    }

    pub async fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms = self.rooms().await;
        let streams = self.streams().await;

        let mut connections = 0;
        for room in &rooms {
            connections += room.hub.member_count();
        }
        let mut viewers = 0;
        for stream in &streams {
            connections += stream.hub.member_count() + stream.chat.member_count();
            viewers += stream.viewer_count();
        }

        RegistryStats {
            active_rooms: rooms.len(),
            active_streams: streams.len(),
            active_connections: connections,
            active_viewers: viewers,
        }
    }

    /// Background task closing and removing expired or already-closed
    /// sessions.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep(Instant::now()).await;
            }
        });
    }

    pub async fn sweep(&self, now: Instant) {
        let expired_rooms: Vec<Arc<Room>> = self
            .rooms()
            .await
            .into_iter()
            .filter(|r| r.is_expired(now) || !r.is_active())
            .collect();
        for room in expired_rooms {
            info!("sweep: closing room {}", room.id);
            room.close().await;
            self.remove_room(&room.id).await;
        }

        let expired_streams: Vec<Arc<Stream>> = self
            .streams()
            .await
            .into_iter()
            .filter(|s| s.is_expired(now) || !s.is_active())
            .collect();
        for stream in expired_streams {
            info!("sweep: closing stream {}", stream.id);
            stream.close().await;
            self.remove_stream(&stream.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::Role;

    fn registry() -> Arc<Registry> {
        Registry::new(Arc::new(Config::default()))
    }

    fn owner() -> Identity {
        Identity::new("owner", "alice", Role::Broadcaster)
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let registry = registry();
        let room = registry.create_room().await;
        assert!(registry.room(&room.id).await.is_ok());

        registry.remove_room(&room.id).await;
        assert!(matches!(
            registry.room(&room.id).await,
            Err(RtcError::SessionNotFound(_))
        ));
        room.close().await;
    }

    #[tokio::test]
    async fn test_distinct_namespaces() {
        let registry = registry();
        let room = registry.create_room().await;
        // A room ID never resolves as a stream.
        assert!(registry.stream(&room.id).await.is_err());
        room.close().await;
    }

    #[tokio::test]
    async fn test_broadcaster_owner_check() {
        let registry = registry();
        let stream = registry
            .stream_for_broadcaster("s1", owner())
            .await
            .unwrap();
        assert_eq!(stream.owner.user_id, "owner");

        // Same owner resolves the same stream.
        let again = registry
            .stream_for_broadcaster("s1", owner())
            .await
            .unwrap();
        assert_eq!(again.id, stream.id);

        // A different user is refused.
        let err = registry
            .stream_for_broadcaster("s1", Identity::new("other", "bob", Role::Broadcaster))
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::NotOwner(_)));
        stream.close().await;
    }

    #[tokio::test]
    async fn test_sweep_removes_closed_sessions() {
        let registry = registry();
        let stream = registry.create_stream(owner(), "t".to_string()).await;
        stream.close().await;

        registry.sweep(Instant::now()).await;
        assert!(registry.stream(&stream.id).await.is_err());
    }
}
