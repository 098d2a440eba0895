//! WebSocket upgrade handlers
//!
//! One handler per endpoint. Identity comes from `user_id`/`username`
//! query parameters; an empty identity closes the socket before any peer
//! or hub client is created. Unknown sessions are refused with HTTP 404
//! before the upgrade.

use super::pump::{self, Inbound, READ_LIMIT};
use crate::hub::{Registration, MAILBOX_CAPACITY};
use crate::rtc::{Identity, Role};
use crate::session::events::SocketEvent;
use crate::web::shared::SharedState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct IdentityQuery {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    role: String,
}

impl IdentityQuery {
    /// Resolve the query into an identity; `None` when either field is
    /// empty, which must close the socket without creating anything.
    fn resolve(&self, default_role: Role) -> Option<Identity> {
        if self.user_id.is_empty() || self.username.is_empty() {
            return None;
        }
        let role = match default_role {
            Role::Participant | Role::Moderator => Role::from_query(&self.role),
            fixed => fixed,
        };
        Some(Identity::new(self.user_id.clone(), self.username.clone(), role))
    }
}

/// Close a socket that failed admission; no events are emitted.
async fn refuse(mut socket: WebSocket) {
    let _ = socket.send(Message::Close(None)).await;
}

/// `GET /room/{uuid}/websocket`: full room participant.
pub async fn room_ws(
    Path(uuid): Path<String>,
    Query(query): Query<IdentityQuery>,
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(room) = state.registry.room(&uuid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let Some(identity) = query.resolve(Role::Participant) else {
                return refuse(socket).await;
            };

            let peer_id = Uuid::new_v4().to_string();
            if let Err(e) = room.add_peer(&peer_id, identity.clone()).await {
                warn!("room {}: join refused: {}", room.id, e);
                return refuse(socket).await;
            }

            let (mailbox, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
            room.hub
                .register(Registration {
                    id: peer_id.clone(),
                    identity: identity.clone(),
                    mailbox,
                })
                .await;
            room.broadcast_event(&SocketEvent::peer_joined(&peer_id, &identity))
                .await;

            pump::run(
                socket,
                room.hub.clone(),
                &peer_id,
                mailbox_rx,
                Inbound::Room(room.clone()),
            )
            .await;

            room.remove_peer(&peer_id).await;
            room.broadcast_event(&SocketEvent::peer_left(&peer_id, &identity))
                .await;

            if room.peer_count().await == 0 {
                info!("room {}: last participant left", room.id);
                room.close().await;
                state.registry.remove_room(&room.id).await;
            }
        })
}

/// `GET /room/{uuid}/chat/websocket`: chat-only fan-out on the room hub.
pub async fn room_chat_ws(
    Path(uuid): Path<String>,
    Query(query): Query<IdentityQuery>,
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(room) = state.registry.room(&uuid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let Some(identity) = query.resolve(Role::Participant) else {
                return refuse(socket).await;
            };

            let client_id = Uuid::new_v4().to_string();
            let (mailbox, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
            room.hub
                .register(Registration {
                    id: client_id.clone(),
                    identity,
                    mailbox,
                })
                .await;

            let hub = room.hub.clone();
            pump::run(socket, hub.clone(), &client_id, mailbox_rx, Inbound::Chat(hub)).await;
        })
}

/// `GET /room/{uuid}/viewer/websocket`: read-only room viewer.
pub async fn room_viewer_ws(
    Path(uuid): Path<String>,
    Query(query): Query<IdentityQuery>,
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(room) = state.registry.room(&uuid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let Some(identity) = query.resolve(Role::Participant) else {
                return refuse(socket).await;
            };

            let client_id = Uuid::new_v4().to_string();
            let (mailbox, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
            room.hub
                .register(Registration {
                    id: client_id.clone(),
                    identity,
                    mailbox,
                })
                .await;

            pump::run(
                socket,
                room.hub.clone(),
                &client_id,
                mailbox_rx,
                Inbound::ReadOnly,
            )
            .await;
        })
}

/// `GET /stream/{ssuid}/websocket`: broadcaster. Auto-creates the stream;
/// refuses the upgrade when an existing stream belongs to someone else.
pub async fn stream_broadcast_ws(
    Path(ssuid): Path<String>,
    Query(query): Query<IdentityQuery>,
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(identity) = query.resolve(Role::Broadcaster) else {
        // Upgrade anyway so the client sees a clean close, not a 4xx page.
        return ws.on_upgrade(|socket| async move { refuse(socket).await });
    };

    let stream = match state
        .registry
        .stream_for_broadcaster(&ssuid, identity.clone())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!("stream {}: broadcaster refused: {}", ssuid, e);
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let peer_id = Uuid::new_v4().to_string();
            if let Err(e) = stream.set_broadcaster(&peer_id, identity.clone()).await {
                warn!("stream {}: broadcaster refused: {}", stream.id, e);
                return refuse(socket).await;
            }

            let (mailbox, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
            stream
                .hub
                .register(Registration {
                    id: peer_id.clone(),
                    identity,
                    mailbox,
                })
                .await;

            pump::run(
                socket,
                stream.hub.clone(),
                &peer_id,
                mailbox_rx,
                Inbound::Stream(stream.clone()),
            )
            .await;

            stream.remove_peer(&peer_id).await;
        })
}

/// `GET /stream/{ssuid}/viewer/websocket`: stream viewer.
pub async fn stream_viewer_ws(
    Path(ssuid): Path<String>,
    Query(query): Query<IdentityQuery>,
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(stream) = state.registry.stream(&ssuid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let Some(identity) = query.resolve(Role::Viewer) else {
                return refuse(socket).await;
            };

            let peer_id = Uuid::new_v4().to_string();
            if let Err(e) = stream.add_viewer(&peer_id, identity.clone()).await {
                warn!("stream {}: viewer refused: {}", stream.id, e);
                return refuse(socket).await;
            }

            let (mailbox, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
            stream
                .hub
                .register(Registration {
                    id: peer_id.clone(),
                    identity,
                    mailbox,
                })
                .await;

            pump::run(
                socket,
                stream.hub.clone(),
                &peer_id,
                mailbox_rx,
                Inbound::Stream(stream.clone()),
            )
            .await;

            stream.remove_peer(&peer_id).await;
        })
}

/// `GET /stream/{ssuid}/chat/websocket`: stream chat, refused when the
/// stream's chat is disabled.
pub async fn stream_chat_ws(
    Path(ssuid): Path<String>,
    Query(query): Query<IdentityQuery>,
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(stream) = state.registry.stream(&ssuid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Err(e) = stream.chat_subscription() {
        warn!("stream {}: chat subscribe refused: {}", stream.id, e);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| async move {
            let Some(identity) = query.resolve(Role::Viewer) else {
                return refuse(socket).await;
            };

            let client_id = Uuid::new_v4().to_string();
            let (mailbox, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
            stream
                .chat
                .register(Registration {
                    id: client_id.clone(),
                    identity,
                    mailbox,
                })
                .await;

            let chat = stream.chat.clone();
            pump::run(socket, chat.clone(), &client_id, mailbox_rx, Inbound::Chat(chat)).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_identity_rejected() {
        let query = IdentityQuery {
            user_id: String::new(),
            username: "alice".to_string(),
            role: String::new(),
        };
        assert!(query.resolve(Role::Participant).is_none());

        let query = IdentityQuery {
            user_id: "u1".to_string(),
            username: String::new(),
            role: String::new(),
        };
        assert!(query.resolve(Role::Viewer).is_none());
    }

    #[test]
    fn test_room_role_coerced() {
        let query = IdentityQuery {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            role: "superuser".to_string(),
        };
        let identity = query.resolve(Role::Participant).unwrap();
        assert_eq!(identity.role, Role::Participant);

        let query = IdentityQuery {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            role: "moderator".to_string(),
        };
        assert_eq!(query.resolve(Role::Participant).unwrap().role, Role::Moderator);
    }

    #[test]
    fn test_stream_roles_fixed() {
        let query = IdentityQuery {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            role: "moderator".to_string(),
        };
        assert_eq!(query.resolve(Role::Viewer).unwrap().role, Role::Viewer);
        assert_eq!(
            query.resolve(Role::Broadcaster).unwrap().role,
            Role::Broadcaster
        );
    }
}
