//! HTTP server
//!
//! REST endpoints for session management, aggregate stats, and the
//! WebSocket upgrade routes. All responses are JSON.

use crate::rtc::RtcError;
use crate::session::StreamState;
use crate::transport::sockets;
use crate::web::shared::SharedState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Build the full router. Split out from `run_http_server` so tests can
/// construct it without binding a listener.
pub fn build_router(state: Arc<SharedState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/docs", get(docs_handler))
        .route("/rooms", get(list_rooms_handler))
        .route("/streams", get(list_streams_handler))
        .route("/room/create", get(create_room_handler))
        .route("/room/{uuid}", get(room_info_handler))
        .route("/room/{uuid}/websocket", get(sockets::room_ws))
        .route("/room/{uuid}/chat/websocket", get(sockets::room_chat_ws))
        .route("/room/{uuid}/viewer/websocket", get(sockets::room_viewer_ws))
        .route("/stream/create", get(create_stream_handler))
        .route("/stream/{ssuid}", get(stream_info_handler))
        .route(
            "/stream/{ssuid}/end",
            get(end_stream_handler).post(end_stream_handler),
        )
        .route(
            "/stream/{ssuid}/settings",
            axum::routing::post(update_settings_handler),
        )
        .route("/stream/{ssuid}/websocket", get(sockets::stream_broadcast_ws))
        .route(
            "/stream/{ssuid}/viewer/websocket",
            get(sockets::stream_viewer_ws),
        )
        .route("/stream/{ssuid}/chat/websocket", get(sockets::stream_chat_ws))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until shutdown. A bind failure propagates to the caller;
/// the process does not survive it.
pub async fn run_http_server(
    addr: &str,
    state: Arc<SharedState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

fn not_found(err: &RtcError) -> Response {
    error_response(StatusCode::NOT_FOUND, &err.to_string())
}

async fn index_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "name": "parley-core",
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["rooms", "streams", "chat", "webrtc-sfu"],
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "health": "ok" }))
}

async fn stats_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    let stats = state.registry.stats().await;
    Json(json!({
        "status": "success",
        "uptime_secs": state.uptime().as_secs(),
        "active_rooms": stats.active_rooms,
        "active_streams": stats.active_streams,
        "active_connections": stats.active_connections,
        "active_viewers": stats.active_viewers,
    }))
}

async fn list_rooms_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    let mut rooms = Vec::new();
    for room in state.registry.rooms().await {
        rooms.push(json!({
            "id": room.id,
            "peer_count": room.peer_count().await,
            "created_at": room.created_unix,
        }));
    }
    Json(json!({ "status": "success", "rooms": rooms }))
}

async fn list_streams_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    let mut streams = Vec::new();
    for stream in state.registry.streams().await {
        if stream.state() != StreamState::Live {
            continue;
        }
        let settings = stream.settings();
        streams.push(json!({
            "id": stream.id,
            "user_id": stream.owner.user_id,
            "username": stream.owner.username,
            "title": settings.title,
            "viewer_count": stream.viewer_count(),
            "created_at": stream.created_unix,
        }));
    }
    Json(json!({ "status": "success", "streams": streams }))
}

async fn create_room_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    let room = state.registry.create_room().await;
    Json(json!({ "status": "success", "room_id": room.id }))
}

async fn room_info_handler(
    Path(uuid): Path<String>,
    State(state): State<Arc<SharedState>>,
) -> Response {
    match state.registry.room(&uuid).await {
        Ok(room) => {
            let mut peers = Vec::new();
            for peer in room.peers.snapshot().await {
                peers.push(json!({
                    "peer_id": peer.id,
                    "user_id": peer.identity.user_id,
                    "username": peer.identity.username,
                    "role": peer.identity.role.as_str(),
                    "connected": peer.is_connected(),
                    "publishing_tracks": peer.remote_tracks.lock().await.len(),
                    "media": {
                        "video": peer.media.video(),
                        "audio": peer.media.audio(),
                        "screen": peer.media.screen(),
                    },
                    "joined_secs_ago": peer.joined_at.elapsed().as_secs(),
                }));
            }
            Json(json!({
                "status": "success",
                "room": {
                    "id": room.id,
                    "peer_count": peers.len(),
                    "peers": peers,
                    "created_at": room.created_unix,
                    "active": room.is_active(),
                }
            }))
            .into_response()
        }
        Err(e) => not_found(&e),
    }
}

#[derive(Debug, Deserialize)]
struct StreamCreateQuery {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    title: Option<String>,
}

async fn create_stream_handler(
    Query(query): Query<StreamCreateQuery>,
    State(state): State<Arc<SharedState>>,
) -> Response {
    if query.user_id.is_empty() || query.username.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id and username are required");
    }

    let owner = crate::rtc::Identity::new(
        query.user_id,
        query.username.clone(),
        crate::rtc::Role::Broadcaster,
    );
    let title = query
        .title
        .unwrap_or_else(|| format!("{}'s stream", query.username));
    let stream = state.registry.create_stream(owner, title).await;
    Json(json!({ "status": "success", "stream_id": stream.id })).into_response()
}

fn stream_info_json(stream: &Arc<crate::session::Stream>) -> Value {
    let settings = stream.settings();
    let stats = stream.stats();
    json!({
        "id": stream.id,
        "user_id": stream.owner.user_id,
        "username": stream.owner.username,
        "title": settings.title,
        "state": stats.state,
        "viewer_count": stats.current_viewers,
        "peak_viewers": stats.peak_viewers,
        "total_viewers": stats.total_viewers,
        "duration_secs": stats.duration_secs,
        "enable_chat": settings.enable_chat,
        "max_viewers": settings.max_viewers,
        "created_at": stream.created_unix,
    })
}

async fn stream_info_handler(
    Path(ssuid): Path<String>,
    State(state): State<Arc<SharedState>>,
) -> Response {
    match state.registry.stream(&ssuid).await {
        Ok(stream) => {
            Json(json!({ "status": "success", "stream": stream_info_json(&stream) }))
                .into_response()
        }
        Err(e) => not_found(&e),
    }
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    #[serde(default)]
    user_id: String,
}

/// `GET|POST /stream/{ssuid}/end`: owner ends the stream.
async fn end_stream_handler(
    Path(ssuid): Path<String>,
    Query(query): Query<OwnerQuery>,
    State(state): State<Arc<SharedState>>,
) -> Response {
    let stream = match state.registry.stream(&ssuid).await {
        Ok(stream) => stream,
        Err(e) => return not_found(&e),
    };
    if stream.owner.user_id != query.user_id {
        return error_response(StatusCode::FORBIDDEN, "only the owner may end the stream");
    }

    stream.close().await;
    state.registry.remove_stream(&ssuid).await;
    Json(json!({ "status": "success", "stream_id": ssuid })).into_response()
}

/// `POST /stream/{ssuid}/settings`: owner updates the settings body.
async fn update_settings_handler(
    Path(ssuid): Path<String>,
    Query(query): Query<OwnerQuery>,
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Response {
    let stream = match state.registry.stream(&ssuid).await {
        Ok(stream) => stream,
        Err(e) => return not_found(&e),
    };
    if stream.owner.user_id != query.user_id {
        return error_response(StatusCode::FORBIDDEN, "only the owner may update settings");
    }

    let applied = stream.update_settings(&body).await;
    Json(json!({
        "status": "success",
        "stream_id": ssuid,
        "settings": serde_json::to_value(&applied).unwrap_or(Value::Null),
    }))
    .into_response()
}

async fn docs_handler() -> Json<Value> {
    Json(json!({
        "status": "success",
        "endpoints": [
            { "path": "/", "method": "GET", "description": "Server info" },
            { "path": "/health", "method": "GET", "description": "Liveness check" },
            { "path": "/stats", "method": "GET", "description": "Aggregate session counts" },
            { "path": "/rooms", "method": "GET", "description": "List rooms" },
            { "path": "/streams", "method": "GET", "description": "List live streams" },
            { "path": "/room/create", "method": "GET", "description": "Create a room" },
            { "path": "/room/{uuid}", "method": "GET", "description": "Room info" },
            { "path": "/room/{uuid}/websocket", "method": "GET", "description": "Room participant socket" },
            { "path": "/room/{uuid}/chat/websocket", "method": "GET", "description": "Room chat socket" },
            { "path": "/room/{uuid}/viewer/websocket", "method": "GET", "description": "Read-only room socket" },
            { "path": "/stream/create", "method": "GET", "description": "Create a stream (user_id, username required)" },
            { "path": "/stream/{ssuid}", "method": "GET", "description": "Stream info" },
            { "path": "/stream/{ssuid}/end", "method": "POST", "description": "End a stream (owner only)" },
            { "path": "/stream/{ssuid}/settings", "method": "POST", "description": "Update stream settings (owner only)" },
            { "path": "/stream/{ssuid}/websocket", "method": "GET", "description": "Broadcaster socket" },
            { "path": "/stream/{ssuid}/viewer/websocket", "method": "GET", "description": "Viewer socket" },
            { "path": "/stream/{ssuid}/chat/websocket", "method": "GET", "description": "Stream chat socket" },
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::Registry;

    fn state() -> Arc<SharedState> {
        Arc::new(SharedState::new(Registry::new(Arc::new(Config::default()))))
    }

    #[tokio::test]
    async fn test_router_builds() {
        let _ = build_router(state());
    }

    #[tokio::test]
    async fn test_stats_empty_registry() {
        let state = state();
        let stats = state.registry.stats().await;
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.active_streams, 0);
        assert_eq!(stats.active_connections, 0);
    }
}
