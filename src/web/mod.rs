//! HTTP surface
//!
//! REST endpoints for session management plus the WebSocket upgrade routes.

pub mod shared;
pub use shared::SharedState;

pub mod http_server;
pub use http_server::run_http_server;
