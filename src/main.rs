//! parley-core - Main entry point
//!
//! A real-time communication server hosting two session kinds over
//! long-lived WebSocket connections:
//! - rooms: symmetric multi-party audio/video meetings with chat
//! - streams: one-to-many broadcasts with a chat side-channel
//!
//! For each session the server relays WebRTC signaling and forwards the
//! publisher's RTP to every subscriber.

mod args;
mod config;
mod hub;
mod rtc;
mod session;
mod transport;
mod web;

use args::Args;
use clap::Parser;
use config::Config;
use log::{info, warn};
use session::Registry;
use std::sync::Arc;
use web::SharedState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration before logging so the configured level applies;
    // any load error is reported right after the logger comes up.
    let (config, config_error) = match Config::load(&args.config) {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };

    // Initialize logging: PARLEY_LOG wins, then --verbose, then the file.
    let default_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("PARLEY_LOG", default_level),
    );

    info!("parley-core v{}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        warn!("Failed to load config: {}, using defaults", e);
    }

    let port = config.resolve_port(args.port);
    let addr = format!("{}:{}", config.server.host, port);

    let registry = Registry::new(Arc::new(config));
    registry.spawn_expiry_sweep();

    let state = Arc::new(SharedState::new(registry));
    web::run_http_server(&addr, state).await?;

    info!("shutdown complete");
    Ok(())
}
