//! Shared state for the HTTP and WebSocket handlers

use crate::session::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handler state: the session registry plus process metadata. Created once
/// at startup; tests build a fresh one per case.
pub struct SharedState {
    pub registry: Arc<Registry>,
    pub start_time: Instant,
}

impl SharedState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            start_time: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
