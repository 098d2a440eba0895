//! Configuration management for parley-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Room session configuration
    #[serde(default)]
    pub room: RoomConfig,

    /// Stream session configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRtcConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listen port; overridden by `PORT` and `--port`
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Maximum participants per room; 0 means unlimited
    pub max_participants: usize,

    /// Chat frames replayed to late joiners
    pub history_size: usize,

    /// Seconds before an idle room is swept; 0 disables expiry
    pub max_age_secs: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_participants: 0,
            history_size: 100,
            max_age_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum concurrent viewers per stream; 0 means unlimited
    pub max_viewers: usize,

    /// Whether stream chat hubs accept subscribers by default
    pub enable_chat: bool,

    /// Chat frames replayed to late joiners
    pub history_size: usize,

    /// Seconds before a stream is swept; 0 disables expiry
    pub max_age_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_viewers: 0,
            enable_chat: true,
            history_size: 100,
            max_age_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// STUN/TURN server URLs (e.g., "stun:stun.l.google.com:19302")
    pub urls: Vec<String>,

    /// Username for TURN authentication (optional)
    #[serde(default)]
    pub username: Option<String>,

    /// Credential for TURN authentication (optional)
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// ICE servers for NAT traversal
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::default()]
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            room: RoomConfig::default(),
            stream: StreamConfig::default(),
            webrtc: WebRtcConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields defaults.
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the listen port: `PORT` env var wins over the file value,
    /// an explicit flag wins over both.
    pub fn resolve_port(&self, flag: Option<u16>) -> u16 {
        if let Some(port) = flag {
            return port;
        }
        if let Ok(value) = std::env::var("PORT") {
            if let Ok(port) = value.parse() {
                return port;
            }
        }
        self.server.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.room.history_size, 100);
        assert_eq!(config.stream.max_viewers, 0);
        assert!(config.stream.enable_chat);
        assert_eq!(
            config.webrtc.ice_servers[0].urls[0],
            "stun:stun.l.google.com:19302"
        );
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 8443

            [stream]
            max_viewers = 50
            enable_chat = false
            history_size = 10
            max_age_secs = 0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.stream.max_viewers, 50);
        assert!(!config.stream.enable_chat);
        assert_eq!(config.room.max_participants, 0);
    }

    #[test]
    fn test_flag_overrides_port() {
        let config = Config::default();
        assert_eq!(config.resolve_port(Some(9000)), 9000);
    }
}
