//! Server configuration with environment overrides.

use std::env;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broker URL; `None` disables the cross-instance relay entirely
    pub redis_url: Option<String>,
    /// Maximum inbound WebSocket message size in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            redis_url: Some("redis://127.0.0.1:6379/0".to_string()),
            max_message_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `COLLAB_BIND_ADDR`, `COLLAB_REDIS_URL`
    /// (empty string disables the relay) and `COLLAB_MAX_MESSAGE_SIZE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = env::var("COLLAB_BIND_ADDR") {
            if !addr.is_empty() {
                config.bind_addr = addr;
            }
        }
        if let Ok(url) = env::var("COLLAB_REDIS_URL") {
            config.redis_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Ok(size) = env::var("COLLAB_MAX_MESSAGE_SIZE") {
            match size.parse() {
                Ok(size) => config.max_message_size = size,
                Err(_) => log::warn!("ignoring invalid COLLAB_MAX_MESSAGE_SIZE: {size}"),
            }
        }
        config
    }
}
