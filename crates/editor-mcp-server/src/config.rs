//! Server configuration

use std::time::Duration;

/// Environment variable overriding the WebSocket bind address
pub const ENV_ADDR: &str = "EDITOR_MCP_ADDR";
/// Environment variable overriding the WebSocket path
pub const ENV_PATH: &str = "EDITOR_MCP_PATH";
/// Environment variable overriding the tool call timeout, in seconds
pub const ENV_TIMEOUT_SECS: &str = "EDITOR_MCP_TIMEOUT_SECS";

/// Configuration for the bridge server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to (default: 127.0.0.1:8080)
    pub bind_addr: String,
    /// Path hosts must upgrade on (default: /ws)
    pub path: String,
    /// Window for a tool call reply (default: 30s)
    pub request_timeout: Duration,
    /// Window for the host's tool catalog (default: 5s)
    pub list_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            path: "/ws".into(),
            request_timeout: Duration::from_secs(30),
            list_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by any `EDITOR_MCP_*` variables that are set
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup(ENV_PATH) {
            config.path = normalize_path(&path);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS).and_then(|s| s.parse::<u64>().ok()) {
            config.request_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// URL hosts should connect to
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.bind_addr, self.path)
    }
}

/// Ensure the path has exactly one leading slash
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.url(), "ws://127.0.0.1:8080/ws");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(|key| match key {
            ENV_ADDR => Some("0.0.0.0:9000".into()),
            ENV_PATH => Some("bridge".into()),
            ENV_TIMEOUT_SECS => Some("5".into()),
            _ => None,
        });

        assert_eq!(config.url(), "ws://0.0.0.0:9000/bridge");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_timeout_keeps_default() {
        let config = ServerConfig::from_lookup(|key| match key {
            ENV_TIMEOUT_SECS => Some("soon".into()),
            _ => None,
        });
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
