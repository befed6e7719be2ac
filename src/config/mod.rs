//! Configuration management

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    /// Client configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// One remote multiplexing endpoint a client can establish sessions to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Server address (host:port)
    pub address: String,
    /// Username presented during the session handshake
    #[serde(default)]
    pub username: String,
    /// Password presented during the session handshake
    #[serde(default)]
    pub password: String,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote endpoints; sessions are spread across all of them
    pub servers: Vec<ServerEndpoint>,
    /// Local SOCKS5 proxy address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks5_listen: Option<String>,
    /// Local HTTP proxy address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_listen: Option<String>,
    /// Keep at least this many sessions alive
    #[serde(default = "default_min_sessions")]
    pub min_sessions: usize,
    /// Grow the pool once a session carries this many streams
    #[serde(default = "default_max_conns_per_session")]
    pub max_conns_per_session: usize,
}

fn default_min_sessions() -> usize {
    1
}

fn default_max_conns_per_session() -> usize {
    16
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerEndpoint {
                address: "127.0.0.1:7000".to_string(),
                username: String::new(),
                password: String::new(),
            }],
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            http_listen: Some("127.0.0.1:8080".to_string()),
            min_sessions: default_min_sessions(),
            max_conns_per_session: default_max_conns_per_session(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Allowed credentials; an empty table means open access
    #[serde(default)]
    pub users: HashMap<String, String>,
    /// Maximum concurrent client sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_sessions() -> usize {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7000".to_string(),
            users: HashMap::new(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_toml() {
        let config = generate_example_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(
            parsed.client.as_ref().unwrap().servers[0].address,
            config.client.as_ref().unwrap().servers[0].address
        );
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_minimal_client_config() {
        let parsed: Config = toml::from_str(
            r#"
            [[client.servers]]
            address = "198.51.100.7:7000"
            username = "alice"
            password = "sekrit"
            "#,
        )
        .unwrap();

        let client = parsed.client.unwrap();
        assert_eq!(client.min_sessions, 1);
        assert_eq!(client.max_conns_per_session, 16);
        assert!(parsed.server.is_none());
    }
}
