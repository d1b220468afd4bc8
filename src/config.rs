//! Flat key=value configuration with compiled-in defaults.
//!
//! The file format is fixed by the deployment tooling: one `KEY=value` pair
//! per line. Unknown keys and unparsable values are ignored, and a missing
//! file keeps every default, so the server always starts.

use log::{info, warn};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Runtime settings, populated once at startup and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub max_rooms: usize,
    pub max_clients: usize,
    pub bind_address: Ipv4Addr,
    pub disconnect_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 10000,
            max_rooms: 16,
            max_clients: 128,
            bind_address: Ipv4Addr::UNSPECIFIED,
            disconnect_grace_secs: 15,
        }
    }
}

impl ServerConfig {
    /// Reads the file at `path`, falling back to defaults when it is absent.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("Loaded configuration from {}", path.display());
                Self::parse(&text)
            }
            Err(_) => {
                warn!(
                    "No configuration file at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "PORT" => {
                    if let Ok(port) = value.parse() {
                        config.port = port;
                    }
                }
                "MAX_ROOMS" => {
                    if let Ok(max_rooms) = value.parse() {
                        config.max_rooms = max_rooms;
                    }
                }
                "MAX_CLIENTS" => {
                    if let Ok(max_clients) = value.parse() {
                        config.max_clients = max_clients;
                    }
                }
                "BIND_ADDRESS" => {
                    if let Ok(addr) = value.parse() {
                        config.bind_address = addr;
                    }
                }
                "DISCONNECT_GRACE" => {
                    if let Ok(grace) = value.parse() {
                        config.disconnect_grace_secs = grace;
                    }
                }
                _ => {}
            }
        }
        config
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 10000);
        assert_eq!(config.max_rooms, 16);
        assert_eq!(config.max_clients, 128);
        assert_eq!(config.bind_address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.disconnect_grace_secs, 15);
    }

    #[test]
    fn parse_overrides_known_keys() {
        let config = ServerConfig::parse(
            "PORT=4242\nMAX_ROOMS=4\nMAX_CLIENTS=10\nBIND_ADDRESS=127.0.0.1\nDISCONNECT_GRACE=30\n",
        );
        assert_eq!(config.port, 4242);
        assert_eq!(config.max_rooms, 4);
        assert_eq!(config.max_clients, 10);
        assert_eq!(config.bind_address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.disconnect_grace_secs, 30);
    }

    #[test]
    fn parse_ignores_unknown_keys_and_garbage() {
        let config = ServerConfig::parse(
            "# comment\nCOLOR=blue\nPORT=not-a-port\nBIND_ADDRESS=example.com\nnonsense line\nPORT=4000\n",
        );
        assert_eq!(config.port, 4000);
        assert_eq!(config.bind_address, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn load_of_a_missing_file_yields_defaults() {
        let config = ServerConfig::load("/definitely/not/a/real/server.config");
        assert_eq!(config, ServerConfig::default());
    }
}
