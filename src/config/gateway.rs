//! Web gateway and relay server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Local WebSocket gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the web bridge (e.g., "0.0.0.0:8080")
    pub listen_addr: String,
    /// Display name for lines published by local clients (defaults to a slice of the peer id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    /// Page served at `/`
    #[serde(default = "default_static_page")]
    pub static_page: PathBuf,
    /// Outbound frames buffered per client before newer ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Also deliver locally published lines to local clients
    #[serde(default)]
    pub local_echo: bool,
}

fn default_static_page() -> PathBuf {
    PathBuf::from("web/index.html")
}

fn default_queue_capacity() -> usize {
    32
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            nick: None,
            static_page: default_static_page(),
            queue_capacity: default_queue_capacity(),
            local_echo: false,
        }
    }
}

/// Circuit relay server configuration (`meshchat relay`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen multiaddr for the relay node
    pub listen_addr: String,
    /// Maximum concurrent reservations held by the relay
    #[serde(default = "default_max_reservations")]
    pub max_reservations: usize,
    /// Maximum concurrent relayed circuits
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,
}

fn default_max_reservations() -> usize {
    128
}

fn default_max_circuits() -> usize {
    16
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/4003".to_string(),
            max_reservations: default_max_reservations(),
            max_circuits: default_max_circuits(),
        }
    }
}
