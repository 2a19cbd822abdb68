//! Node networking configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node networking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Room name; scopes the topic and the rendezvous key
    pub room: String,
    /// TCP listen multiaddr (empty disables TCP listening)
    #[serde(default)]
    pub listen_tcp: String,
    /// QUIC listen multiaddr, e.g. "/ip4/0.0.0.0/udp/4001/quic-v1"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_quic: Option<String>,
    /// Relays to try in order; first successful reservation wins
    #[serde(default)]
    pub relay_addrs: Vec<String>,
    /// Request relay reservations so we are reachable behind NAT
    pub enable_relay_client: bool,
    /// DCUtR hole punching over relayed connections
    pub enable_holepunch: bool,
    /// UPnP / NAT port mapping
    pub enable_upnp: bool,
    /// mDNS discovery on the local segment
    pub enable_mdns: bool,
    /// Explicit bootstrap peers; when empty the peers file is used instead
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Addresses to advertise as externally reachable
    #[serde(default)]
    pub announce_addrs: Vec<String>,
    /// Data directory for the key file and the peers file
    pub data_dir: PathBuf,
    /// Interval between DHT advertise/discover rounds
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    /// Timeout for bootstrap, fallback and DHT dials
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Timeout for dials to mDNS-discovered peers
    #[serde(default = "default_local_dial_timeout")]
    pub local_dial_timeout_secs: u64,
    /// Timeout for a relay reservation handshake
    #[serde(default = "default_reservation_timeout")]
    pub reservation_timeout_secs: u64,
}

fn default_discovery_interval() -> u64 {
    15
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_local_dial_timeout() -> u64 {
    5
}

fn default_reservation_timeout() -> u64 {
    15
}

impl NodeConfig {
    /// GossipSub topic carrying chat payloads for this room
    pub fn topic_name(&self) -> String {
        format!("room:{}", self.room)
    }

    /// Key under which room members advertise themselves in the DHT
    pub fn rendezvous_key(&self) -> String {
        format!("meshchat/{}", self.room)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("peerkey.bin")
    }

    pub fn peers_path(&self) -> PathBuf {
        self.data_dir.join("peers.txt")
    }

    /// Every configured listen address, TCP first
    pub fn listen_addrs(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        if !self.listen_tcp.trim().is_empty() {
            addrs.push(self.listen_tcp.trim().to_string());
        }
        if let Some(quic) = self.listen_quic.as_deref().map(str::trim) {
            if !quic.is_empty() {
                addrs.push(quic.to_string());
            }
        }
        addrs
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn local_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.local_dial_timeout_secs)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }
}

/// Default data directory, shared with the relay section
pub(super) fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "meshchat")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".meshchat"))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            room: "my-room".to_string(),
            listen_tcp: "/ip4/0.0.0.0/tcp/4001".to_string(),
            listen_quic: None,
            relay_addrs: Vec::new(),
            enable_relay_client: true,
            enable_holepunch: true,
            enable_upnp: true,
            enable_mdns: true,
            bootstrap_peers: Vec::new(),
            announce_addrs: Vec::new(),
            data_dir: default_data_dir(),
            discovery_interval_secs: default_discovery_interval(),
            dial_timeout_secs: default_dial_timeout(),
            local_dial_timeout_secs: default_local_dial_timeout(),
            reservation_timeout_secs: default_reservation_timeout(),
        }
    }
}
