//! Configuration for meshchat
//!
//! Settings are layered: built-in defaults, then environment variables, then
//! an optional TOML file. File values win key by key; anything the file does
//! not mention keeps its environment or default value.
//!
//! The file accepts the sectioned keys (`[node] room = ...`) as well as the
//! environment names themselves at top level (`APP_ROOM = "lobby"`). Sectioned
//! keys are applied last.

mod gateway;
mod logging;
mod node;

pub use gateway::{GatewayConfig, RelayConfig};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use node::NodeConfig;

use anyhow::Result;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::util::{parse_flag, split_list};

/// Environment variable names
pub mod env {
    pub const ROOM: &str = "APP_ROOM";
    pub const LISTEN_TCP: &str = "LISTEN_TCP";
    pub const LISTEN_QUIC: &str = "LISTEN_QUIC";
    pub const RELAY_ADDR: &str = "RELAY_ADDR";
    pub const ENABLE_RELAY_CLIENT: &str = "ENABLE_RELAY_CLIENT";
    pub const ENABLE_HOLEPUNCH: &str = "ENABLE_HOLEPUNCH";
    pub const ENABLE_UPNP: &str = "ENABLE_UPNP";
    pub const ENABLE_MDNS: &str = "ENABLE_MDNS";
    pub const BOOTSTRAP_PEERS: &str = "BOOTSTRAP_PEERS";
    pub const ANNOUNCE_ADDRS: &str = "ANNOUNCE_ADDRS";
    pub const DATA_DIR: &str = "DATA_DIR";
    pub const WEB_ADDR: &str = "WEB_ADDR";
    pub const NODE_NICK: &str = "NODE_NICK";
    pub const RELAY_LISTEN: &str = "RELAY_LISTEN";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";

    pub const ALL: &[&str] = &[
        ROOM,
        LISTEN_TCP,
        LISTEN_QUIC,
        RELAY_ADDR,
        ENABLE_RELAY_CLIENT,
        ENABLE_HOLEPUNCH,
        ENABLE_UPNP,
        ENABLE_MDNS,
        BOOTSTRAP_PEERS,
        ANNOUNCE_ADDRS,
        DATA_DIR,
        WEB_ADDR,
        NODE_NICK,
        RELAY_LISTEN,
        LOG_LEVEL,
        LOG_FORMAT,
    ];
}

/// Main configuration for a meshchat node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// P2P node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Web gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Environment, then the TOML file at `path` if it exists.
    ///
    /// Not validated here; callers validate once command-line overrides are in.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_env()?;
        if path.exists() {
            config = config.overlay_file(path)?;
        }
        Ok(config)
    }

    /// Apply environment-style settings through `lookup`.
    ///
    /// Unset or empty variables leave the current value untouched.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(room) = get(env::ROOM) {
            self.node.room = room.trim().to_string();
        }
        if let Some(addr) = get(env::LISTEN_TCP) {
            self.node.listen_tcp = addr.trim().to_string();
        }
        if let Some(addr) = get(env::LISTEN_QUIC) {
            self.node.listen_quic = Some(addr.trim().to_string());
        }
        if let Some(relays) = get(env::RELAY_ADDR) {
            self.node.relay_addrs = split_list(&relays);
        }
        if let Some(flag) = get(env::ENABLE_RELAY_CLIENT).and_then(|v| parse_flag(&v)) {
            self.node.enable_relay_client = flag;
        }
        if let Some(flag) = get(env::ENABLE_HOLEPUNCH).and_then(|v| parse_flag(&v)) {
            self.node.enable_holepunch = flag;
        }
        if let Some(flag) = get(env::ENABLE_UPNP).and_then(|v| parse_flag(&v)) {
            self.node.enable_upnp = flag;
        }
        if let Some(flag) = get(env::ENABLE_MDNS).and_then(|v| parse_flag(&v)) {
            self.node.enable_mdns = flag;
        }
        if let Some(peers) = get(env::BOOTSTRAP_PEERS) {
            self.node.bootstrap_peers = split_list(&peers);
        }
        if let Some(addrs) = get(env::ANNOUNCE_ADDRS) {
            self.node.announce_addrs = split_list(&addrs);
        }
        if let Some(dir) = get(env::DATA_DIR) {
            self.node.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(addr) = get(env::WEB_ADDR) {
            self.gateway.listen_addr = normalize_web_addr(addr.trim());
        }
        if let Some(nick) = get(env::NODE_NICK) {
            self.gateway.nick = Some(nick.trim().to_string());
        }
        if let Some(addr) = get(env::RELAY_LISTEN) {
            self.relay.listen_addr = addr.trim().to_string();
        }
        if let Some(level) = get(env::LOG_LEVEL) {
            self.logging.level = level.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }
        if let Some(format) = get(env::LOG_FORMAT) {
            self.logging.format = format.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }
        Ok(())
    }

    /// Overlay the TOML file at `path` on top of `self`
    pub fn overlay_file(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        self.overlay_toml(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))
    }

    /// Overlay TOML text on top of `self`, table by table.
    ///
    /// Top-level keys named like environment variables go through
    /// [`Config::apply_env`]; any other unknown key is an error.
    pub fn overlay_toml(mut self, content: &str) -> Result<Self> {
        let mut overlay: toml::Table = toml::from_str(content)?;

        let mut flat = std::collections::HashMap::new();
        for name in env::ALL {
            if let Some(value) = overlay.remove(*name) {
                flat.insert(*name, env_value(name, value)?);
            }
        }
        if !flat.is_empty() {
            self.apply_env(|key| flat.get(key).cloned())?;
        }

        let mut base = toml::Value::try_from(&self)?;
        merge_toml(&mut base, toml::Value::Table(overlay));
        Ok(base.try_into::<Config>()?)
    }

    /// Validate all configuration fields.
    ///
    /// Collects every problem and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Node validation
        if self.node.room.trim().is_empty() {
            errors.push("room must not be empty".to_string());
        }
        let listen = self.node.listen_addrs();
        if listen.is_empty() {
            errors.push("at least one of listen_tcp / listen_quic must be set".to_string());
        }
        for addr in &listen {
            if addr.parse::<Multiaddr>().is_err() {
                errors.push(format!("invalid listen address '{}'", addr));
            }
        }
        for addr in &self.node.announce_addrs {
            if addr.parse::<Multiaddr>().is_err() {
                errors.push(format!("invalid announce address '{}'", addr));
            }
        }
        if self.node.discovery_interval_secs == 0 {
            errors.push("discovery_interval_secs must be positive".to_string());
        }
        if self.node.dial_timeout_secs == 0
            || self.node.local_dial_timeout_secs == 0
            || self.node.reservation_timeout_secs == 0
        {
            errors.push("dial and reservation timeouts must be positive".to_string());
        }
        if self.node.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }

        // Gateway validation
        if self.gateway.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "invalid web listen address '{}' (expected host:port)",
                self.gateway.listen_addr
            ));
        }
        if self.gateway.queue_capacity == 0 {
            errors.push("queue_capacity must be positive".to_string());
        }
        if let Some(nick) = &self.gateway.nick {
            if nick.trim().is_empty() {
                errors.push("nick must not be blank when set".to_string());
            }
        }

        // Relay validation
        if self.relay.listen_addr.parse::<Multiaddr>().is_err() {
            errors.push(format!("invalid relay listen address '{}'", self.relay.listen_addr));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }

    /// Default configuration rendered as TOML, for `meshchat init`
    pub fn default_toml() -> Result<String> {
        let body = toml::to_string_pretty(&Self::default())?;
        Ok(format!(
            "# meshchat configuration\n\
             # Values here override the matching environment variables.\n\n{}",
            body
        ))
    }

    /// Relay server key path
    pub fn relay_key_path(&self) -> PathBuf {
        self.node.data_dir.join("relaykey.bin")
    }
}

/// `":8080"` style addresses bind all interfaces
fn normalize_web_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Render a top-level file value the way the environment would spell it
fn env_value(name: &str, value: toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s),
                other => anyhow::bail!("{} entries must be strings, got {}", name, other.type_str()),
            })
            .collect::<Result<Vec<_>>>()
            .map(|items| items.join(",")),
        other => anyhow::bail!("{} must be a string, got {}", name, other.type_str()),
    }
}

fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ========================================================================
    // Defaults
    // ========================================================================

    #[test]
    fn default_config_passes_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn default_names_are_room_scoped() {
        let cfg = Config::default();
        assert_eq!(cfg.node.topic_name(), "room:my-room");
        assert_eq!(cfg.node.rendezvous_key(), "meshchat/my-room");
        assert_eq!(cfg.node.discovery_interval_secs, 15);
        assert_eq!(cfg.node.local_dial_timeout_secs, 5);
        assert_eq!(cfg.gateway.queue_capacity, 32);
    }

    // ========================================================================
    // Environment layer
    // ========================================================================

    #[test]
    fn env_overrides_defaults() {
        let mut cfg = Config::default();
        cfg.apply_env(lookup(&[
            ("APP_ROOM", "lobby"),
            ("LISTEN_QUIC", "/ip4/0.0.0.0/udp/4001/quic-v1"),
            ("RELAY_ADDR", "/dns4/r1/tcp/4003, /dns4/r2/tcp/4003"),
            ("ENABLE_UPNP", "no"),
            ("ENABLE_HOLEPUNCH", "YES"),
            ("BOOTSTRAP_PEERS", "/ip4/1.2.3.4/tcp/4001"),
            ("WEB_ADDR", ":9090"),
            ("NODE_NICK", "carol"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(cfg.node.room, "lobby");
        assert_eq!(cfg.node.relay_addrs, vec!["/dns4/r1/tcp/4003", "/dns4/r2/tcp/4003"]);
        assert!(!cfg.node.enable_upnp);
        assert!(cfg.node.enable_holepunch);
        assert_eq!(cfg.node.bootstrap_peers.len(), 1);
        assert_eq!(cfg.node.listen_addrs().len(), 2);
        assert_eq!(cfg.gateway.listen_addr, "0.0.0.0:9090");
        assert_eq!(cfg.gateway.nick.as_deref(), Some("carol"));
        assert_eq!(cfg.logging.level, LogLevel::Debug);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_env_values_keep_defaults() {
        let mut cfg = Config::default();
        cfg.apply_env(lookup(&[("APP_ROOM", "  "), ("ENABLE_MDNS", "")]))
            .unwrap();
        assert_eq!(cfg.node.room, "my-room");
        assert!(cfg.node.enable_mdns);
    }

    #[test]
    fn env_rejects_unknown_log_level() {
        let mut cfg = Config::default();
        let err = cfg.apply_env(lookup(&[("LOG_LEVEL", "loud")])).unwrap_err();
        assert!(err.to_string().contains("unknown log level"));
    }

    // ========================================================================
    // File layer
    // ========================================================================

    #[test]
    fn file_overrides_env_key_by_key() {
        let mut cfg = Config::default();
        cfg.apply_env(lookup(&[("APP_ROOM", "from-env"), ("NODE_NICK", "env-nick")]))
            .unwrap();

        let cfg = cfg
            .overlay_toml(
                r#"
                [node]
                room = "from-file"

                [gateway]
                queue_capacity = 8
                "#,
            )
            .unwrap();

        assert_eq!(cfg.node.room, "from-file");
        assert_eq!(cfg.gateway.queue_capacity, 8);
        // untouched by the file
        assert_eq!(cfg.gateway.nick.as_deref(), Some("env-nick"));
        assert_eq!(cfg.node.listen_tcp, "/ip4/0.0.0.0/tcp/4001");
    }

    #[test]
    fn file_accepts_environment_names() {
        let mut cfg = Config::default();
        cfg.apply_env(lookup(&[("APP_ROOM", "from-env"), ("WEB_ADDR", "127.0.0.1:9000")]))
            .unwrap();

        let cfg = cfg
            .overlay_toml(
                r#"
                APP_ROOM = "lobby"
                NODE_NICK = "carol"
                ENABLE_MDNS = false
                BOOTSTRAP_PEERS = ["/ip4/1.2.3.4/tcp/4001", "/ip4/5.6.7.8/tcp/4001"]
                "#,
            )
            .unwrap();

        assert_eq!(cfg.node.room, "lobby");
        assert_eq!(cfg.gateway.nick.as_deref(), Some("carol"));
        assert!(!cfg.node.enable_mdns);
        assert_eq!(cfg.node.bootstrap_peers.len(), 2);
        // untouched by the file
        assert_eq!(cfg.gateway.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn sectioned_keys_win_over_environment_names_in_one_file() {
        let cfg = Config::default()
            .overlay_toml(
                r#"
                APP_ROOM = "flat"

                [node]
                room = "sectioned"
                "#,
            )
            .unwrap();
        assert_eq!(cfg.node.room, "sectioned");
    }

    #[test]
    fn file_rejects_unknown_top_level_keys() {
        let err = Config::default()
            .overlay_toml("APP_ROOOM = \"typo\"")
            .unwrap_err();
        assert!(err.to_string().contains("APP_ROOOM"));

        let err = Config::default()
            .overlay_toml("NODE_NICK = { first = \"x\" }")
            .unwrap_err();
        assert!(err.to_string().contains("NODE_NICK"));
    }

    #[test]
    fn load_leaves_validation_to_the_caller() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meshchat.toml");
        std::fs::write(&path, "[gateway]\nlisten_addr = \"nonsense\"\n").unwrap();

        let mut cfg = Config::load(&path).unwrap();
        assert!(cfg.validate().is_err());
        cfg.gateway.listen_addr = "127.0.0.1:8080".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overlay_file_reports_path_on_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "[node\nroom = ").unwrap();
        let err = Config::default().overlay_file(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn default_toml_round_trips() {
        let text = Config::default_toml().unwrap();
        let cfg = Config::default().overlay_toml(&text).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.node.room, "my-room");
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn validate_collects_all_errors() {
        let mut cfg = Config::default();
        cfg.node.room = String::new();
        cfg.gateway.queue_capacity = 0;
        cfg.gateway.listen_addr = "nonsense".to_string();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("room must not be empty"));
        assert!(err.contains("queue_capacity must be positive"));
        assert!(err.contains("invalid web listen address"));
    }

    #[test]
    fn validate_requires_a_listen_address() {
        let mut cfg = Config::default();
        cfg.node.listen_tcp = String::new();
        cfg.node.listen_quic = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("listen_tcp / listen_quic"));
    }

    #[test]
    fn validate_rejects_bad_multiaddrs() {
        let mut cfg = Config::default();
        cfg.node.listen_tcp = "tcp://0.0.0.0:4001".to_string();
        cfg.node.announce_addrs = vec!["nope".to_string()];
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("invalid listen address"));
        assert!(err.contains("invalid announce address"));
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut cfg = Config::default();
        cfg.node.discovery_interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.node.local_dial_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
