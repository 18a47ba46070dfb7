//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default RPC port for cluster connections.
pub const DEFAULT_RPC_PORT: u16 = 8181;

/// Default UDP port for discovery announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8801;

/// Default interface to bind to.
pub const DEFAULT_INTERFACE: &str = "eth0";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub timeouts: TimeoutConfig,
    pub discovery: DiscoveryConfig,
    pub keepalive: KeepaliveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of this node. Empty = host name.
    pub name: String,
    /// Address of a node to join (`host` or `host:port`). Empty = discovery only.
    pub join: String,
    /// Network interface to bind to.
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port for cluster RPC connections.
    pub port: u16,
    /// UDP port for network discovery.
    pub discovery_port: u16,
    /// Local HTTP status port. 0 = disabled.
    pub status_port: u16,
    /// Discovery only surfaces nodes announcing the same tag.
    pub service_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on a single peer dial.
    pub connect_ms: u64,
    /// Bound on resolving the join seed's host name. Dialing the seed uses
    /// `connect_ms` and its peer-list request `request_ms`, like any peer.
    pub join_ms: u64,
    /// Bound on one request/response exchange.
    pub request_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub announce_interval_ms: u64,
    /// First delay before reopening discovery after a transport error.
    pub backoff_initial_ms: u64,
    /// Ceiling for the doubling backoff.
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            join: String::new(),
            interface: DEFAULT_INTERFACE.to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RPC_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            status_port: 8182,
            service_tag: "cairn".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2_000,
            join_ms: 5_000,
            request_ms: 2_000,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval_ms: 2_000,
            backoff_initial_ms: 250,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn join(&self) -> Duration {
        Duration::from_millis(self.join_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The explicit node name, if one was configured.
    pub fn node_name(&self) -> Option<&str> {
        let name = self.node.name.trim();
        (!name.is_empty()).then_some(name)
    }

    /// The join seed, if one was configured.
    pub fn join_seed(&self) -> Option<&str> {
        let join = self.node.join.trim();
        (!join.is_empty()).then_some(join)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_NODE__NAME") {
            self.node.name = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NODE__JOIN") {
            self.node.join = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NODE__INTERFACE") {
            self.node.interface = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__DISCOVERY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.discovery_port = p;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__STATUS_PORT") {
            if let Ok(p) = v.parse() {
                self.network.status_port = p;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETWORK__SERVICE_TAG") {
            self.network.service_tag = v;
        }
    }
}
