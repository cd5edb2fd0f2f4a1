//! Configuration handling for the agent binary.
//!
//! Settings come from three layers: built-in defaults, an optional YAML
//! file, and `DTN_*` environment variables. Later layers win. Command
//! line flags override everything and are applied in `main`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Endpoint identifier of this node, e.g. `dtn://alpha`
    pub eid: String,
    /// Transport name; also the scheme of CLA addresses, e.g. `mtcp`
    pub cla_name: String,
    /// TCP listen address for inbound contacts
    pub listen: Option<String>,
    /// Peer addresses to dial at startup
    pub peers: Vec<String>,
    /// Link MTU in bytes
    pub mtu: usize,
    /// Largest serialized bundle accepted for transmission
    pub max_bundle_size: usize,
    /// Bound on bundles held in storage
    pub storage_capacity: usize,
    /// Replication fan-out: `unlimited`, `direct`, or a count
    pub replication_limit: String,
    /// Hop budget before direct delivery only
    pub hop_limit: String,
    /// Neighbor discovery settings
    pub discovery: DiscoverySection,
}

/// Neighbor discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Whether to announce and scan for beacons
    pub enabled: bool,
    /// UDP port to listen for beacons on
    pub port: u16,
    /// Destination for our own beacons
    pub broadcast_addr: String,
    /// Connect address announced in beacons; defaults to the bound
    /// listen address
    pub announce_addr: Option<String>,
    /// Seconds between announcements
    pub interval_s: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 3005,
            broadcast_addr: "255.255.255.255:3005".to_string(),
            announce_addr: None,
            interval_s: 10,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            eid: "dtn://node1".to_string(),
            cla_name: "mtcp".to_string(),
            listen: None,
            peers: Vec::new(),
            mtu: 1400,
            max_bundle_size: 1 << 20,
            storage_capacity: 1024,
            replication_limit: "unlimited".to_string(),
            hop_limit: "unlimited".to_string(),
            discovery: DiscoverySection::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<AgentConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}: {}; using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `DTN_*` environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(eid) = std::env::var("DTN_EID") {
            info!("EID overridden by environment: {}", eid);
            self.eid = eid;
        }

        if let Ok(listen) = std::env::var("DTN_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.listen = Some(listen);
        }

        if let Ok(peers) = std::env::var("DTN_PEERS") {
            self.peers = peers
                .split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            info!("Peer list overridden by environment: {:?}", self.peers);
        }

        if let Ok(mtu) = std::env::var("DTN_MTU") {
            if let Ok(mtu) = mtu.parse::<usize>() {
                info!("MTU overridden by environment: {}", mtu);
                self.mtu = mtu;
            }
        }

        if let Ok(capacity) = std::env::var("DTN_STORAGE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<usize>() {
                info!("Storage capacity overridden by environment: {}", capacity);
                self.storage_capacity = capacity;
            }
        }

        if let Ok(limit) = std::env::var("DTN_REPLICATION_LIMIT") {
            info!("Replication limit overridden by environment: {}", limit);
            self.replication_limit = limit;
        }

        if let Ok(limit) = std::env::var("DTN_HOP_LIMIT") {
            info!("Hop limit overridden by environment: {}", limit);
            self.hop_limit = limit;
        }

        if let Ok(port) = std::env::var("DTN_DISCOVERY_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                info!("Discovery port overridden by environment: {}", port);
                self.discovery.port = port;
            }
        }
    }
}
