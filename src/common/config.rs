//! Configuration for a zooweeper node
//!
//! Values are layered: serde defaults, then an optional TOML file, then
//! `ZOOWEEPER_*` environment variables (plus the historical `PORT` and
//! `BASE_URL`), then CLI flags applied by the binary.

use crate::common::utils::is_port;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "zooweeper.toml";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's own address (a port such as `8080`, or `host:port`)
    pub node_address: String,

    /// Listen address; derived from `node_address` when absent
    pub bind_addr: Option<SocketAddr>,

    /// Every ensemble member, this node included
    pub peers: Vec<String>,

    /// Scheme and host used to build peer URLs for port addresses
    pub base_url: String,

    /// RocksDB directory; derived from `node_address` when absent
    pub db_path: Option<PathBuf>,

    /// Interval between two health-check rounds
    pub health_interval_ms: u64,

    /// Per-call timeout on every peer request
    pub request_timeout_ms: u64,

    /// Bound on the wait for a majority of acknowledgements
    pub proposal_timeout_ms: u64,

    /// Bound on the wait for a majority of sync acknowledgements
    pub sync_timeout_ms: u64,

    /// How long a defeated candidate waits for a declare-leader message
    pub election_timeout_ms: u64,

    /// Election rounds before giving up until the next health trigger
    pub max_election_rounds: u32,

    /// Path on downstream clients that receives committed payloads
    pub notify_path: String,

    /// Logging level
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_address: "8080".to_string(),
            bind_addr: None,
            peers: vec!["8080".to_string(), "8081".to_string(), "8082".to_string()],
            base_url: "http://localhost".to_string(),
            db_path: None,
            health_interval_ms: 5_000,
            request_timeout_ms: 2_000,
            proposal_timeout_ms: 30_000,
            sync_timeout_ms: 10_000,
            election_timeout_ms: 10_000,
            max_election_rounds: 3,
            notify_path: "/updateScore".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from `zooweeper.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from the given TOML file (optional) and the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("ZOOWEEPER")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("peers"),
            )
            .build()?;
        let mut cfg: NodeConfig = settings.try_deserialize()?;

        if let Ok(port) = std::env::var("PORT") {
            if !port.is_empty() {
                cfg.node_address = port;
            }
        }
        if let Ok(base_url) = std::env::var("BASE_URL") {
            if !base_url.is_empty() {
                cfg.base_url = base_url;
            }
        }

        Ok(cfg)
    }

    /// Check the invariants the node relies on at startup
    pub fn validate(&self) -> Result<()> {
        if self.node_address.is_empty() {
            return Err(Error::InvalidConfig("node_address is empty".into()));
        }
        if self.peers.is_empty() {
            return Err(Error::InvalidConfig("peer list is empty".into()));
        }
        if !self.peers.iter().any(|p| p == &self.node_address) {
            return Err(Error::InvalidConfig(format!(
                "node {} is not part of the ensemble {:?}",
                self.node_address, self.peers
            )));
        }
        if self.request_timeout_ms == 0
            || self.health_interval_ms == 0
            || self.proposal_timeout_ms == 0
            || self.sync_timeout_ms == 0
            || self.election_timeout_ms == 0
        {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Listen address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.bind_addr {
            return Ok(addr);
        }
        if is_port(&self.node_address) {
            return format!("0.0.0.0:{}", self.node_address)
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("bad port: {}", e)));
        }
        self.node_address
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bad node address: {}", e)))
    }

    /// RocksDB directory
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            PathBuf::from(format!(
                "./ztree/zooweeper-metadata-{}",
                self.node_address.replace(':', "_")
            ))
        })
    }

    /// URL of `path` on the node (or client) at `address`
    pub fn peer_url(&self, address: &str, path: &str) -> String {
        if is_port(address) {
            format!("{}:{}{}", self.base_url.trim_end_matches('/'), address, path)
        } else {
            format!("http://{}{}", address, path)
        }
    }

    /// Peers other than this node
    pub fn others(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| *p != &self.node_address)
            .cloned()
            .collect()
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// How long a follower waits on a write it forwarded.
    ///
    /// The leader holds a write for at most `proposal_timeout` before the
    /// commit fan-out, which sends at most two rounds of peer calls.
    pub fn forward_timeout(&self) -> Duration {
        self.proposal_timeout() + self.request_timeout() * 3
    }
}
