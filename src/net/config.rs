//! Networking configuration
//!
//! Every runtime knob of the connection manager lives in [`NetConfig`]. The
//! defaults match a public mainnet node; a JSON file can override any subset
//! of fields and the command line overrides the file.

use crate::net::error::{NetError, NetResult};
use crate::net::netaddr::SubNet;
use crate::protocol::header::{Magic, PayloadLimits};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum number of connections
pub const DEFAULT_MAX_PEER_CONNECTIONS: usize = 125;

/// Default number of full outbound connections
pub const MAX_OUTBOUND_CONNECTIONS: usize = 8;

/// Maximum number of concurrent feeler connections
pub const MAX_FEELER_CONNECTIONS: usize = 1;

/// Maximum number of manually added connections
pub const MAX_ADDNODE_CONNECTIONS: usize = 8;

/// Default cap on one peer's send queue, in bytes
pub const DEFAULT_MAX_SEND_BUFFER: u64 = 1000 * 1000;

/// Default cap on one peer's unprocessed receive queue, in bytes
pub const DEFAULT_MAX_RECEIVE_FLOOD: u64 = 5 * 1000 * 1000;

/// Default largest non-block payload accepted
pub const DEFAULT_MAX_PROTOCOL_RECV_PAYLOAD_LENGTH: u64 = 2 * 1024 * 1024;

/// Default maximum block size
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 128 * 1000 * 1000;

/// Default outbound cycle length: 24 hours
pub const DEFAULT_MAX_UPLOAD_TIMEFRAME: u64 = 60 * 60 * 24;

/// Default per-peer async task soft limit
pub const DEFAULT_ASYNC_SOFT_LIMIT: usize = 3;

/// Default ban duration: 24 hours
pub const DEFAULT_MISBEHAVING_BANTIME: i64 = 60 * 60 * 24;

/// Ban score at which a misbehaving peer is banned
pub const DEFAULT_BANSCORE_THRESHOLD: u32 = 100;

/// Network selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn magic(&self) -> Magic {
        match self {
            Network::Main => [0xe3, 0xe1, 0xf3, 0xe8],
            Network::Test => [0xf4, 0xe5, 0xf3, 0xf4],
            Network::Regtest => [0xda, 0xb5, 0xbf, 0xfa],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Main => 8333,
            Network::Test => 18333,
            Network::Regtest => 18444,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => Err(NetError::Config(format!("unknown network {}", other))),
        }
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub network: Network,
    /// Addresses to bind listen sockets on; empty means all interfaces on
    /// the default port
    pub bind: Vec<SocketAddr>,
    /// Accept inbound connections
    pub listen: bool,
    /// Open outbound connections at all
    pub network_active: bool,
    pub max_connections: usize,
    pub max_outbound: usize,
    pub max_feeler: usize,
    pub max_added: usize,
    /// Per-peer send queue cap in bytes; exceeding it pauses sending
    pub send_buffer_size: u64,
    /// Per-peer unprocessed receive queue cap; exceeding it pauses reading
    pub receive_flood_size: u64,
    pub max_recv_payload_length: u64,
    pub max_block_size: u64,
    /// Block responses pause once aggregate queued send bytes exceed this
    /// multiple of the maximum block size
    pub block_response_pause_multiple: u64,
    /// Outbound byte cap per cycle; 0 disables the limiter
    pub max_outbound_target: u64,
    pub max_outbound_timeframe_secs: u64,
    pub async_task_threads: usize,
    pub async_task_soft_limit: usize,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub ban_time_secs: i64,
    pub ban_score_threshold: u32,
    /// Subnets exempt from bans and eviction
    pub whitelist: Vec<SubNet>,
    /// Manually configured peers, retried forever
    pub added_nodes: Vec<String>,
    /// Only connect to these peers; disables automatic outbound dialing
    pub connect_only: Vec<String>,
    pub dns_seed: bool,
    pub dns_seeds: Vec<String>,
    pub data_dir: PathBuf,
    /// Global cap on outstanding ask-for requests across all peers
    pub ask_for_global_cap: usize,
    pub user_agent: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network: Network::Main,
            bind: Vec::new(),
            listen: true,
            network_active: true,
            max_connections: DEFAULT_MAX_PEER_CONNECTIONS,
            max_outbound: MAX_OUTBOUND_CONNECTIONS,
            max_feeler: MAX_FEELER_CONNECTIONS,
            max_added: MAX_ADDNODE_CONNECTIONS,
            send_buffer_size: DEFAULT_MAX_SEND_BUFFER,
            receive_flood_size: DEFAULT_MAX_RECEIVE_FLOOD,
            max_recv_payload_length: DEFAULT_MAX_PROTOCOL_RECV_PAYLOAD_LENGTH,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            block_response_pause_multiple: 2,
            max_outbound_target: 0,
            max_outbound_timeframe_secs: DEFAULT_MAX_UPLOAD_TIMEFRAME,
            async_task_threads: 2,
            async_task_soft_limit: DEFAULT_ASYNC_SOFT_LIMIT,
            handshake_timeout_secs: 60,
            idle_timeout_secs: 20 * 60,
            ping_interval_secs: 2 * 60,
            ping_timeout_secs: 20 * 60,
            ban_time_secs: DEFAULT_MISBEHAVING_BANTIME,
            ban_score_threshold: DEFAULT_BANSCORE_THRESHOLD,
            whitelist: Vec::new(),
            added_nodes: Vec::new(),
            connect_only: Vec::new(),
            dns_seed: true,
            dns_seeds: Vec::new(),
            data_dir: PathBuf::from(".p2p_data"),
            ask_for_global_cap: 50_000,
            user_agent: format!("/mini-p2p:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl NetConfig {
    /// Configuration for a given network with its default bind port
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> NetResult<Self> {
        let data = fs::read_to_string(path)?;
        let config: NetConfig = serde_json::from_str(&data)
            .map_err(|e| NetError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> NetResult<()> {
        if self.max_outbound + self.max_feeler > self.max_connections {
            return Err(NetError::Config(format!(
                "max_outbound ({}) + max_feeler ({}) exceeds max_connections ({})",
                self.max_outbound, self.max_feeler, self.max_connections
            )));
        }
        if self.async_task_threads == 0 {
            return Err(NetError::Config("async_task_threads must be > 0".into()));
        }
        if self.async_task_soft_limit == 0 {
            return Err(NetError::Config("async_task_soft_limit must be > 0".into()));
        }
        if self.max_recv_payload_length == 0 || self.max_block_size == 0 {
            return Err(NetError::Config("payload limits must be > 0".into()));
        }
        if self.max_recv_payload_length > u32::MAX as u64 {
            return Err(NetError::Config(
                "max_recv_payload_length must fit the protoconf field".into(),
            ));
        }
        Ok(())
    }

    pub fn magic(&self) -> Magic {
        self.network.magic()
    }

    pub fn default_port(&self) -> u16 {
        self.network.default_port()
    }

    /// Inbound slots left once outbound and feeler slots are reserved
    pub fn max_inbound(&self) -> usize {
        self.max_connections
            .saturating_sub(self.max_outbound + self.max_feeler)
    }

    pub fn payload_limits(&self) -> PayloadLimits {
        PayloadLimits {
            max_payload: self.max_recv_payload_length,
            max_block: self.max_block_size,
        }
    }

    /// Aggregate send-queue size above which block responses pause
    pub fn block_response_pause_threshold(&self) -> u64 {
        self.max_block_size
            .saturating_mul(self.block_response_pause_multiple)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn max_outbound_timeframe(&self) -> Duration {
        Duration::from_secs(self.max_outbound_timeframe_secs)
    }

    pub fn banlist_path(&self) -> PathBuf {
        self.data_dir.join("banlist.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = NetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_inbound(), 125 - 8 - 1);
        assert_eq!(config.default_port(), 8333);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NetConfig =
            serde_json::from_str(r#"{"network":"regtest","max_connections":20}"#).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.max_outbound, MAX_OUTBOUND_CONNECTIONS);
        assert_eq!(config.magic(), [0xda, 0xb5, 0xbf, 0xfa]);
    }

    #[test]
    fn test_inconsistent_limits_rejected() {
        let config = NetConfig {
            max_connections: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NetError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        fs::write(&path, r#"{"whitelist":["10.0.0.0/8"],"async_task_soft_limit":5}"#).unwrap();
        let config = NetConfig::load(&path).unwrap();
        assert_eq!(config.async_task_soft_limit, 5);
        assert!(config.whitelist[0].contains(&"10.1.2.3".parse().unwrap()));
    }
}
