//! Configuration module for blockfs.

use crate::cluster::placement::PlacementStrategy;
use crate::error::{BlockFsError, Result};
use crate::raft::RaftConfig;
use crate::types::{NodeId, DEFAULT_BLOCK_SIZE, DEFAULT_REPLICA_FACTOR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a blockfs process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockFsConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Metadata service configuration.
    pub metadata: MetadataConfig,
    /// Chunk server configuration.
    pub chunk: ChunkConfig,
    /// Client library configuration.
    pub client: ClientConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl BlockFsConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BlockFsError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BlockFsError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        match self.node.role {
            NodeRole::Metadata => {
                if self.node.id == 0 {
                    return Err(invalid("node.id", "Metadata replica IDs must be non-zero"));
                }
                let peers = self.metadata.peer_map()?;
                if !peers.is_empty() && !peers.contains_key(&self.node.id) {
                    return Err(invalid(
                        "metadata.raft_peers",
                        "Peer list must include this node",
                    ));
                }
                self.metadata.validate()?;
            }
            NodeRole::Chunk => {
                if self.chunk.metadata_addrs.is_empty() {
                    return Err(invalid(
                        "chunk.metadata_addrs",
                        "Chunk servers need at least one metadata address",
                    ));
                }
            }
        }

        if self.client.connect_rounds == 0 {
            return Err(invalid("client.connect_rounds", "Must be at least 1"));
        }

        Ok(())
    }

    /// Single metadata replica on localhost, for development.
    pub fn development() -> Self {
        let metadata_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        Self {
            node: NodeConfig {
                id: 1,
                role: NodeRole::Metadata,
                data_dir: PathBuf::from("/tmp/blockfs"),
            },
            metadata: MetadataConfig {
                bind_addr: metadata_addr,
                raft_peers: vec![format!("1={}", metadata_addr)],
                ..Default::default()
            },
            chunk: ChunkConfig {
                bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9100)),
                metadata_addrs: vec![metadata_addr.to_string()],
                ..Default::default()
            },
            client: ClientConfig {
                metadata_addrs: vec![metadata_addr.to_string()],
                ..Default::default()
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

fn invalid(field: &str, reason: &str) -> BlockFsError {
    BlockFsError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Metadata replica ID; unused by chunk servers.
    pub id: NodeId,
    pub role: NodeRole,
    /// Raft storage for metadata replicas, block files for chunk servers.
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            role: NodeRole::Metadata,
            data_dir: PathBuf::from("/var/lib/blockfs"),
        }
    }
}

/// Node role enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Metadata replica (runs Raft).
    Metadata,
    /// Chunk server (stores blocks).
    Chunk,
}

impl NodeRole {
    pub fn is_metadata(&self) -> bool {
        matches!(self, NodeRole::Metadata)
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, NodeRole::Chunk)
    }
}

/// Metadata service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Address serving both the metadata API and the Raft endpoints.
    pub bind_addr: SocketAddr,
    /// Every replica as `id=host:port`, this one included.
    pub raft_peers: Vec<String>,
    pub block_size: u64,
    pub replica_factor: usize,
    /// Largest number of blocks a single file may span.
    pub max_file_blocks: usize,
    pub placement: PlacementStrategy,
    /// Chunk server heartbeat period.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// How often followers refresh their stale read copy.
    #[serde(with = "humantime_serde")]
    pub sync_read_interval: Duration,
    /// Bound on each proposal's commit.
    #[serde(with = "humantime_serde")]
    pub propose_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    #[serde(with = "humantime_serde")]
    pub raft_heartbeat_interval: Duration,
    /// Applied entries between Raft snapshots.
    pub snapshot_threshold: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000)),
            raft_peers: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            replica_factor: DEFAULT_REPLICA_FACTOR,
            max_file_blocks: 1 << 20,
            placement: PlacementStrategy::Random,
            heartbeat_interval: Duration::from_secs(5),
            sync_read_interval: Duration::from_secs(2),
            propose_timeout: Duration::from_secs(3),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            raft_heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 64,
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(invalid("metadata.block_size", "Block size must be non-zero"));
        }
        if self.replica_factor == 0 {
            return Err(invalid(
                "metadata.replica_factor",
                "Replica factor must be non-zero",
            ));
        }
        if self.max_file_blocks == 0 {
            return Err(invalid(
                "metadata.max_file_blocks",
                "Block limit must be non-zero",
            ));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(invalid(
                "metadata.election_timeout_min",
                "Must be below election_timeout_max",
            ));
        }
        if self.raft_heartbeat_interval >= self.election_timeout_min {
            return Err(invalid(
                "metadata.raft_heartbeat_interval",
                "Must be below election_timeout_min",
            ));
        }
        Ok(())
    }

    /// Parse `raft_peers` into an ID → address map.
    pub fn peer_map(&self) -> Result<HashMap<NodeId, String>> {
        self.raft_peers
            .iter()
            .map(|peer| -> Result<(NodeId, String)> {
                let (id, addr) = peer
                    .split_once('=')
                    .ok_or_else(|| invalid("metadata.raft_peers", "Expected id=host:port"))?;
                let id = id
                    .trim()
                    .parse::<NodeId>()
                    .map_err(|_| invalid("metadata.raft_peers", "Peer ID must be a number"))?;
                Ok((id, addr.trim().to_string()))
            })
            .collect()
    }

    /// Raft settings for replica `node_id`, with itself removed from the peer set.
    pub fn raft_config(&self, node_id: NodeId) -> Result<RaftConfig> {
        let mut peers = self.peer_map()?;
        peers.remove(&node_id);
        Ok(RaftConfig {
            node_id,
            peers,
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: self.raft_heartbeat_interval,
            snapshot_threshold: self.snapshot_threshold,
            ..Default::default()
        })
    }
}

/// Chunk server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub bind_addr: SocketAddr,
    /// Address registered with the metadata service; the bound address if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,
    pub metadata_addrs: Vec<String>,
    /// Read cache budget in bytes.
    pub cache_size: usize,
    /// Registration attempts before giving up, one per second.
    pub register_retries: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9100)),
            advertise_addr: None,
            metadata_addrs: Vec::new(),
            cache_size: 64 * 1024 * 1024,
            register_retries: 60,
        }
    }
}

/// Client library configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub metadata_addrs: Vec<String>,
    /// Probing rounds over `metadata_addrs` when resolving a replica.
    pub connect_rounds: u32,
    /// Pause after a failed probe.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            metadata_addrs: Vec::new(),
            connect_rounds: 8,
            retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis % 1000 == 0 && millis > 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", millis))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.trim()
                .parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
