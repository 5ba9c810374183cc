//! Node and partition configuration.
//!
//! The node config is a JSON file loaded at bootstrap; each partition
//! additionally persists a small JSON `meta` file in its directory
//! recording the identity it was created with, reloaded on start.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::RotateConfig;
use crate::types::{MetaError, NodeId, PartitionId};

/// Which storage backend a partition runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-memory ordered trees; rebuilt from raft state on restart.
    Memory,
    /// Persistent LSM store (requires the `lsm` feature).
    Lsm,
}

/// Reclaimer tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Sleep between cycles, milliseconds. Floored to keep load bounded.
    pub interval_ms: u64,
    /// Inodes drained from the free list per cycle.
    pub batch_count: usize,
    /// Per-cycle cap on extents taken from one inode's tail; the rest
    /// waits for the next cycle.
    pub max_extents_per_inode: usize,
    /// Token-bucket rate for extent-delete RPCs, per second.
    pub rpc_rate_per_sec: u64,
    /// Token-bucket burst capacity.
    pub rpc_burst: u64,
}

impl ReclaimConfig {
    /// Lower bound on the cycle interval.
    pub const MIN_INTERVAL_MS: u64 = 100;

    /// The configured interval with the floor applied.
    pub fn effective_interval_ms(&self) -> u64 {
        self.interval_ms.max(Self::MIN_INTERVAL_MS)
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            batch_count: 128,
            max_extents_per_inode: 1_024,
            rpc_rate_per_sec: 512,
            rpc_burst: 1_024,
        }
    }
}

/// Top-level metadata node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory holding `partition_<id>` subdirectories.
    pub meta_root: PathBuf,
    /// Address this node serves and proposes from.
    pub listen_addr: String,
    /// This node's cluster identity.
    pub node_id: u64,
    /// Storage backend for new partitions.
    pub backend: BackendKind,
    /// Partitions started concurrently at boot.
    pub start_parallelism: usize,
    /// Keep unlinked inodes in the trash tier until cleaned.
    pub trash_enabled: bool,
    /// Minimum range headroom for a cursor reset.
    pub cursor_min_headroom: u64,
    /// Dedup ledger capacity per partition.
    pub dedup_capacity: usize,
    /// Minimum dedup retention, milliseconds.
    pub dedup_retain_ms: u64,
    /// Free-list capacity per partition.
    pub freelist_capacity: usize,
    /// Reclaimer tuning.
    pub reclaim: ReclaimConfig,
    /// Audit file rotation policy.
    pub audit: RotateConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            meta_root: PathBuf::from("/var/lib/shoalfs/meta"),
            listen_addr: "0.0.0.0:9021".to_string(),
            node_id: 1,
            backend: BackendKind::Memory,
            start_parallelism: 8,
            trash_enabled: true,
            cursor_min_headroom: 1_000,
            dedup_capacity: 100_000,
            dedup_retain_ms: 5 * 60 * 1_000,
            freelist_capacity: 100_000,
            reclaim: ReclaimConfig::default(),
            audit: RotateConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, MetaError> {
        let buf = std::fs::read(path)?;
        serde_json::from_slice(&buf).map_err(|e| MetaError::Codec(e.to_string()))
    }
}

/// A raft peer of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer node identity.
    pub node_id: NodeId,
    /// Peer address.
    pub addr: String,
    /// True for recorder (learner) replicas that log but do not serve.
    #[serde(default)]
    pub recorder: bool,
}

/// The identity a partition was created with, persisted as its `meta`
/// file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    /// Partition identity.
    pub partition_id: PartitionId,
    /// Owning volume.
    pub volume: String,
    /// First inode ID of the partition's range.
    pub start: u64,
    /// Last inode ID of the partition's range (inclusive).
    pub end: u64,
    /// Raft group membership.
    pub peers: Vec<PeerInfo>,
}

impl PartitionMeta {
    /// File name of the persisted record inside the partition directory.
    pub const FILE_NAME: &'static str = "meta";

    /// Writes the record into `dir` (atomically via a temp file rename).
    pub fn save(&self, dir: &Path) -> Result<(), MetaError> {
        let buf = serde_json::to_vec_pretty(self).map_err(|e| MetaError::Codec(e.to_string()))?;
        let tmp = dir.join(".meta.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, dir.join(Self::FILE_NAME))?;
        Ok(())
    }

    /// Loads the record from `dir`.
    pub fn load(dir: &Path) -> Result<Self, MetaError> {
        let buf = std::fs::read(dir.join(Self::FILE_NAME))?;
        serde_json::from_slice(&buf).map_err(|e| MetaError::Codec(e.to_string()))
    }
}
