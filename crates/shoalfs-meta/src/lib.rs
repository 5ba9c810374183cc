#![warn(missing_docs)]

//! ShoalFS metadata subsystem: replicated meta partitions, POSIX-like
//! inode/dentry state machines, trash-tier lifecycle, and asynchronous
//! extent reclamation.

/// Deterministic command application (the replicated state machine)
pub mod applier;
/// Rotated append-only forensic files
pub mod audit;
/// Storage backend abstraction over the partition's entity trees
pub mod backend;
/// Replicated command set and wire envelope
pub mod command;
/// Node and partition configuration
pub mod config;
/// Inode-ID allocation and cursor reset rules
pub mod cursor;
/// Request-deduplication ledger
pub mod dedup;
/// Date-keyed extent-delete journal
pub mod delete_wal;
/// Directory entries, live and trash tier
pub mod dentry;
/// Extended attributes
pub mod extend;
/// Extent keys and per-inode sorted extent lists
pub mod extent;
/// Free list of expired inodes awaiting reclamation
pub mod freelist;
/// Inode and deleted-inode entities
pub mod inode;
/// Persistent LSM storage backend (rocksdb)
#[cfg(feature = "lsm")]
pub mod lsmdb;
/// Node-level partition management and packet dispatch
pub mod manager;
/// In-memory storage backend
pub mod memdb;
/// Multipart upload session tracking
pub mod multipart;
/// Operation metrics collector
pub mod metrics;
/// One meta partition and its client operations
pub mod partition;
/// The consensus seam and the single-replica raft log
pub mod raftlog;
/// Leader-driven extent reclamation
pub mod reclaim;
/// Client packet framing and read-only requests
pub mod rpc;
/// Whole-partition snapshot streaming
pub mod snapshot;
/// Background task supervision
pub mod supervisor;
/// Core types for the meta partition service
pub mod types;

pub use applier::{Applier, ApplierConfig, ApplyResult};
pub use backend::{BaseInfo, MetaBackend, TreeTag, WriteBatch};
pub use command::{CommandEnvelope, CursorMode, MetaCommand};
pub use config::{BackendKind, NodeConfig, PartitionMeta, PeerInfo, ReclaimConfig};
pub use cursor::InodeRange;
pub use dedup::{DedupLedger, RequestFingerprint};
pub use dentry::{DeletedDentry, Dentry};
pub use extent::{ExtentKey, SortedExtents};
pub use freelist::FreeList;
pub use inode::{DeletedInode, Inode};
pub use manager::PartitionManager;
pub use memdb::MemBackend;
pub use partition::{Partition, PartitionStat};
pub use raftlog::{CommandSink, LocalRaft, RaftLog};
pub use reclaim::{run_reclaimer, CycleStats, ExtentDeleter, Reclaimer};
pub use rpc::{Packet, ReadRequest, ReadResponse, RpcResponse};
pub use types::{FileType, InodeId, MetaError, NodeId, PartitionId, Status};
