//! Node-level partition management.
//!
//! Owns every partition hosted on this node: opens them at startup
//! (reconciling the on-disk directories against the cluster manager's
//! expected list, renaming strays rather than deleting), routes incoming
//! packets by partition ID, and tears everything down on shutdown.
//! Recorder replicas (raft learners) are tracked separately; they apply
//! the log but serve no client traffic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::applier::ApplyResult;
use crate::backend::MetaBackend;
use crate::command::CommandEnvelope;
use crate::config::{BackendKind, NodeConfig, PartitionMeta};
use crate::memdb::MemBackend;
use crate::metrics::{MetricOp, MetricsCollector};
use crate::partition::Partition;
use crate::rpc::{Packet, ReadRequest, ReadResponse, RpcResponse};
use crate::types::{MetaError, NodeId, PartitionId, Status};

/// Manages the meta partitions hosted on one node.
pub struct PartitionManager {
    cfg: NodeConfig,
    partitions: DashMap<PartitionId, Arc<Partition>>,
    recorders: DashMap<PartitionId, Arc<Partition>>,
    metrics: MetricsCollector,
}

impl PartitionManager {
    /// Creates a manager rooted at `cfg.meta_root`.
    pub fn new(cfg: NodeConfig) -> Self {
        Self {
            cfg,
            partitions: DashMap::new(),
            recorders: DashMap::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// The node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    /// The node-wide metrics collector.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Number of serving partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True when no partitions are hosted.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty() && self.recorders.is_empty()
    }

    /// Looks up a serving partition.
    pub fn get(&self, id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions.get(&id).map(|p| p.clone())
    }

    /// Serving partition IDs.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Directory of one partition under the meta root.
    pub fn partition_dir(&self, id: PartitionId) -> PathBuf {
        self.cfg.meta_root.join(format!("partition_{}", id.as_u64()))
    }

    /// Starts every expected partition, reconciling on-disk directories
    /// first. Stray directories are renamed `expired_*_<ts>`, never
    /// deleted. Partitions start concurrently in bounded groups.
    pub fn start_partitions(
        &self,
        expected: &[PartitionMeta],
        now_ts: u64,
    ) -> Result<(), MetaError> {
        self.reconcile_dirs(expected, now_ts)?;
        let parallelism = self.cfg.start_parallelism.max(1);
        for group in expected.chunks(parallelism) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = group
                    .iter()
                    .map(|meta| {
                        let meta = meta.clone();
                        scope.spawn(move || (meta.partition_id, self.open_partition(meta, now_ts)))
                    })
                    .collect();
                for handle in handles {
                    match handle.join() {
                        Ok((_, Ok(()))) => {}
                        Ok((id, Err(e))) => {
                            tracing::error!(partition = %id, error = %e, "partition failed to start");
                        }
                        Err(_) => tracing::error!("partition start task panicked"),
                    }
                }
            });
        }
        tracing::info!(
            serving = self.partitions.len(),
            recording = self.recorders.len(),
            "partition startup complete"
        );
        Ok(())
    }

    /// Opens one partition and registers it.
    pub fn open_partition(&self, meta: PartitionMeta, now_ts: u64) -> Result<(), MetaError> {
        let dir = self.partition_dir(meta.partition_id);
        // A surviving meta file is authoritative over the expected list.
        let meta = match PartitionMeta::load(&dir) {
            Ok(disk) => disk,
            Err(_) => meta,
        };
        let backend = self.make_backend(&dir)?;
        let recorder = meta
            .peers
            .iter()
            .any(|p| p.node_id == NodeId::new(self.cfg.node_id) && p.recorder);
        let partition = Partition::open(&dir, meta, &self.cfg, backend, now_ts)?;
        let id = partition.id();
        if recorder {
            self.recorders.insert(id, partition);
        } else {
            self.partitions.insert(id, partition);
        }
        Ok(())
    }

    /// Stops one partition and forgets it.
    pub fn stop_partition(&self, id: PartitionId) -> bool {
        let removed = self
            .partitions
            .remove(&id)
            .or_else(|| self.recorders.remove(&id));
        match removed {
            Some((_, p)) => {
                p.stop();
                true
            }
            None => false,
        }
    }

    /// Stops every partition.
    pub fn stop_all(&self) {
        for entry in self.partitions.iter() {
            entry.value().stop();
        }
        for entry in self.recorders.iter() {
            entry.value().stop();
        }
        tracing::info!("all partitions stopped");
    }

    /// Routes one client packet to its partition.
    pub fn dispatch(&self, packet: &Packet) -> RpcResponse {
        let start = Instant::now();
        let response = self.dispatch_inner(packet);
        self.metrics.record(
            metric_for_opcode(packet.opcode),
            start.elapsed().as_micros() as u64,
            response.status == Status::Ok,
        );
        response
    }

    fn dispatch_inner(&self, packet: &Packet) -> RpcResponse {
        let Some(partition) = self.get(packet.partition_id) else {
            if self.recorders.contains_key(&packet.partition_id) {
                // Recorders log but do not serve.
                return RpcResponse::of(packet.request_id, Status::Again);
            }
            return RpcResponse::of(packet.request_id, Status::NotExist);
        };
        if packet.is_read() {
            match self.serve_read(&partition, packet) {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(partition = %packet.partition_id, error = %e, "read failed");
                    RpcResponse::of(packet.request_id, Status::Err)
                }
            }
        } else {
            match CommandEnvelope::decode(&packet.body) {
                Ok(env) if env.command.opcode() == packet.opcode => {
                    match partition.submit(env) {
                        Ok(result) => mutation_response(packet.request_id, &result),
                        Err(e) => {
                            tracing::error!(
                                partition = %packet.partition_id,
                                error = %e,
                                "mutation failed"
                            );
                            RpcResponse::of(packet.request_id, Status::Err)
                        }
                    }
                }
                Ok(_) | Err(_) => RpcResponse::of(packet.request_id, Status::Err),
            }
        }
    }

    fn serve_read(
        &self,
        partition: &Partition,
        packet: &Packet,
    ) -> Result<RpcResponse, MetaError> {
        let req: ReadRequest = bincode::deserialize(&packet.body)
            .map_err(|e| MetaError::Codec(e.to_string()))?;
        if req.opcode() != packet.opcode {
            return Ok(RpcResponse::of(packet.request_id, Status::Err));
        }
        let (status, body) = match req {
            ReadRequest::InodeGet { ino } => {
                let (status, inode) = partition.inode_get(ino)?;
                (status, ReadResponse::Inode(inode))
            }
            ReadRequest::InodeGetBatch { inos } => {
                let inodes = partition.inode_get_batch(&inos)?;
                (Status::Ok, ReadResponse::Inodes(inodes))
            }
            ReadRequest::Lookup { parent, name } => {
                let (status, dentry) = partition.lookup(parent, &name)?;
                (status, ReadResponse::Dentry(dentry))
            }
            ReadRequest::ReadDir {
                parent,
                from,
                limit,
            } => {
                let entries = partition.read_dir(parent, from.as_deref(), limit as usize)?;
                (Status::Ok, ReadResponse::Dentries(entries))
            }
            ReadRequest::StatFs => (Status::Ok, ReadResponse::Stat(partition.stat_fs()?)),
            ReadRequest::DeleteDentryLookup { parent, name } => {
                let entries = partition.deleted_dentry_lookup(parent, &name)?;
                (Status::Ok, ReadResponse::DeletedDentries(entries))
            }
            ReadRequest::DeletedInodeGet { ino } => {
                let (status, deleted) = partition.deleted_inode_get(ino)?;
                (status, ReadResponse::DeletedInode(deleted))
            }
        };
        let body = bincode::serialize(&body).map_err(|e| MetaError::Codec(e.to_string()))?;
        Ok(RpcResponse {
            request_id: packet.request_id,
            status,
            body,
        })
    }

    fn make_backend(&self, dir: &std::path::Path) -> Result<Arc<dyn MetaBackend>, MetaError> {
        match self.cfg.backend {
            BackendKind::Memory => Ok(Arc::new(MemBackend::new())),
            #[cfg(feature = "lsm")]
            BackendKind::Lsm => {
                let db_dir = dir.join("db");
                std::fs::create_dir_all(&db_dir)?;
                Ok(Arc::new(crate::lsmdb::LsmBackend::open(&db_dir)?))
            }
            #[cfg(not(feature = "lsm"))]
            BackendKind::Lsm => Err(MetaError::Backend(
                "node built without the lsm feature".to_string(),
            )),
        }
    }

    fn reconcile_dirs(&self, expected: &[PartitionMeta], now_ts: u64) -> Result<(), MetaError> {
        std::fs::create_dir_all(&self.cfg.meta_root)?;
        let expected_ids: std::collections::HashSet<u64> = expected
            .iter()
            .map(|m| m.partition_id.as_u64())
            .collect();
        for entry in std::fs::read_dir(&self.cfg.meta_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = name
                .strip_prefix("partition_")
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if !expected_ids.contains(&id) {
                let stale = entry.path();
                let target = self
                    .cfg
                    .meta_root
                    .join(format!("expired_partition_{}_{}", id, now_ts));
                std::fs::rename(&stale, &target)?;
                tracing::warn!(
                    partition = id,
                    target = %target.display(),
                    "unexpected partition directory set aside"
                );
            }
        }
        Ok(())
    }
}

fn mutation_response(request_id: u64, result: &ApplyResult) -> RpcResponse {
    let body = bincode::serialize(result).unwrap_or_default();
    RpcResponse {
        request_id,
        status: result.status,
        body,
    }
}

fn metric_for_opcode(opcode: u8) -> MetricOp {
    use crate::rpc;
    match opcode {
        1 | 2 => MetricOp::CreateInode,
        3 | 4 | 7 | 8 => MetricOp::UnlinkInode,
        5 | 6 => MetricOp::EvictInode,
        9 | 10 => MetricOp::SetAttr,
        11..=14 => MetricOp::CreateDentry,
        15 | 16 => MetricOp::Xattr,
        17..=19 => MetricOp::Multipart,
        20..=30 => MetricOp::Trash,
        31..=36 => MetricOp::ExtentUpdate,
        rpc::OP_INODE_GET | rpc::OP_INODE_GET_BATCH | rpc::OP_DELETED_INODE_GET => {
            MetricOp::InodeGet
        }
        rpc::OP_LOOKUP | rpc::OP_DELETE_DENTRY_LOOKUP => MetricOp::Lookup,
        rpc::OP_READ_DIR => MetricOp::ReadDir,
        _ => MetricOp::StatFs,
    }
}
