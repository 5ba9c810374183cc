//! One meta partition: the replicated state machine plus its local
//! surroundings (raft handle, free list, audit files, stop signal).
//!
//! Mutating client operations flow dedup-check → raft propose → apply;
//! read-only operations are served straight from the local backend and
//! may trail the leader by the replication lag, which callers accept.
//! A backend failure during apply marks the replica halted: it stops
//! accepting work and waits for the operator to restore from snapshot.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::applier::{Applier, ApplierConfig, ApplyResult};
use crate::audit::AuditLog;
use crate::backend::{MetaBackend, TreeTag};
use crate::command::CommandEnvelope;
use crate::config::{NodeConfig, PartitionMeta};
use crate::cursor::InodeRange;
use crate::dentry::{self, DeletedDentry, Dentry};
use crate::freelist::FreeList;
use crate::inode::{DeletedInode, Inode};
use crate::raftlog::{LocalRaft, RaftLog};
use crate::snapshot::{self, SnapshotItem};
use crate::types::{InodeId, MetaError, PartitionId, Status};

/// Point-in-time partition statistics for StatFs and manager reporting.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionStat {
    /// Last applied raft index.
    pub applied_index: u64,
    /// Live inode count.
    pub inode_count: u64,
    /// Live dentry count.
    pub dentry_count: u64,
    /// Trash inode count.
    pub deleted_inode_count: u64,
    /// Aggregate live bytes.
    pub live_size: u64,
    /// Aggregate trash bytes.
    pub deleted_size: u64,
    /// Allocation cursor.
    pub cursor: u64,
    /// Greatest allocated inode ID.
    pub max_inode_id: u64,
    /// IDs still allocatable before the range is exhausted.
    pub free_inodes: u64,
}

/// A meta partition hosted on this node.
pub struct Partition {
    meta: PartitionMeta,
    dir: PathBuf,
    applier: Arc<Applier>,
    raft: Arc<dyn RaftLog>,
    extent_audit: Arc<AuditLog>,
    inode_extent_audit: Arc<AuditLog>,
    halted: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Partition {
    /// Opens a partition over `backend` in `dir`, wiring a single-replica
    /// raft log. Production deployments swap the raft factory via
    /// [`Partition::open_with_raft`].
    pub fn open(
        dir: &Path,
        meta: PartitionMeta,
        cfg: &NodeConfig,
        backend: Arc<dyn MetaBackend>,
        now_ts: u64,
    ) -> Result<Arc<Self>, MetaError> {
        Self::open_with_raft(dir, meta, cfg, backend, now_ts, |applier| {
            let applied = applier
                .backend()
                .base_info()
                .map(|b| b.applied_index)
                .unwrap_or(0);
            Arc::new(LocalRaft::new(applier, applied))
        })
    }

    /// Opens a partition with a caller-supplied raft handle.
    pub fn open_with_raft<F>(
        dir: &Path,
        meta: PartitionMeta,
        cfg: &NodeConfig,
        backend: Arc<dyn MetaBackend>,
        now_ts: u64,
        make_raft: F,
    ) -> Result<Arc<Self>, MetaError>
    where
        F: FnOnce(Arc<Applier>) -> Arc<dyn RaftLog>,
    {
        ensure_layout(dir)?;
        meta.save(dir)?;
        let inode_audit = Arc::new(AuditLog::open(dir, "INODE_DEL", cfg.audit.clone(), now_ts)?);
        let extent_audit = Arc::new(AuditLog::open(
            dir,
            "delete_extent_key_list",
            cfg.audit.clone(),
            now_ts,
        )?);
        let inode_extent_audit = Arc::new(AuditLog::open(
            dir,
            "inode_delete_extent_key_list",
            cfg.audit.clone(),
            now_ts,
        )?);
        let free_list = Arc::new(FreeList::new(cfg.freelist_capacity));
        let applier = Arc::new(Applier::new(
            backend,
            InodeRange::new(meta.start, meta.end),
            ApplierConfig {
                trash_enabled: cfg.trash_enabled,
                cursor_min_headroom: cfg.cursor_min_headroom,
                dedup_capacity: cfg.dedup_capacity,
                dedup_retain_ms: cfg.dedup_retain_ms,
            },
            free_list,
            Some(inode_audit),
        ));
        let raft = make_raft(applier.clone());
        let (stop_tx, _) = watch::channel(false);
        let partition = Arc::new(Self {
            meta,
            dir: dir.to_path_buf(),
            applier,
            raft,
            extent_audit,
            inode_extent_audit,
            halted: AtomicBool::new(false),
            stop_tx,
        });
        partition.rebuild_free_list()?;
        tracing::info!(
            partition = %partition.meta.partition_id,
            start = partition.meta.start,
            end = partition.meta.end,
            "partition opened"
        );
        Ok(partition)
    }

    /// The partition's identity.
    pub fn id(&self) -> PartitionId {
        self.meta.partition_id
    }

    /// The persisted partition metadata.
    pub fn meta(&self) -> &PartitionMeta {
        &self.meta
    }

    /// The partition directory on disk.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The state machine (exposed for the reclaimer and tests).
    pub fn applier(&self) -> &Arc<Applier> {
        &self.applier
    }

    /// The raft handle.
    pub fn raft(&self) -> &Arc<dyn RaftLog> {
        &self.raft
    }

    /// Audit sink for extent-delete forensics.
    pub fn extent_audit(&self) -> &Arc<AuditLog> {
        &self.extent_audit
    }

    /// Audit sink for per-inode extent forensics.
    pub fn inode_extent_audit(&self) -> &Arc<AuditLog> {
        &self.inode_extent_audit
    }

    /// True while this replica leads the raft group.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Subscribes to the stop signal.
    pub fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Signals every background task of this partition to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        tracing::info!(partition = %self.meta.partition_id, "partition stopping");
    }

    /// True once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// True once a backend failure has diverged this replica.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Submits a mutating operation: dedup fast path, then raft.
    pub fn submit(&self, env: CommandEnvelope) -> Result<ApplyResult, MetaError> {
        if self.is_halted() || self.is_stopped() {
            return Ok(ApplyResult::of(Status::Again));
        }
        if let Some(status) = self.applier.dedup_check(&env) {
            // Seen before: answer from the ledger with fresh entity data,
            // without consuming a raft slot.
            let inode = self.applier.refresh_target(&env.command)?;
            return Ok(ApplyResult {
                status,
                inode,
                value: None,
            });
        }
        match self.raft.propose(&env) {
            Ok((_, result)) => Ok(result),
            Err(MetaError::NotLeader { .. }) | Err(MetaError::Raft(_)) => {
                Ok(ApplyResult::of(Status::Again))
            }
            Err(e) => {
                self.halt(&e);
                Err(e)
            }
        }
    }

    fn halt(&self, err: &MetaError) {
        self.halted.store(true, Ordering::SeqCst);
        tracing::error!(
            partition = %self.meta.partition_id,
            error = %err,
            "apply failed; replica halted pending operator recovery"
        );
    }

    // ---- read-only operations (no raft, bounded staleness) --------------

    /// Reads one live inode.
    pub fn inode_get(&self, ino: InodeId) -> Result<(Status, Option<Inode>), MetaError> {
        if !self.applier.range().contains(ino.as_u64()) {
            return Ok((Status::OutOfRange, None));
        }
        let key = ino.as_u64().to_be_bytes();
        match self.applier.backend().get(TreeTag::Inode, &key)? {
            Some(buf) => Ok((Status::Ok, Some(Inode::decode(&buf)?))),
            None => Ok((Status::NotExist, None)),
        }
    }

    /// Reads a batch of live inodes; absent IDs are skipped.
    pub fn inode_get_batch(&self, inos: &[InodeId]) -> Result<Vec<Inode>, MetaError> {
        let mut out = Vec::with_capacity(inos.len());
        for ino in inos {
            if let (Status::Ok, Some(inode)) = self.inode_get(*ino)? {
                out.push(inode);
            }
        }
        Ok(out)
    }

    /// Resolves one name under a parent directory.
    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<(Status, Option<Dentry>), MetaError> {
        let key = dentry::dentry_key(parent, name);
        match self.applier.backend().get(TreeTag::Dentry, &key)? {
            Some(buf) => Ok((Status::Ok, Some(Dentry::decode(&buf)?))),
            None => Ok((Status::NotExist, None)),
        }
    }

    /// Lists a directory, optionally starting after `from` and bounded by
    /// `limit`.
    pub fn read_dir(
        &self,
        parent: InodeId,
        from: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Dentry>, MetaError> {
        let (mut start, end) = dentry::dentry_parent_range(parent);
        if let Some(from) = from {
            start = dentry::dentry_key(parent, from);
            // Resume strictly after the marker.
            start.push(0);
        }
        let mut out = Vec::new();
        self.applier
            .backend()
            .range(TreeTag::Dentry, &start, Some(&end), &mut |_, v| {
                out.push(Dentry::decode(v)?);
                Ok(out.len() < limit)
            })?;
        Ok(out)
    }

    /// Lists trash entries for (parent, name); every deletion timestamp
    /// of the name is returned.
    pub fn deleted_dentry_lookup(
        &self,
        parent: InodeId,
        name: &str,
    ) -> Result<Vec<DeletedDentry>, MetaError> {
        let (start, end) = dentry::deleted_dentry_name_range(parent, name);
        let mut out = Vec::new();
        self.applier
            .backend()
            .range(TreeTag::DeletedDentry, &start, Some(&end), &mut |_, v| {
                out.push(DeletedDentry::decode(v)?);
                Ok(true)
            })?;
        Ok(out)
    }

    /// Reads one trash inode.
    pub fn deleted_inode_get(
        &self,
        ino: InodeId,
    ) -> Result<(Status, Option<DeletedInode>), MetaError> {
        let key = ino.as_u64().to_be_bytes();
        match self.applier.backend().get(TreeTag::DeletedInode, &key)? {
            Some(buf) => Ok((Status::Ok, Some(DeletedInode::decode(&buf)?))),
            None => Ok((Status::NotExist, None)),
        }
    }

    /// Partition statistics.
    pub fn stat_fs(&self) -> Result<PartitionStat, MetaError> {
        let backend = self.applier.backend();
        let base = backend.base_info()?;
        let range = self.applier.range();
        let max_inode_id = match backend.max_key(TreeTag::Inode)? {
            Some(key) if key.len() == 8 => u64::from_be_bytes(key.as_slice().try_into().unwrap()),
            _ => 0,
        };
        let effective_cursor = base.cursor.max(range.start.saturating_sub(1));
        Ok(PartitionStat {
            applied_index: base.applied_index,
            inode_count: backend.len(TreeTag::Inode)?,
            dentry_count: backend.len(TreeTag::Dentry)?,
            deleted_inode_count: backend.len(TreeTag::DeletedInode)?,
            live_size: base.live_size,
            deleted_size: base.deleted_size,
            cursor: base.cursor,
            max_inode_id,
            free_inodes: range.end.saturating_sub(effective_cursor),
        })
    }

    // ---- snapshots -------------------------------------------------------

    /// Builds the snapshot item stream for a joining follower.
    pub fn build_snapshot(&self, version: u8) -> Result<Vec<SnapshotItem>, MetaError> {
        snapshot::build(
            self.applier.backend().as_ref(),
            self.applier.ledger_snapshot()?,
            version,
        )
    }

    /// Wipes local state and installs a received snapshot stream.
    pub fn install_snapshot(&self, items: &[SnapshotItem]) -> Result<(), MetaError> {
        let ledger = snapshot::install(self.applier.backend().as_ref(), items)?;
        if !ledger.is_empty() {
            self.applier.ledger_restore(&ledger)?;
        }
        self.rebuild_free_list()?;
        tracing::info!(
            partition = %self.meta.partition_id,
            applied = self.applier.backend().base_info()?.applied_index,
            "snapshot installed"
        );
        Ok(())
    }

    /// Rescans the trash tree and queues every expired inode; called at
    /// startup and after snapshot install.
    pub fn rebuild_free_list(&self) -> Result<(), MetaError> {
        let free_list = self.applier.free_list();
        free_list.clear();
        let mut queued = 0u64;
        self.applier
            .backend()
            .range(TreeTag::DeletedInode, &[], None, &mut |_, v| {
                let deleted = DeletedInode::decode(v)?;
                if deleted.is_expired && free_list.push(deleted.inode.ino) {
                    queued += 1;
                }
                Ok(true)
            })?;
        if queued > 0 {
            tracing::info!(
                partition = %self.meta.partition_id,
                queued,
                "free list rebuilt from trash tree"
            );
        }
        Ok(())
    }
}

/// Prepares the on-disk layout, recovering `snapshot/` from
/// `snapshot_backup/` when a previous install was interrupted.
fn ensure_layout(dir: &Path) -> Result<(), MetaError> {
    std::fs::create_dir_all(dir)?;
    let snap = dir.join("snapshot");
    let backup = dir.join("snapshot_backup");
    if !snap.exists() && backup.exists() {
        std::fs::rename(&backup, &snap)?;
        tracing::warn!(dir = %dir.display(), "recovered snapshot from backup");
    }
    std::fs::create_dir_all(&snap)?;
    Ok(())
}
