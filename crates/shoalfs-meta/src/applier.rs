//! Deterministic application of replicated commands.
//!
//! Every replica runs the same command stream through [`Applier::apply`]:
//! exactly one backend batch per command, all mutations plus the
//! applied-index bump committed atomically. Handlers never read the
//! clock, never iterate unordered containers, and take every timestamp
//! from the command payload, so replicas at the same applied index hold
//! byte-identical trees. Logical collisions come back as status codes;
//! a backend failure is returned as an error and the replica must halt.

use std::sync::{Arc, Mutex};

use crate::audit::AuditLog;
use crate::backend::{lookup_through, BaseInfo, MetaBackend, TreeTag, WriteBatch};
use crate::command::{AttrPatch, CommandEnvelope, MetaCommand};
use crate::cursor::InodeRange;
use crate::dedup::DedupLedger;
use crate::delete_wal::{self, pack_date};
use crate::dentry::{self, Dentry, DeletedDentry};
use crate::extend::Extend;
use crate::extent::ExtentKey;
use crate::freelist::FreeList;
use crate::inode::{DeletedInode, Inode};
use crate::multipart::{multipart_key, Multipart, Part};
use crate::types::{InodeId, MetaError, Status};

/// Apply-time tunables shared by every replica of a partition.
#[derive(Clone, Debug)]
pub struct ApplierConfig {
    /// When false, unlinked inodes are expired immediately instead of
    /// resting in the trash tier.
    pub trash_enabled: bool,
    /// Minimum range headroom a `CursorReset(Sub)` must reclaim.
    pub cursor_min_headroom: u64,
    /// Dedup ledger capacity.
    pub dedup_capacity: usize,
    /// Minimum dedup retention in milliseconds.
    pub dedup_retain_ms: u64,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            trash_enabled: true,
            cursor_min_headroom: 1_000,
            dedup_capacity: 100_000,
            dedup_retain_ms: 5 * 60 * 1_000,
        }
    }
}

/// Outcome of one applied command.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApplyResult {
    /// Response code for the client.
    pub status: Status,
    /// The entity the operation acted on, when one survives.
    pub inode: Option<Inode>,
    /// Numeric payload (old child inode, new cursor, ...).
    pub value: Option<u64>,
}

impl ApplyResult {
    /// A bare status outcome.
    pub fn of(status: Status) -> Self {
        Self {
            status,
            inode: None,
            value: None,
        }
    }

    /// A plain success.
    pub fn ok() -> Self {
        Self::of(Status::Ok)
    }

    fn with_inode(mut self, inode: Inode) -> Self {
        self.inode = Some(inode);
        self
    }

    fn with_value(mut self, value: u64) -> Self {
        self.value = Some(value);
        self
    }
}

/// The replicated state machine of one partition.
pub struct Applier {
    backend: Arc<dyn MetaBackend>,
    range: InodeRange,
    cfg: ApplierConfig,
    ledger: Mutex<DedupLedger>,
    free_list: Arc<FreeList>,
    inode_audit: Option<Arc<AuditLog>>,
}

impl Applier {
    /// Builds the state machine over a backend.
    pub fn new(
        backend: Arc<dyn MetaBackend>,
        range: InodeRange,
        cfg: ApplierConfig,
        free_list: Arc<FreeList>,
        inode_audit: Option<Arc<AuditLog>>,
    ) -> Self {
        let ledger = DedupLedger::new(cfg.dedup_capacity, cfg.dedup_retain_ms);
        Self {
            backend,
            range,
            cfg,
            ledger: Mutex::new(ledger),
            free_list,
            inode_audit,
        }
    }

    /// The partition's inode range.
    pub fn range(&self) -> InodeRange {
        self.range
    }

    /// The storage backend.
    pub fn backend(&self) -> &Arc<dyn MetaBackend> {
        &self.backend
    }

    /// Shared free list of expired inodes.
    pub fn free_list(&self) -> &Arc<FreeList> {
        &self.free_list
    }

    /// Checks the dedup ledger without applying (pre-propose fast path).
    pub fn dedup_check(&self, env: &CommandEnvelope) -> Option<Status> {
        let fp = env.fingerprint.as_ref()?;
        self.ledger.lock().unwrap().check(fp)
    }

    /// Serializes the dedup ledger for a partition snapshot.
    pub fn ledger_snapshot(&self) -> Result<Vec<u8>, MetaError> {
        self.ledger.lock().unwrap().snapshot()
    }

    /// Replaces the dedup ledger from snapshot bytes.
    pub fn ledger_restore(&self, buf: &[u8]) -> Result<(), MetaError> {
        *self.ledger.lock().unwrap() = DedupLedger::restore(buf)?;
        Ok(())
    }

    /// Applies one raft-ordered command at `index`.
    pub fn apply(&self, env: &CommandEnvelope, index: u64) -> Result<ApplyResult, MetaError> {
        let mut batch = self.backend.begin();
        let mut base = self.backend.base_info()?;

        if let Some(fp) = &env.fingerprint {
            if let Some(status) = self.ledger.lock().unwrap().check(fp) {
                // Retried command replaying through the log: keep the
                // original response, bump the index, change nothing else.
                base.applied_index = index;
                self.backend.commit(batch, &base)?;
                let inode = self.refresh_target(&env.command)?;
                return Ok(ApplyResult {
                    status,
                    inode,
                    value: None,
                });
            }
        }

        let result = self.dispatch(env, &mut batch, &mut base)?;
        for (i, d) in batch.count_deltas.iter().enumerate() {
            base.counts[i] = (base.counts[i] as i64 + d).max(0) as u64;
        }
        base.applied_index = index;
        self.backend.commit(batch, &base)?;
        if let Some(fp) = env.fingerprint {
            self.ledger
                .lock()
                .unwrap()
                .record(fp, result.status, command_ts_ms(&env.command));
        }
        Ok(result)
    }

    fn dispatch(
        &self,
        env: &CommandEnvelope,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
    ) -> Result<ApplyResult, MetaError> {
        match &env.command {
            MetaCommand::CreateInode {
                mode,
                uid,
                gid,
                target,
                ts,
            } => self.create_inode(batch, base, *mode, *uid, *gid, target, *ts),
            MetaCommand::CreateInodeLink { ino, ts } => self.create_link(batch, *ino, *ts),
            MetaCommand::UnlinkInode { ino, ts } => self.unlink_inode(batch, base, *ino, *ts),
            MetaCommand::UnlinkInodeBatch { inos, ts } => {
                for ino in dedup_inos(inos) {
                    self.unlink_inode(batch, base, ino, *ts)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::EvictInode { ino } => self.evict_inode(batch, *ino),
            MetaCommand::EvictInodeBatch { inos } => {
                for ino in dedup_inos(inos) {
                    self.evict_inode(batch, ino)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::DeleteInode { ino, ts } => self.delete_inode(batch, base, *ino, *ts),
            MetaCommand::DeleteInodeBatch { inos, ts } => {
                for ino in dedup_inos(inos) {
                    self.delete_inode(batch, base, ino, *ts)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::SetAttr { ino, patch, ts } => self.set_attr(batch, *ino, patch, *ts),
            MetaCommand::CursorReset { mode, new_cursor } => {
                let max_ino = self.max_inode_id()?;
                match self.range.validate_reset(
                    *mode,
                    base.cursor,
                    *new_cursor,
                    max_ino,
                    self.cfg.cursor_min_headroom,
                ) {
                    Ok(cursor) => {
                        base.cursor = cursor;
                        Ok(ApplyResult::ok().with_value(cursor))
                    }
                    Err(status) => Ok(ApplyResult::of(status)),
                }
            }
            MetaCommand::CreateDentry { dentry, ts } => {
                self.create_dentry(batch, dentry, *ts)
            }
            MetaCommand::DeleteDentry { parent, name, ts } => {
                self.delete_dentry(batch, *parent, name, *ts, &env.from)
            }
            MetaCommand::BatchDeleteDentry { dentries, ts } => {
                for (parent, name) in dentries {
                    self.delete_dentry(batch, *parent, name, *ts, &env.from)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::UpdateDentry {
                parent,
                name,
                ino,
                ts,
            } => self.update_dentry(batch, *parent, name, *ino, *ts),
            MetaCommand::SetXAttr { ino, key, value } => {
                self.set_xattr(batch, *ino, key, value.clone())
            }
            MetaCommand::RemoveXAttr { ino, key } => self.remove_xattr(batch, *ino, key),
            MetaCommand::CreateMultipart {
                object_key,
                upload_id,
                ts,
                metadata,
            } => self.create_multipart(batch, object_key, upload_id, *ts, metadata),
            MetaCommand::AppendMultipart {
                object_key,
                upload_id,
                part,
            } => self.append_multipart(batch, object_key, upload_id, part),
            MetaCommand::RemoveMultipart {
                object_key,
                upload_id,
            } => self.remove_multipart(batch, object_key, upload_id),
            MetaCommand::RecoverDeletedDentry {
                parent,
                name,
                timestamp,
                ino,
            } => self.recover_deleted_dentry(batch, *parent, name, *timestamp, *ino),
            MetaCommand::RecoverDeletedDentryBatch { dentries } => {
                for (parent, name, timestamp, ino) in dentries {
                    self.recover_deleted_dentry(batch, *parent, name, *timestamp, *ino)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::RecoverDeletedInode { ino } => {
                self.recover_deleted_inode(batch, base, *ino)
            }
            MetaCommand::RecoverDeletedInodeBatch { inos } => {
                for ino in dedup_inos(inos) {
                    self.recover_deleted_inode(batch, base, ino)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::CleanDeletedDentry {
                parent,
                name,
                timestamp,
                ino,
            } => self.clean_deleted_dentry(batch, *parent, name, *timestamp, *ino),
            MetaCommand::CleanDeletedDentryBatch { dentries } => {
                for (parent, name, timestamp, ino) in dentries {
                    self.clean_deleted_dentry(batch, *parent, name, *timestamp, *ino)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::CleanDeletedInode { ino } => self.clean_deleted_inode(batch, *ino),
            MetaCommand::CleanDeletedInodeBatch { inos } => {
                for ino in dedup_inos(inos) {
                    self.clean_deleted_inode(batch, ino)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::CleanExpiredInode { ino, deadline } => {
                self.clean_expired_inode(batch, *ino, *deadline)
            }
            MetaCommand::CleanExpiredInodeBatch { inos, deadline } => {
                for ino in dedup_inos(inos) {
                    self.clean_expired_inode(batch, ino, *deadline)?;
                }
                Ok(ApplyResult::ok())
            }
            MetaCommand::InternalCleanDeletedInode { inos } => {
                self.internal_clean(batch, base, inos)
            }
            MetaCommand::ExtentAppend { ino, extent, ts } => {
                self.extent_append(batch, base, *ino, *extent, *ts)
            }
            MetaCommand::ExtentInsert { ino, extents, ts } => {
                self.extent_insert(batch, base, *ino, extents, *ts)
            }
            MetaCommand::ExtentTruncate { ino, size, ts } => {
                self.extent_truncate(batch, base, *ino, *size, *ts)
            }
            MetaCommand::ExtentsMerge { ino, old, new, ts } => {
                self.extents_merge(batch, *ino, old, new, *ts)
            }
            MetaCommand::SyncDelExtents { cursor } => {
                base.del_cursor = base.del_cursor.max(*cursor);
                Ok(ApplyResult::ok())
            }
            MetaCommand::SyncDelExtentsV2 { cursor, keys } => {
                base.del_cursor = base.del_cursor.max(*cursor);
                delete_wal::rotate(self.backend.as_ref(), batch, *cursor, keys)?;
                Ok(ApplyResult::ok())
            }
        }
    }

    // ---- inode handlers -------------------------------------------------

    fn create_inode(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        mode: u32,
        uid: u32,
        gid: u32,
        target: &[u8],
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        let id = match self.range.next_id(base.cursor) {
            Ok(id) => id,
            Err(status) => return Ok(ApplyResult::of(status)),
        };
        base.cursor = id;
        let mut inode = Inode::new(InodeId::new(id), mode, uid, gid, ts);
        if !target.is_empty() {
            inode.link_target = target.to_vec();
            inode.size = target.len() as u64;
        }
        let out = self.backend.put(
            batch,
            TreeTag::Inode,
            inode.key(),
            inode.encode(),
            false,
        )?;
        if !out.inserted {
            tracing::warn!(ino = %inode.ino, "allocated inode id already present");
            return Ok(ApplyResult::of(Status::Exists));
        }
        base.live_size += inode.size;
        Ok(ApplyResult::ok().with_inode(inode))
    }

    fn create_link(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        if !self.range.contains(ino.as_u64()) {
            return Ok(ApplyResult::of(Status::OutOfRange));
        }
        let Some(mut inode) = self.read_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if inode.is_delete_marked() {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        if inode.is_dir() {
            return Ok(ApplyResult::of(Status::AccessDenied));
        }
        inode.nlink += 1;
        inode.ctime = ts;
        self.put_inode(batch, &inode)?;
        Ok(ApplyResult::ok().with_inode(inode))
    }

    fn unlink_inode(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        if !self.range.contains(ino.as_u64()) {
            return Ok(ApplyResult::of(Status::OutOfRange));
        }
        let Some(mut inode) = self.read_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if inode.is_delete_marked() {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        if inode.is_dir() {
            if inode.nlink > 2 || self.has_live_children(ino)? {
                return Ok(ApplyResult::of(Status::Exists));
            }
            inode.nlink = 0;
        } else {
            inode.nlink = inode.nlink.saturating_sub(1);
        }
        inode.ctime = ts;
        if inode.nlink > 0 {
            self.put_inode(batch, &inode)?;
            return Ok(ApplyResult::ok().with_inode(inode));
        }
        self.move_to_trash(batch, base, inode.clone(), ts)?;
        Ok(ApplyResult::ok().with_inode(inode))
    }

    fn move_to_trash(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        inode: Inode,
        ts: u64,
    ) -> Result<(), MetaError> {
        self.backend.delete(batch, TreeTag::Inode, &inode.key())?;
        base.live_size = base.live_size.saturating_sub(inode.size);
        base.deleted_size += inode.size;
        let mut deleted = DeletedInode::from_inode(inode, ts);
        if !self.cfg.trash_enabled {
            deleted.is_expired = true;
        }
        let ino = deleted.inode.ino;
        self.backend.put(
            batch,
            TreeTag::DeletedInode,
            deleted.key(),
            deleted.encode(),
            true,
        )?;
        if deleted.is_expired {
            self.free_list.push(ino);
        }
        Ok(())
    }

    fn evict_inode(&self, batch: &mut WriteBatch, ino: InodeId) -> Result<ApplyResult, MetaError> {
        let Some(mut deleted) = self.read_deleted_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if deleted.is_expired {
            // Safe to repeat; the free list de-duplicates.
            self.free_list.push(ino);
            return Ok(ApplyResult::ok());
        }
        deleted.is_expired = true;
        self.backend.put(
            batch,
            TreeTag::DeletedInode,
            deleted.key(),
            deleted.encode(),
            true,
        )?;
        self.free_list.push(ino);
        Ok(ApplyResult::ok())
    }

    fn delete_inode(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        let Some(inode) = self.read_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        self.backend.delete(batch, TreeTag::Inode, &inode.key())?;
        base.live_size = base.live_size.saturating_sub(inode.size);
        if !inode.extents.is_empty() {
            delete_wal::stage_delete_extents(
                self.backend.as_ref(),
                batch,
                pack_date(ts),
                inode.extents.keys(),
            )?;
        }
        Ok(ApplyResult::ok())
    }

    fn set_attr(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
        patch: &AttrPatch,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        let Some(mut inode) = self.read_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if inode.is_delete_marked() {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        if let Some(mode) = patch.mode {
            inode.mode = (inode.mode & 0o170000) | (mode & 0o7777);
        }
        if let Some(uid) = patch.uid {
            inode.uid = uid;
        }
        if let Some(gid) = patch.gid {
            inode.gid = gid;
        }
        if let Some(atime) = patch.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = patch.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = ts;
        self.put_inode(batch, &inode)?;
        Ok(ApplyResult::ok().with_inode(inode))
    }

    // ---- dentry handlers ------------------------------------------------

    fn create_dentry(
        &self,
        batch: &mut WriteBatch,
        d: &Dentry,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        let parent = if self.range.contains(d.parent.as_u64()) {
            // Cross-partition roots live elsewhere; local parents must be
            // live directories.
            let Some(parent) = self.read_inode(batch, d.parent)? else {
                return Ok(ApplyResult::of(Status::NotExist));
            };
            if parent.is_delete_marked() {
                return Ok(ApplyResult::of(Status::NotExist));
            }
            if !parent.is_dir() {
                return Ok(ApplyResult::of(Status::AccessDenied));
            }
            Some(parent)
        } else {
            None
        };
        let out = self
            .backend
            .put(batch, TreeTag::Dentry, d.key(), d.encode(), false)?;
        if !out.inserted {
            let existing = Dentry::decode(out.prior.as_deref().unwrap_or_default())?;
            let status = if existing.ino == d.ino && existing.dtype == d.dtype {
                Status::Ok
            } else {
                Status::Exists
            };
            return Ok(ApplyResult::of(status).with_value(existing.ino.as_u64()));
        }
        if let Some(mut parent) = parent {
            if crate::types::is_dir_mode(d.dtype) {
                parent.nlink += 1;
            }
            parent.mtime = ts;
            self.put_inode(batch, &parent)?;
        }
        Ok(ApplyResult::ok())
    }

    fn delete_dentry(
        &self,
        batch: &mut WriteBatch,
        parent: InodeId,
        name: &str,
        ts: u64,
        from: &str,
    ) -> Result<ApplyResult, MetaError> {
        let key = dentry::dentry_key(parent, name);
        let Some(buf) = lookup_through(self.backend.as_ref(), batch, TreeTag::Dentry, &key)?
        else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        let d = Dentry::decode(&buf)?;
        self.backend.delete(batch, TreeTag::Dentry, &key)?;
        if self.cfg.trash_enabled {
            let trash = DeletedDentry::from_dentry(&d, ts, from);
            self.backend.put(
                batch,
                TreeTag::DeletedDentry,
                trash.key(),
                trash.encode(),
                true,
            )?;
        }
        if crate::types::is_dir_mode(d.dtype) && self.range.contains(parent.as_u64()) {
            if let Some(mut p) = self.read_inode(batch, parent)? {
                p.nlink = p.nlink.saturating_sub(1).max(2);
                p.mtime = ts;
                self.put_inode(batch, &p)?;
            }
        }
        Ok(ApplyResult::ok().with_value(d.ino.as_u64()))
    }

    fn update_dentry(
        &self,
        batch: &mut WriteBatch,
        parent: InodeId,
        name: &str,
        ino: InodeId,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        let key = dentry::dentry_key(parent, name);
        let Some(buf) = lookup_through(self.backend.as_ref(), batch, TreeTag::Dentry, &key)?
        else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        let mut d = Dentry::decode(&buf)?;
        let old = d.ino;
        d.ino = ino;
        self.backend
            .put(batch, TreeTag::Dentry, d.key(), d.encode(), true)?;
        let _ = ts;
        Ok(ApplyResult::ok().with_value(old.as_u64()))
    }

    // ---- xattr handlers -------------------------------------------------

    fn set_xattr(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
        key: &str,
        value: Vec<u8>,
    ) -> Result<ApplyResult, MetaError> {
        let mut extend = match self.read_extend(batch, ino)? {
            Some(e) => e,
            None => Extend::new(ino),
        };
        extend.set(key, value);
        self.backend
            .put(batch, TreeTag::Extend, extend.key(), extend.encode(), true)?;
        Ok(ApplyResult::ok())
    }

    fn remove_xattr(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
        key: &str,
    ) -> Result<ApplyResult, MetaError> {
        let Some(mut extend) = self.read_extend(batch, ino)? else {
            return Ok(ApplyResult::ok());
        };
        if extend.remove(key) {
            if extend.is_empty() {
                self.backend.delete(batch, TreeTag::Extend, &extend.key())?;
            } else {
                self.backend.put(
                    batch,
                    TreeTag::Extend,
                    extend.key(),
                    extend.encode(),
                    true,
                )?;
            }
        }
        Ok(ApplyResult::ok())
    }

    // ---- multipart handlers ---------------------------------------------

    fn create_multipart(
        &self,
        batch: &mut WriteBatch,
        object_key: &str,
        upload_id: &str,
        ts: u64,
        metadata: &[(String, String)],
    ) -> Result<ApplyResult, MetaError> {
        let mut m = Multipart::new(object_key, upload_id, ts);
        for (k, v) in metadata {
            m.metadata.insert(k.clone(), v.clone());
        }
        let out = self
            .backend
            .put(batch, TreeTag::Multipart, m.key(), m.encode(), false)?;
        if !out.inserted {
            return Ok(ApplyResult::of(Status::Exists));
        }
        Ok(ApplyResult::ok())
    }

    fn append_multipart(
        &self,
        batch: &mut WriteBatch,
        object_key: &str,
        upload_id: &str,
        part: &Part,
    ) -> Result<ApplyResult, MetaError> {
        let key = multipart_key(object_key, upload_id);
        let Some(buf) = lookup_through(self.backend.as_ref(), batch, TreeTag::Multipart, &key)?
        else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        let mut m = Multipart::decode(&buf)?;
        if !m.insert_part(part.clone()) {
            return Ok(ApplyResult::of(Status::Exists));
        }
        self.backend
            .put(batch, TreeTag::Multipart, m.key(), m.encode(), true)?;
        Ok(ApplyResult::ok())
    }

    fn remove_multipart(
        &self,
        batch: &mut WriteBatch,
        object_key: &str,
        upload_id: &str,
    ) -> Result<ApplyResult, MetaError> {
        let key = multipart_key(object_key, upload_id);
        if !self.backend.delete(batch, TreeTag::Multipart, &key)? {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        Ok(ApplyResult::ok())
    }

    // ---- trash handlers -------------------------------------------------

    fn recover_deleted_dentry(
        &self,
        batch: &mut WriteBatch,
        parent: InodeId,
        name: &str,
        timestamp: u64,
        ino: InodeId,
    ) -> Result<ApplyResult, MetaError> {
        let trash = DeletedDentry {
            parent,
            name: name.to_string(),
            timestamp,
            ino,
            dtype: 0,
            from: String::new(),
        };
        let key = trash.key();
        let Some(buf) =
            lookup_through(self.backend.as_ref(), batch, TreeTag::DeletedDentry, &key)?
        else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        let trash = DeletedDentry::decode(&buf)?;
        let live = trash.restore();
        let out = self
            .backend
            .put(batch, TreeTag::Dentry, live.key(), live.encode(), false)?;
        if !out.inserted {
            let existing = Dentry::decode(out.prior.as_deref().unwrap_or_default())?;
            if existing.ino != live.ino {
                // The slot is occupied by a different child; the live
                // entry wins and the trash copy stays put.
                return Ok(ApplyResult::of(Status::Exists));
            }
        }
        self.backend.delete(batch, TreeTag::DeletedDentry, &key)?;
        if crate::types::is_dir_mode(live.dtype) && self.range.contains(parent.as_u64()) {
            if let Some(mut p) = self.read_inode(batch, parent)? {
                p.nlink += 1;
                self.put_inode(batch, &p)?;
            }
        }
        Ok(ApplyResult::ok().with_value(live.ino.as_u64()))
    }

    fn recover_deleted_inode(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
    ) -> Result<ApplyResult, MetaError> {
        let Some(deleted) = self.read_deleted_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        base.deleted_size = base.deleted_size.saturating_sub(deleted.inode.size);
        self.backend
            .delete(batch, TreeTag::DeletedInode, &deleted.key())?;
        if let Some(live) = self.read_inode(batch, ino)? {
            // A live inode with this ID wins; the trash entry is dropped.
            return Ok(ApplyResult::ok().with_inode(live));
        }
        let recovered = deleted.recover();
        base.live_size += recovered.size;
        self.put_inode(batch, &recovered)?;
        Ok(ApplyResult::ok().with_inode(recovered))
    }

    fn clean_deleted_dentry(
        &self,
        batch: &mut WriteBatch,
        parent: InodeId,
        name: &str,
        timestamp: u64,
        ino: InodeId,
    ) -> Result<ApplyResult, MetaError> {
        let trash = DeletedDentry {
            parent,
            name: name.to_string(),
            timestamp,
            ino,
            dtype: 0,
            from: String::new(),
        };
        if !self
            .backend
            .delete(batch, TreeTag::DeletedDentry, &trash.key())?
        {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        Ok(ApplyResult::ok())
    }

    fn clean_deleted_inode(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
    ) -> Result<ApplyResult, MetaError> {
        let Some(mut deleted) = self.read_deleted_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if self.has_trash_children(ino)? {
            return Ok(ApplyResult::of(Status::Exists));
        }
        if deleted.is_expired {
            self.free_list.push(ino);
            return Ok(ApplyResult::ok());
        }
        deleted.is_expired = true;
        self.backend.put(
            batch,
            TreeTag::DeletedInode,
            deleted.key(),
            deleted.encode(),
            true,
        )?;
        self.free_list.push(ino);
        Ok(ApplyResult::ok())
    }

    fn clean_expired_inode(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
        deadline: u64,
    ) -> Result<ApplyResult, MetaError> {
        let Some(mut deleted) = self.read_deleted_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if deleted.delete_ts > deadline {
            return Ok(ApplyResult::ok());
        }
        if !deleted.is_expired {
            deleted.is_expired = true;
            self.backend.put(
                batch,
                TreeTag::DeletedInode,
                deleted.key(),
                deleted.encode(),
                true,
            )?;
        }
        self.free_list.push(ino);
        Ok(ApplyResult::ok())
    }

    fn internal_clean(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        inos: &[InodeId],
    ) -> Result<ApplyResult, MetaError> {
        for ino in dedup_inos(inos) {
            let Some(deleted) = self.read_deleted_inode(batch, ino)? else {
                continue;
            };
            self.backend
                .delete(batch, TreeTag::DeletedInode, &deleted.key())?;
            base.deleted_size = base.deleted_size.saturating_sub(deleted.inode.size);
            if let Some(audit) = &self.inode_audit {
                let line = format!(
                    "ino {} size {} deleted_at {}",
                    ino, deleted.inode.size, deleted.delete_ts
                );
                if let Err(e) = audit.append(&line, deleted.delete_ts) {
                    tracing::warn!(ino = %ino, error = %e, "inode audit append failed");
                }
            }
        }
        Ok(ApplyResult::ok())
    }

    // ---- extent handlers ------------------------------------------------

    fn extent_append(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
        extent: ExtentKey,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        self.mutate_extents(batch, base, ino, ts, |inode| {
            let garbage = inode.extents.append(extent);
            inode.size = inode.size.max(extent.end());
            Ok(garbage)
        })
    }

    fn extent_insert(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
        extents: &[ExtentKey],
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        let extents = extents.to_vec();
        self.mutate_extents(batch, base, ino, ts, move |inode| {
            let mut garbage = Vec::new();
            for ek in &extents {
                garbage.extend(inode.extents.insert(*ek));
            }
            inode.size = inode.size.max(inode.extents.covered_size());
            Ok(garbage)
        })
    }

    fn extent_truncate(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
        size: u64,
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        self.mutate_extents(batch, base, ino, ts, move |inode| {
            let garbage = inode.extents.truncate(size);
            inode.size = size;
            Ok(garbage)
        })
    }

    fn extents_merge(
        &self,
        batch: &mut WriteBatch,
        ino: InodeId,
        old: &[ExtentKey],
        new: &[ExtentKey],
        ts: u64,
    ) -> Result<ApplyResult, MetaError> {
        if !self.range.contains(ino.as_u64()) {
            return Ok(ApplyResult::of(Status::OutOfRange));
        }
        let Some(mut inode) = self.read_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if inode.is_delete_marked() {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        let Ok(evicted) = inode.extents.merge(old, new) else {
            // The client merged against a stale extent view.
            return Ok(ApplyResult::of(Status::Again));
        };
        inode.mtime = ts;
        inode.generation += 1;
        self.put_inode(batch, &inode)?;
        // The replaced extents were copied into the merged one; their
        // storage is garbage along with anything the insert evicted.
        let mut garbage = old.to_vec();
        garbage.extend(evicted);
        if !garbage.is_empty() {
            delete_wal::stage_delete_extents(
                self.backend.as_ref(),
                batch,
                pack_date(ts),
                &garbage,
            )?;
        }
        Ok(ApplyResult::ok().with_inode(inode))
    }

    fn mutate_extents<F>(
        &self,
        batch: &mut WriteBatch,
        base: &mut BaseInfo,
        ino: InodeId,
        ts: u64,
        f: F,
    ) -> Result<ApplyResult, MetaError>
    where
        F: FnOnce(&mut Inode) -> Result<Vec<ExtentKey>, MetaError>,
    {
        if !self.range.contains(ino.as_u64()) {
            return Ok(ApplyResult::of(Status::OutOfRange));
        }
        let Some(mut inode) = self.read_inode(batch, ino)? else {
            return Ok(ApplyResult::of(Status::NotExist));
        };
        if inode.is_delete_marked() {
            return Ok(ApplyResult::of(Status::NotExist));
        }
        let old_size = inode.size;
        let garbage = f(&mut inode)?;
        inode.mtime = ts;
        inode.generation += 1;
        self.put_inode(batch, &inode)?;
        base.live_size = base
            .live_size
            .saturating_sub(old_size)
            .saturating_add(inode.size);
        if !garbage.is_empty() {
            delete_wal::stage_delete_extents(
                self.backend.as_ref(),
                batch,
                pack_date(ts),
                &garbage,
            )?;
        }
        Ok(ApplyResult::ok().with_inode(inode))
    }

    // ---- shared lookups -------------------------------------------------

    fn read_inode(&self, batch: &WriteBatch, ino: InodeId) -> Result<Option<Inode>, MetaError> {
        let key = ino.as_u64().to_be_bytes();
        match lookup_through(self.backend.as_ref(), batch, TreeTag::Inode, &key)? {
            Some(buf) => Ok(Some(Inode::decode(&buf)?)),
            None => Ok(None),
        }
    }

    fn read_deleted_inode(
        &self,
        batch: &WriteBatch,
        ino: InodeId,
    ) -> Result<Option<DeletedInode>, MetaError> {
        let key = ino.as_u64().to_be_bytes();
        match lookup_through(self.backend.as_ref(), batch, TreeTag::DeletedInode, &key)? {
            Some(buf) => Ok(Some(DeletedInode::decode(&buf)?)),
            None => Ok(None),
        }
    }

    fn read_extend(&self, batch: &WriteBatch, ino: InodeId) -> Result<Option<Extend>, MetaError> {
        let key = ino.as_u64().to_be_bytes();
        match lookup_through(self.backend.as_ref(), batch, TreeTag::Extend, &key)? {
            Some(buf) => Ok(Some(Extend::decode(&buf)?)),
            None => Ok(None),
        }
    }

    fn put_inode(&self, batch: &mut WriteBatch, inode: &Inode) -> Result<(), MetaError> {
        self.backend
            .put(batch, TreeTag::Inode, inode.key(), inode.encode(), true)?;
        Ok(())
    }

    fn has_live_children(&self, parent: InodeId) -> Result<bool, MetaError> {
        let (start, end) = dentry::dentry_parent_range(parent);
        let mut found = false;
        self.backend
            .range(TreeTag::Dentry, &start, Some(&end), &mut |_, _| {
                found = true;
                Ok(false)
            })?;
        Ok(found)
    }

    fn has_trash_children(&self, parent: InodeId) -> Result<bool, MetaError> {
        let (start, end) = dentry::deleted_dentry_parent_range(parent);
        let mut found = false;
        self.backend
            .range(TreeTag::DeletedDentry, &start, Some(&end), &mut |_, _| {
                found = true;
                Ok(false)
            })?;
        Ok(found)
    }

    fn max_inode_id(&self) -> Result<u64, MetaError> {
        match self.backend.max_key(TreeTag::Inode)? {
            Some(key) if key.len() == 8 => {
                Ok(u64::from_be_bytes(key.as_slice().try_into().unwrap()))
            }
            _ => Ok(0),
        }
    }

    /// Re-reads the entity a command targets, so a dedup hit can answer
    /// with current data instead of the stale first response.
    pub fn refresh_target(&self, cmd: &MetaCommand) -> Result<Option<Inode>, MetaError> {
        let ino = match cmd {
            MetaCommand::CreateInodeLink { ino, .. }
            | MetaCommand::UnlinkInode { ino, .. }
            | MetaCommand::SetAttr { ino, .. }
            | MetaCommand::ExtentAppend { ino, .. }
            | MetaCommand::ExtentInsert { ino, .. }
            | MetaCommand::ExtentTruncate { ino, .. }
            | MetaCommand::ExtentsMerge { ino, .. } => *ino,
            _ => return Ok(None),
        };
        let batch = WriteBatch::new();
        self.read_inode(&batch, ino)
    }
}

/// First-occurrence de-duplication preserving order; repeated IDs in one
/// batch command must not double-apply.
fn dedup_inos(inos: &[InodeId]) -> Vec<InodeId> {
    let mut seen = std::collections::HashSet::new();
    inos.iter().copied().filter(|i| seen.insert(*i)).collect()
}

fn command_ts_ms(cmd: &MetaCommand) -> u64 {
    let ts = match cmd {
        MetaCommand::CreateInode { ts, .. }
        | MetaCommand::CreateInodeLink { ts, .. }
        | MetaCommand::UnlinkInode { ts, .. }
        | MetaCommand::UnlinkInodeBatch { ts, .. }
        | MetaCommand::DeleteInode { ts, .. }
        | MetaCommand::DeleteInodeBatch { ts, .. }
        | MetaCommand::SetAttr { ts, .. }
        | MetaCommand::CreateDentry { ts, .. }
        | MetaCommand::DeleteDentry { ts, .. }
        | MetaCommand::BatchDeleteDentry { ts, .. }
        | MetaCommand::UpdateDentry { ts, .. }
        | MetaCommand::CreateMultipart { ts, .. }
        | MetaCommand::ExtentAppend { ts, .. }
        | MetaCommand::ExtentInsert { ts, .. }
        | MetaCommand::ExtentTruncate { ts, .. }
        | MetaCommand::ExtentsMerge { ts, .. } => *ts,
        _ => 0,
    };
    ts * 1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CursorMode;
    use crate::memdb::MemBackend;

    const TS: u64 = 1_700_000_000;

    struct Harness {
        applier: Applier,
        next_index: u64,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_range(1, 1_000)
        }

        fn with_range(start: u64, end: u64) -> Self {
            let backend: Arc<dyn MetaBackend> = Arc::new(MemBackend::new());
            let cfg = ApplierConfig {
                cursor_min_headroom: 100,
                ..ApplierConfig::default()
            };
            let applier = Applier::new(
                backend,
                InodeRange::new(start, end),
                cfg,
                Arc::new(FreeList::new(1024)),
                None,
            );
            Self {
                applier,
                next_index: 0,
            }
        }

        fn apply(&mut self, cmd: MetaCommand) -> ApplyResult {
            self.apply_env(CommandEnvelope::internal("127.0.0.1:9021", cmd))
        }

        fn apply_env(&mut self, env: CommandEnvelope) -> ApplyResult {
            self.next_index += 1;
            self.applier.apply(&env, self.next_index).unwrap()
        }

        fn create_file(&mut self) -> Inode {
            let res = self.apply(MetaCommand::CreateInode {
                mode: 0o100644,
                uid: 0,
                gid: 0,
                target: vec![],
                ts: TS,
            });
            assert_eq!(res.status, Status::Ok);
            res.inode.unwrap()
        }

        fn create_dir(&mut self) -> Inode {
            let res = self.apply(MetaCommand::CreateInode {
                mode: 0o040755,
                uid: 0,
                gid: 0,
                target: vec![],
                ts: TS,
            });
            assert_eq!(res.status, Status::Ok);
            res.inode.unwrap()
        }

        fn base(&self) -> BaseInfo {
            self.applier.backend().base_info().unwrap()
        }

        fn len(&self, tag: TreeTag) -> u64 {
            self.applier.backend().len(tag).unwrap()
        }
    }

    #[test]
    fn test_create_unlink_evict_clean_lifecycle() {
        let mut h = Harness::new();
        let inode = h.create_file();
        assert_eq!(inode.ino.as_u64(), 1);
        assert_eq!(h.len(TreeTag::Inode), 1);

        let res = h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS + 1,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(h.len(TreeTag::Inode), 0);
        assert_eq!(h.len(TreeTag::DeletedInode), 1);
        assert!(!h.applier.free_list().contains(inode.ino));

        let res = h.apply(MetaCommand::EvictInode { ino: inode.ino });
        assert_eq!(res.status, Status::Ok);
        assert!(h.applier.free_list().contains(inode.ino));

        let res = h.apply(MetaCommand::InternalCleanDeletedInode {
            inos: vec![inode.ino],
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(h.len(TreeTag::DeletedInode), 0);
    }

    #[test]
    fn test_applied_index_increments_every_command() {
        let mut h = Harness::new();
        h.create_file();
        assert_eq!(h.base().applied_index, 1);
        h.apply(MetaCommand::EvictInode {
            ino: InodeId::new(99),
        });
        // Logical failure still consumed an index.
        assert_eq!(h.base().applied_index, 2);
    }

    #[test]
    fn test_create_inode_allocates_sequential_ids() {
        let mut h = Harness::new();
        assert_eq!(h.create_file().ino.as_u64(), 1);
        assert_eq!(h.create_file().ino.as_u64(), 2);
        assert_eq!(h.base().cursor, 2);
    }

    #[test]
    fn test_create_inode_full_at_range_end() {
        let mut h = Harness::with_range(1, 2);
        h.create_file();
        h.create_file();
        let res = h.apply(MetaCommand::CreateInode {
            mode: 0o100644,
            uid: 0,
            gid: 0,
            target: vec![],
            ts: TS,
        });
        assert_eq!(res.status, Status::InodeFull);
    }

    #[test]
    fn test_unlink_directory_with_children_fails_exists() {
        let mut h = Harness::new();
        let dir = h.create_dir();
        let child = h.create_file();
        let res = h.apply(MetaCommand::CreateDentry {
            dentry: Dentry {
                parent: dir.ino,
                name: "a".to_string(),
                ino: child.ino,
                dtype: 0o100000,
            },
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);

        let res = h.apply(MetaCommand::UnlinkInode {
            ino: dir.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::Exists);

        let res = h.apply(MetaCommand::DeleteDentry {
            parent: dir.ino,
            name: "a".to_string(),
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.value, Some(child.ino.as_u64()));
        let res = h.apply(MetaCommand::UnlinkInode {
            ino: child.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
        let res = h.apply(MetaCommand::UnlinkInode {
            ino: dir.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
    }

    #[test]
    fn test_unlink_deleted_inode_returns_not_exist() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        let res = h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::NotExist);
    }

    #[test]
    fn test_unlink_out_of_range() {
        let mut h = Harness::with_range(1, 10);
        let res = h.apply(MetaCommand::UnlinkInode {
            ino: InodeId::new(11),
            ts: TS,
        });
        assert_eq!(res.status, Status::OutOfRange);
    }

    #[test]
    fn test_unlink_multi_link_file_survives() {
        let mut h = Harness::new();
        let inode = h.create_file();
        let res = h.apply(MetaCommand::CreateInodeLink { ino: inode.ino, ts: TS });
        assert_eq!(res.inode.unwrap().nlink, 2);
        let res = h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.inode.unwrap().nlink, 1);
        assert_eq!(h.len(TreeTag::DeletedInode), 0);
    }

    #[test]
    fn test_evict_is_idempotent() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        assert_eq!(
            h.apply(MetaCommand::EvictInode { ino: inode.ino }).status,
            Status::Ok
        );
        assert_eq!(
            h.apply(MetaCommand::EvictInode { ino: inode.ino }).status,
            Status::Ok
        );
        assert_eq!(h.applier.free_list().len(), 1);
    }

    #[test]
    fn test_recover_deleted_inode_restores_links() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        let res = h.apply(MetaCommand::RecoverDeletedInode { ino: inode.ino });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.inode.unwrap().nlink, 1);
        assert_eq!(h.len(TreeTag::Inode), 1);
        assert_eq!(h.len(TreeTag::DeletedInode), 0);
    }

    #[test]
    fn test_recover_when_live_exists_drops_trash() {
        let mut h = Harness::new();
        let inode = h.create_file();
        // Plant a stale trash copy of the live inode, as a lagging replica
        // replaying an old unlink would hold.
        let backend = h.applier.backend().clone();
        let mut batch = backend.begin();
        let stale = DeletedInode::from_inode(inode.clone(), TS);
        backend
            .put(
                &mut batch,
                TreeTag::DeletedInode,
                stale.key(),
                stale.encode(),
                true,
            )
            .unwrap();
        let mut base = backend.base_info().unwrap();
        for (i, d) in batch.count_deltas.iter().enumerate() {
            base.counts[i] = (base.counts[i] as i64 + d) as u64;
        }
        backend.commit(batch, &base).unwrap();

        let res = h.apply(MetaCommand::RecoverDeletedInode { ino: inode.ino });
        // The live inode wins; the trash entry is simply dropped.
        assert_eq!(res.status, Status::Ok);
        assert!(!res.inode.unwrap().is_delete_marked());
        assert_eq!(h.len(TreeTag::DeletedInode), 0);
        assert_eq!(h.len(TreeTag::Inode), 1);
    }

    #[test]
    fn test_clean_deleted_inode_blocked_by_trash_children() {
        let mut h = Harness::new();
        let dir = h.create_dir();
        let child = h.create_file();
        h.apply(MetaCommand::CreateDentry {
            dentry: Dentry {
                parent: dir.ino,
                name: "a".to_string(),
                ino: child.ino,
                dtype: 0o100000,
            },
            ts: TS,
        });
        h.apply(MetaCommand::DeleteDentry {
            parent: dir.ino,
            name: "a".to_string(),
            ts: TS,
        });
        h.apply(MetaCommand::UnlinkInode {
            ino: dir.ino,
            ts: TS,
        });

        // The dentry copy for (dir, "a") still sits in trash.
        let res = h.apply(MetaCommand::CleanDeletedInode { ino: dir.ino });
        assert_eq!(res.status, Status::Exists);
        assert!(!h.applier.free_list().contains(dir.ino));

        let res = h.apply(MetaCommand::CleanDeletedDentry {
            parent: dir.ino,
            name: "a".to_string(),
            timestamp: TS,
            ino: child.ino,
        });
        assert_eq!(res.status, Status::Ok);
        let res = h.apply(MetaCommand::CleanDeletedInode { ino: dir.ino });
        assert_eq!(res.status, Status::Ok);
        assert!(h.applier.free_list().contains(dir.ino));
    }

    #[test]
    fn test_clean_expired_respects_deadline() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        // Deadline before the deletion: nothing expires.
        h.apply(MetaCommand::CleanExpiredInode {
            ino: inode.ino,
            deadline: TS - 1,
        });
        assert!(h.applier.free_list().is_empty());
        h.apply(MetaCommand::CleanExpiredInode {
            ino: inode.ino,
            deadline: TS,
        });
        assert!(h.applier.free_list().contains(inode.ino));
    }

    #[test]
    fn test_aggregate_size_tracking() {
        let mut h = Harness::new();
        let inode = h.create_file();
        let ek = ExtentKey {
            file_offset: 0,
            partition_id: 3,
            extent_id: 7,
            extent_offset: 0,
            size: 4_096,
            crc: 0,
        };
        h.apply(MetaCommand::ExtentAppend {
            ino: inode.ino,
            extent: ek,
            ts: TS,
        });
        assert_eq!(h.base().live_size, 4_096);

        h.apply(MetaCommand::UnlinkInode {
            ino: inode.ino,
            ts: TS,
        });
        assert_eq!(h.base().live_size, 0);
        assert_eq!(h.base().deleted_size, 4_096);

        h.apply(MetaCommand::InternalCleanDeletedInode {
            inos: vec![inode.ino],
        });
        assert_eq!(h.base().deleted_size, 0);
    }

    #[test]
    fn test_set_attr_patches_fields() {
        let mut h = Harness::new();
        let inode = h.create_file();
        let res = h.apply(MetaCommand::SetAttr {
            ino: inode.ino,
            patch: AttrPatch {
                mode: Some(0o600),
                uid: Some(42),
                gid: None,
                atime: None,
                mtime: Some(TS + 5),
            },
            ts: TS + 5,
        });
        let got = res.inode.unwrap();
        assert_eq!(got.mode, 0o100600);
        assert_eq!(got.uid, 42);
        assert_eq!(got.gid, 0);
        assert_eq!(got.mtime, TS + 5);
        assert_eq!(got.ctime, TS + 5);
    }

    #[test]
    fn test_cursor_reset_boundaries() {
        let mut h = Harness::with_range(1, 1_000);
        h.create_file();
        // Sub on a writable partition: operation mismatch.
        let res = h.apply(MetaCommand::CursorReset {
            mode: CursorMode::Sub,
            new_cursor: 500,
        });
        assert_eq!(res.status, Status::AccessDenied);
        // Freeze.
        let res = h.apply(MetaCommand::CursorReset {
            mode: CursorMode::Add,
            new_cursor: 0,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.value, Some(1_000));
        // Sub below the maximum live inode.
        let res = h.apply(MetaCommand::CursorReset {
            mode: CursorMode::Sub,
            new_cursor: 1,
        });
        assert_eq!(res.status, Status::OutOfRange);
        // Valid Sub.
        let res = h.apply(MetaCommand::CursorReset {
            mode: CursorMode::Sub,
            new_cursor: 2,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(h.base().cursor, 2);
    }

    #[test]
    fn test_create_dentry_duplicate() {
        let mut h = Harness::new();
        let dir = h.create_dir();
        let a = h.create_file();
        let b = h.create_file();
        let d = Dentry {
            parent: dir.ino,
            name: "x".to_string(),
            ino: a.ino,
            dtype: 0o100000,
        };
        assert_eq!(
            h.apply(MetaCommand::CreateDentry {
                dentry: d.clone(),
                ts: TS
            })
            .status,
            Status::Ok
        );
        // Same mapping again: idempotent.
        assert_eq!(
            h.apply(MetaCommand::CreateDentry {
                dentry: d.clone(),
                ts: TS
            })
            .status,
            Status::Ok
        );
        // Different child under the same name: collision.
        let mut other = d;
        other.ino = b.ino;
        assert_eq!(
            h.apply(MetaCommand::CreateDentry {
                dentry: other,
                ts: TS
            })
            .status,
            Status::Exists
        );
    }

    #[test]
    fn test_subdirectory_bumps_parent_nlink() {
        let mut h = Harness::new();
        let parent = h.create_dir();
        let sub = h.create_dir();
        h.apply(MetaCommand::CreateDentry {
            dentry: Dentry {
                parent: parent.ino,
                name: "sub".to_string(),
                ino: sub.ino,
                dtype: 0o040000,
            },
            ts: TS,
        });
        let got = h
            .apply(MetaCommand::SetAttr {
                ino: parent.ino,
                patch: AttrPatch::default(),
                ts: TS,
            })
            .inode
            .unwrap();
        assert_eq!(got.nlink, 3);

        h.apply(MetaCommand::DeleteDentry {
            parent: parent.ino,
            name: "sub".to_string(),
            ts: TS,
        });
        let got = h
            .apply(MetaCommand::SetAttr {
                ino: parent.ino,
                patch: AttrPatch::default(),
                ts: TS,
            })
            .inode
            .unwrap();
        assert_eq!(got.nlink, 2);
    }

    #[test]
    fn test_update_dentry_returns_old_child() {
        let mut h = Harness::new();
        let dir = h.create_dir();
        let a = h.create_file();
        let b = h.create_file();
        h.apply(MetaCommand::CreateDentry {
            dentry: Dentry {
                parent: dir.ino,
                name: "x".to_string(),
                ino: a.ino,
                dtype: 0o100000,
            },
            ts: TS,
        });
        let res = h.apply(MetaCommand::UpdateDentry {
            parent: dir.ino,
            name: "x".to_string(),
            ino: b.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(res.value, Some(a.ino.as_u64()));
    }

    #[test]
    fn test_recover_deleted_dentry() {
        let mut h = Harness::new();
        let dir = h.create_dir();
        let file = h.create_file();
        h.apply(MetaCommand::CreateDentry {
            dentry: Dentry {
                parent: dir.ino,
                name: "x".to_string(),
                ino: file.ino,
                dtype: 0o100000,
            },
            ts: TS,
        });
        h.apply(MetaCommand::DeleteDentry {
            parent: dir.ino,
            name: "x".to_string(),
            ts: TS + 1,
        });
        assert_eq!(h.len(TreeTag::Dentry), 0);
        assert_eq!(h.len(TreeTag::DeletedDentry), 1);

        let res = h.apply(MetaCommand::RecoverDeletedDentry {
            parent: dir.ino,
            name: "x".to_string(),
            timestamp: TS + 1,
            ino: file.ino,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(h.len(TreeTag::Dentry), 1);
        assert_eq!(h.len(TreeTag::DeletedDentry), 0);
    }

    #[test]
    fn test_xattr_set_get_remove() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::SetXAttr {
            ino: inode.ino,
            key: "user.tag".to_string(),
            value: b"blue".to_vec(),
        });
        assert_eq!(h.len(TreeTag::Extend), 1);
        h.apply(MetaCommand::RemoveXAttr {
            ino: inode.ino,
            key: "user.tag".to_string(),
        });
        // Empty attribute sets are dropped from the tree.
        assert_eq!(h.len(TreeTag::Extend), 0);
    }

    #[test]
    fn test_multipart_lifecycle() {
        let mut h = Harness::new();
        let create = MetaCommand::CreateMultipart {
            object_key: "bucket/obj".to_string(),
            upload_id: "u1".to_string(),
            ts: TS,
            metadata: vec![("content-type".to_string(), "text/plain".to_string())],
        };
        assert_eq!(h.apply(create.clone()).status, Status::Ok);
        assert_eq!(h.apply(create).status, Status::Exists);

        let part = Part {
            id: 1,
            ino: 9,
            size: 128,
            upload_ts: TS,
            crc: 0,
        };
        let append = MetaCommand::AppendMultipart {
            object_key: "bucket/obj".to_string(),
            upload_id: "u1".to_string(),
            part,
        };
        assert_eq!(h.apply(append.clone()).status, Status::Ok);
        assert_eq!(h.apply(append).status, Status::Exists);

        assert_eq!(
            h.apply(MetaCommand::RemoveMultipart {
                object_key: "bucket/obj".to_string(),
                upload_id: "u1".to_string(),
            })
            .status,
            Status::Ok
        );
        assert_eq!(
            h.apply(MetaCommand::RemoveMultipart {
                object_key: "bucket/obj".to_string(),
                upload_id: "u1".to_string(),
            })
            .status,
            Status::NotExist
        );
    }

    #[test]
    fn test_truncate_stages_garbage_extents() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::ExtentAppend {
            ino: inode.ino,
            extent: ExtentKey {
                file_offset: 0,
                partition_id: 3,
                extent_id: 7,
                extent_offset: 0,
                size: 4_096,
                crc: 0,
            },
            ts: TS,
        });
        h.apply(MetaCommand::ExtentTruncate {
            ino: inode.ino,
            size: 0,
            ts: TS,
        });
        assert_eq!(h.len(TreeTag::ExtentDel), 1);
        assert_eq!(h.base().live_size, 0);
    }

    #[test]
    fn test_extents_merge_stale_view_returns_again() {
        let mut h = Harness::new();
        let inode = h.create_file();
        let res = h.apply(MetaCommand::ExtentsMerge {
            ino: inode.ino,
            old: vec![ExtentKey {
                file_offset: 0,
                partition_id: 1,
                extent_id: 1,
                extent_offset: 0,
                size: 10,
                crc: 0,
            }],
            new: vec![],
            ts: TS,
        });
        assert_eq!(res.status, Status::Again);
    }

    #[test]
    fn test_sync_del_extents_rotates_followers() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::ExtentAppend {
            ino: inode.ino,
            extent: ExtentKey {
                file_offset: 0,
                partition_id: 3,
                extent_id: 7,
                extent_offset: 0,
                size: 64,
                crc: 0,
            },
            ts: TS,
        });
        h.apply(MetaCommand::ExtentTruncate {
            ino: inode.ino,
            size: 0,
            ts: TS,
        });
        assert_eq!(h.len(TreeTag::ExtentDel), 1);

        let cursor = pack_date(TS + 86_400);
        assert_eq!(
            h.apply(MetaCommand::SyncDelExtents { cursor }).status,
            Status::Ok
        );
        assert_eq!(h.base().del_cursor, cursor);
        // V1 moves the cursor only; V2 rotates the records out.
        assert_eq!(h.len(TreeTag::ExtentDel), 1);
        assert_eq!(
            h.apply(MetaCommand::SyncDelExtentsV2 {
                cursor,
                keys: vec![],
            })
            .status,
            Status::Ok
        );
        assert_eq!(h.len(TreeTag::ExtentDel), 0);
    }

    #[test]
    fn test_dedup_replay_returns_original_status() {
        let mut h = Harness::new();
        let fp = crate::dedup::RequestFingerprint {
            client_id: 7,
            client_start: 1,
            request_id: 1,
            client_ip: 0,
            payload_crc: 0,
        };
        let env = CommandEnvelope {
            from: "c".to_string(),
            command: MetaCommand::CreateInode {
                mode: 0o100644,
                uid: 0,
                gid: 0,
                target: vec![],
                ts: TS,
            },
            fingerprint: Some(fp),
        };
        let first = h.apply_env(env.clone());
        assert_eq!(first.status, Status::Ok);
        let replay = h.apply_env(env);
        assert_eq!(replay.status, Status::Ok);
        // Replay allocated nothing.
        assert_eq!(h.len(TreeTag::Inode), 1);
        assert_eq!(h.base().cursor, 1);
        // But it still consumed an applied index.
        assert_eq!(h.base().applied_index, 2);
    }

    #[test]
    fn test_batch_unlink_deduplicates_ids() {
        let mut h = Harness::new();
        let inode = h.create_file();
        let res = h.apply(MetaCommand::UnlinkInodeBatch {
            inos: vec![inode.ino, inode.ino],
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(h.len(TreeTag::DeletedInode), 1);
    }

    #[test]
    fn test_delete_inode_bypasses_trash_and_stages_extents() {
        let mut h = Harness::new();
        let inode = h.create_file();
        h.apply(MetaCommand::ExtentAppend {
            ino: inode.ino,
            extent: ExtentKey {
                file_offset: 0,
                partition_id: 3,
                extent_id: 9,
                extent_offset: 0,
                size: 100,
                crc: 0,
            },
            ts: TS,
        });
        let res = h.apply(MetaCommand::DeleteInode {
            ino: inode.ino,
            ts: TS,
        });
        assert_eq!(res.status, Status::Ok);
        assert_eq!(h.len(TreeTag::Inode), 0);
        assert_eq!(h.len(TreeTag::DeletedInode), 0);
        assert_eq!(h.len(TreeTag::ExtentDel), 1);
    }
}
