//! Inode and deleted-inode entities with their canonical binary layout.
//!
//! The encoding is the stable wire form used by raft snapshots and the
//! extent-delete journal, so the layout is fixed: big-endian integers,
//! `[u32 key-len][u64 ino][u32 val-len][value]` with the value holding
//! mode, ownership, size, generation, timestamps, symlink target, link
//! count, flags, a reserved word, and the sorted extent list.

use crate::extent::{ExtentKey, SortedExtents};
use crate::types::{is_dir_mode, FileType, InodeId, MetaError};

/// Flag bit marking an inode as deleted (moved to trash).
pub const FLAG_DELETE_MARK: u32 = 1;

/// Byte offset of the access-time field within a full encoded inode record.
const ATIME_OFFSET: usize = 52;

/// A live file, directory, or symlink.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Inode {
    /// Inode number, unique within the volume.
    pub ino: InodeId,
    /// Full mode word: S_IFMT file type bits plus permissions.
    pub mode: u32,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Declared file size in bytes.
    pub size: u64,
    /// Generation counter, bumped on reuse of the inode number.
    pub generation: u64,
    /// Change time (unix seconds).
    pub ctime: u64,
    /// Access time (unix seconds). Not replicated deterministically.
    pub atime: u64,
    /// Modification time (unix seconds).
    pub mtime: u64,
    /// Symlink target, empty for non-symlinks.
    pub link_target: Vec<u8>,
    /// Hard link count.
    pub nlink: u32,
    /// Flag bits; bit 0 is the delete mark.
    pub flag: u32,
    /// Reserved for future layout revisions.
    pub reserved: u64,
    /// Sorted, non-overlapping extent list.
    pub extents: SortedExtents,
}

impl Inode {
    /// Creates a new inode. Directories start with two links, everything
    /// else with one.
    pub fn new(ino: InodeId, mode: u32, uid: u32, gid: u32, create_ts: u64) -> Self {
        let nlink = if is_dir_mode(mode) { 2 } else { 1 };
        Self {
            ino,
            mode,
            uid,
            gid,
            size: 0,
            generation: 1,
            ctime: create_ts,
            atime: create_ts,
            mtime: create_ts,
            link_target: Vec::new(),
            nlink,
            flag: 0,
            reserved: 0,
            extents: SortedExtents::new(),
        }
    }

    /// File type derived from the mode word.
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Returns true if this inode is a directory.
    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }

    /// Returns true if the delete mark is set.
    pub fn is_delete_marked(&self) -> bool {
        self.flag & FLAG_DELETE_MARK != 0
    }

    /// Sets the delete mark.
    pub fn set_delete_mark(&mut self) {
        self.flag |= FLAG_DELETE_MARK;
    }

    /// The 8-byte big-endian tree key for this inode.
    pub fn key(&self) -> Vec<u8> {
        self.ino.as_u64().to_be_bytes().to_vec()
    }

    /// Encodes the full canonical record.
    pub fn encode(&self) -> Vec<u8> {
        let mut val = Vec::with_capacity(64 + self.extents.len() * ExtentKey::ENCODED_LEN);
        val.extend_from_slice(&self.mode.to_be_bytes());
        val.extend_from_slice(&self.uid.to_be_bytes());
        val.extend_from_slice(&self.gid.to_be_bytes());
        val.extend_from_slice(&self.size.to_be_bytes());
        val.extend_from_slice(&self.generation.to_be_bytes());
        val.extend_from_slice(&self.ctime.to_be_bytes());
        val.extend_from_slice(&self.atime.to_be_bytes());
        val.extend_from_slice(&self.mtime.to_be_bytes());
        val.extend_from_slice(&(self.link_target.len() as u32).to_be_bytes());
        val.extend_from_slice(&self.link_target);
        val.extend_from_slice(&self.nlink.to_be_bytes());
        val.extend_from_slice(&self.flag.to_be_bytes());
        val.extend_from_slice(&self.reserved.to_be_bytes());
        self.extents.encode_to(&mut val);

        let mut buf = Vec::with_capacity(16 + val.len());
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&self.ino.as_u64().to_be_bytes());
        buf.extend_from_slice(&(val.len() as u32).to_be_bytes());
        buf.extend_from_slice(&val);
        buf
    }

    /// Decodes a full canonical record, returning the inode and the number
    /// of bytes consumed.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), MetaError> {
        let need = |n: usize, at: usize| -> Result<(), MetaError> {
            if buf.len() < at + n {
                Err(MetaError::Codec("inode record truncated".to_string()))
            } else {
                Ok(())
            }
        };
        need(16, 0)?;
        let key_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if key_len != 8 {
            return Err(MetaError::Codec(format!("bad inode key length {}", key_len)));
        }
        let ino = InodeId::new(u64::from_be_bytes(buf[4..12].try_into().unwrap()));
        let val_len = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
        need(val_len, 16)?;
        let val = &buf[16..16 + val_len];
        if val.len() < 56 {
            return Err(MetaError::Codec("inode value truncated".to_string()));
        }
        let u32_at = |off: usize| u32::from_be_bytes(val[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_be_bytes(val[off..off + 8].try_into().unwrap());
        let mode = u32_at(0);
        let uid = u32_at(4);
        let gid = u32_at(8);
        let size = u64_at(12);
        let generation = u64_at(20);
        let ctime = u64_at(28);
        let atime = u64_at(36);
        let mtime = u64_at(44);
        let link_len = u32_at(52) as usize;
        let mut off = 56;
        if val.len() < off + link_len + 16 {
            return Err(MetaError::Codec("inode symlink truncated".to_string()));
        }
        let link_target = val[off..off + link_len].to_vec();
        off += link_len;
        let nlink = u32_at(off);
        let flag = u32_at(off + 4);
        let reserved = u64_at(off + 8);
        off += 16;
        let extents = SortedExtents::decode(&val[off..])?;
        Ok((
            Self {
                ino,
                mode,
                uid,
                gid,
                size,
                generation,
                ctime,
                atime,
                mtime,
                link_target,
                nlink,
                flag,
                reserved,
                extents,
            },
            16 + val_len,
        ))
    }

    /// Decodes a record that must span the whole buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        let (inode, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(MetaError::Codec(format!(
                "inode record has {} trailing bytes",
                buf.len() - used
            )));
        }
        Ok(inode)
    }
}

/// Zeroes the access-time field inside an encoded inode record.
///
/// Access time is not replicated deterministically, so every cross-replica
/// hash over inode payloads must run on a buffer normalized by this.
pub fn zero_atime(record: &mut [u8]) {
    if record.len() >= ATIME_OFFSET + 8 {
        record[ATIME_OFFSET..ATIME_OFFSET + 8].fill(0);
    }
}

/// A trash-tier inode: the original payload plus deletion bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeletedInode {
    /// The inode as it was at deletion time.
    pub inode: Inode,
    /// Deletion timestamp (unix seconds), supplied by the proposing leader.
    pub delete_ts: u64,
    /// True once extent reclamation has been initiated; the entry may be
    /// physically removed after data-node acknowledgement.
    pub is_expired: bool,
}

impl DeletedInode {
    /// Moves a live inode into the trash tier.
    pub fn from_inode(mut inode: Inode, delete_ts: u64) -> Self {
        inode.set_delete_mark();
        inode.nlink = 0;
        Self {
            inode,
            delete_ts,
            is_expired: false,
        }
    }

    /// The tree key (same 8-byte big-endian inode number as the live tree).
    pub fn key(&self) -> Vec<u8> {
        self.inode.key()
    }

    /// Restores the trashed inode to its live form.
    ///
    /// Directories come back with at least two links; files regain one.
    pub fn recover(&self) -> Inode {
        let mut inode = self.inode.clone();
        inode.flag &= !FLAG_DELETE_MARK;
        if inode.is_dir() {
            inode.nlink = inode.nlink.max(2);
        } else {
            inode.nlink += 1;
        }
        inode
    }

    /// Encodes the canonical record: the inode record followed by the
    /// deletion timestamp and the expired flag.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.inode.encode();
        buf.extend_from_slice(&self.delete_ts.to_be_bytes());
        buf.push(self.is_expired as u8);
        buf
    }

    /// Decodes a canonical deleted-inode record.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        let (inode, used) = Inode::decode_prefix(buf)?;
        if buf.len() != used + 9 {
            return Err(MetaError::Codec(
                "deleted-inode trailer truncated".to_string(),
            ));
        }
        let delete_ts = u64::from_be_bytes(buf[used..used + 8].try_into().unwrap());
        let is_expired = buf[used + 8] != 0;
        Ok(Self {
            inode,
            delete_ts,
            is_expired,
        })
    }
}
