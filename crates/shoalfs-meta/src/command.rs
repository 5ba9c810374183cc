//! The replicated command set and its wire envelope.
//!
//! Every mutation travels through raft as `[opcode][remote addr][payload]
//! [optional fingerprint]`. Payloads are bincode; bincode is byte-stable
//! for a fixed struct layout, which the apply pipeline relies on.
//! Timestamps that end up in entity values are supplied here by the
//! proposing leader, never read from the clock during apply.

use serde::{Deserialize, Serialize};

use crate::dedup::RequestFingerprint;
use crate::dentry::Dentry;
use crate::extent::ExtentKey;
use crate::multipart::Part;
use crate::types::{InodeId, MetaError};

/// Cursor-reset direction; the guard rules live in the applier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorMode {
    /// Lower the cursor toward the current maximum inode; requires a
    /// read-only partition with reclaimable headroom.
    Sub,
    /// Raise the cursor to the end of the range, freezing the partition.
    Add,
}

/// Partial attribute update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrPatch {
    /// New permission bits (S_IFMT bits are preserved).
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New access time.
    pub atime: Option<u64>,
    /// New modification time.
    pub mtime: Option<u64>,
}

/// A command applied identically on every replica of a partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetaCommand {
    /// Allocate an inode from the cursor and insert it live.
    CreateInode {
        /// Full mode word.
        mode: u32,
        /// Owner user ID.
        uid: u32,
        /// Owner group ID.
        gid: u32,
        /// Symlink target; empty for non-symlinks.
        target: Vec<u8>,
        /// Creation timestamp (unix seconds).
        ts: u64,
    },
    /// Add one hard link to a live inode.
    CreateInodeLink {
        /// Target inode.
        ino: InodeId,
        /// Change timestamp.
        ts: u64,
    },
    /// Drop one link; at zero the inode moves to the trash tier.
    UnlinkInode {
        /// Target inode.
        ino: InodeId,
        /// Deletion timestamp.
        ts: u64,
    },
    /// Unlink a batch of inodes.
    UnlinkInodeBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
        /// Deletion timestamp.
        ts: u64,
    },
    /// Mark a trash inode expired and queue it for reclamation.
    EvictInode {
        /// Target inode.
        ino: InodeId,
    },
    /// Evict a batch of trash inodes.
    EvictInodeBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
    },
    /// Physically remove a live inode, bypassing the trash tier.
    DeleteInode {
        /// Target inode.
        ino: InodeId,
        /// Deletion timestamp (dates the garbage extents).
        ts: u64,
    },
    /// Physically remove a batch of live inodes.
    DeleteInodeBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
        /// Deletion timestamp.
        ts: u64,
    },
    /// Apply an attribute patch to a live inode.
    SetAttr {
        /// Target inode.
        ino: InodeId,
        /// Fields to change.
        patch: AttrPatch,
        /// Change timestamp.
        ts: u64,
    },
    /// Move the allocation cursor (see [`CursorMode`]).
    CursorReset {
        /// Direction.
        mode: CursorMode,
        /// Requested cursor value for `Sub`; ignored for `Add`.
        new_cursor: u64,
    },
    /// Insert a directory entry.
    CreateDentry {
        /// The entry.
        dentry: Dentry,
        /// Change timestamp.
        ts: u64,
    },
    /// Remove a directory entry; a copy lands in the trash tier.
    DeleteDentry {
        /// Parent directory.
        parent: InodeId,
        /// Entry name.
        name: String,
        /// Deletion timestamp.
        ts: u64,
    },
    /// Remove a batch of directory entries.
    BatchDeleteDentry {
        /// (parent, name) pairs.
        dentries: Vec<(InodeId, String)>,
        /// Deletion timestamp.
        ts: u64,
    },
    /// Point an existing entry at a different inode.
    UpdateDentry {
        /// Parent directory.
        parent: InodeId,
        /// Entry name.
        name: String,
        /// New child inode.
        ino: InodeId,
        /// Change timestamp.
        ts: u64,
    },
    /// Set one extended attribute.
    SetXAttr {
        /// Target inode.
        ino: InodeId,
        /// Attribute name.
        key: String,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// Remove one extended attribute.
    RemoveXAttr {
        /// Target inode.
        ino: InodeId,
        /// Attribute name.
        key: String,
    },
    /// Begin a multipart upload.
    CreateMultipart {
        /// Object key.
        object_key: String,
        /// Upload session ID.
        upload_id: String,
        /// Initiation timestamp.
        ts: u64,
        /// Upload metadata.
        metadata: Vec<(String, String)>,
    },
    /// Register one uploaded part.
    AppendMultipart {
        /// Object key.
        object_key: String,
        /// Upload session ID.
        upload_id: String,
        /// The part.
        part: Part,
    },
    /// Drop a multipart upload.
    RemoveMultipart {
        /// Object key.
        object_key: String,
        /// Upload session ID.
        upload_id: String,
    },
    /// Restore a trash dentry to the live tree.
    RecoverDeletedDentry {
        /// Parent directory.
        parent: InodeId,
        /// Entry name.
        name: String,
        /// Deletion timestamp identifying the trash entry.
        timestamp: u64,
        /// Deleted child inode identifying the trash entry.
        ino: InodeId,
    },
    /// Restore a batch of trash dentries.
    RecoverDeletedDentryBatch {
        /// (parent, name, timestamp, ino) trash keys.
        dentries: Vec<(InodeId, String, u64, InodeId)>,
    },
    /// Restore a trash inode to the live tree.
    RecoverDeletedInode {
        /// Target inode.
        ino: InodeId,
    },
    /// Restore a batch of trash inodes.
    RecoverDeletedInodeBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
    },
    /// Drop one trash dentry for good.
    CleanDeletedDentry {
        /// Parent directory.
        parent: InodeId,
        /// Entry name.
        name: String,
        /// Deletion timestamp identifying the trash entry.
        timestamp: u64,
        /// Deleted child inode identifying the trash entry.
        ino: InodeId,
    },
    /// Drop a batch of trash dentries.
    CleanDeletedDentryBatch {
        /// (parent, name, timestamp, ino) trash keys.
        dentries: Vec<(InodeId, String, u64, InodeId)>,
    },
    /// Expire a trash inode (no children may remain in trash).
    CleanDeletedInode {
        /// Target inode.
        ino: InodeId,
    },
    /// Expire a batch of trash inodes.
    CleanDeletedInodeBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
    },
    /// Expire every trash inode deleted at or before `deadline`.
    CleanExpiredInode {
        /// Target inode.
        ino: InodeId,
        /// Latest deletion timestamp eligible for expiry.
        deadline: u64,
    },
    /// Batch form of [`MetaCommand::CleanExpiredInode`].
    CleanExpiredInodeBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
        /// Latest deletion timestamp eligible for expiry.
        deadline: u64,
    },
    /// Reclaimer commit: remove fully reclaimed trash inodes everywhere.
    InternalCleanDeletedInode {
        /// Inodes whose extents the data nodes acknowledged.
        inos: Vec<InodeId>,
    },
    /// Append one extent at the tail of a file.
    ExtentAppend {
        /// Target inode.
        ino: InodeId,
        /// The extent.
        extent: ExtentKey,
        /// Modification timestamp.
        ts: u64,
    },
    /// Insert extents at arbitrary offsets.
    ExtentInsert {
        /// Target inode.
        ino: InodeId,
        /// The extents.
        extents: Vec<ExtentKey>,
        /// Modification timestamp.
        ts: u64,
    },
    /// Truncate a file's extent list to `size` bytes.
    ExtentTruncate {
        /// Target inode.
        ino: InodeId,
        /// New size.
        size: u64,
        /// Modification timestamp.
        ts: u64,
    },
    /// Replace a run of extents with their merged form.
    ExtentsMerge {
        /// Target inode.
        ino: InodeId,
        /// Extents being replaced (must match verbatim).
        old: Vec<ExtentKey>,
        /// Replacement extents.
        new: Vec<ExtentKey>,
        /// Modification timestamp.
        ts: u64,
    },
    /// Advance the extent-delete journal cursor on every replica.
    SyncDelExtents {
        /// New cursor date (packed `YYMMDDHH`).
        cursor: u64,
    },
    /// Cursor advance plus the surviving journal keys, for followers that
    /// fell behind a rotation.
    SyncDelExtentsV2 {
        /// New cursor date (packed `YYMMDDHH`).
        cursor: u64,
        /// Raw journal keys still pending on the leader.
        keys: Vec<Vec<u8>>,
    },
}

impl MetaCommand {
    /// The wire opcode of this command.
    pub fn opcode(&self) -> u8 {
        match self {
            MetaCommand::CreateInode { .. } => 1,
            MetaCommand::CreateInodeLink { .. } => 2,
            MetaCommand::UnlinkInode { .. } => 3,
            MetaCommand::UnlinkInodeBatch { .. } => 4,
            MetaCommand::EvictInode { .. } => 5,
            MetaCommand::EvictInodeBatch { .. } => 6,
            MetaCommand::DeleteInode { .. } => 7,
            MetaCommand::DeleteInodeBatch { .. } => 8,
            MetaCommand::SetAttr { .. } => 9,
            MetaCommand::CursorReset { .. } => 10,
            MetaCommand::CreateDentry { .. } => 11,
            MetaCommand::DeleteDentry { .. } => 12,
            MetaCommand::BatchDeleteDentry { .. } => 13,
            MetaCommand::UpdateDentry { .. } => 14,
            MetaCommand::SetXAttr { .. } => 15,
            MetaCommand::RemoveXAttr { .. } => 16,
            MetaCommand::CreateMultipart { .. } => 17,
            MetaCommand::AppendMultipart { .. } => 18,
            MetaCommand::RemoveMultipart { .. } => 19,
            MetaCommand::RecoverDeletedDentry { .. } => 20,
            MetaCommand::RecoverDeletedDentryBatch { .. } => 21,
            MetaCommand::RecoverDeletedInode { .. } => 22,
            MetaCommand::RecoverDeletedInodeBatch { .. } => 23,
            MetaCommand::CleanDeletedDentry { .. } => 24,
            MetaCommand::CleanDeletedDentryBatch { .. } => 25,
            MetaCommand::CleanDeletedInode { .. } => 26,
            MetaCommand::CleanDeletedInodeBatch { .. } => 27,
            MetaCommand::CleanExpiredInode { .. } => 28,
            MetaCommand::CleanExpiredInodeBatch { .. } => 29,
            MetaCommand::InternalCleanDeletedInode { .. } => 30,
            MetaCommand::ExtentAppend { .. } => 31,
            MetaCommand::ExtentInsert { .. } => 32,
            MetaCommand::ExtentTruncate { .. } => 33,
            MetaCommand::ExtentsMerge { .. } => 34,
            MetaCommand::SyncDelExtents { .. } => 35,
            MetaCommand::SyncDelExtentsV2 { .. } => 36,
        }
    }
}

/// A command as it travels through raft: opcode, proposer address,
/// payload, and the client fingerprint when one applies.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandEnvelope {
    /// Address of the proposing node or client.
    pub from: String,
    /// The command.
    pub command: MetaCommand,
    /// Dedup fingerprint for client-originated mutations.
    pub fingerprint: Option<RequestFingerprint>,
}

impl CommandEnvelope {
    /// Wraps a command with no fingerprint (internal proposals).
    pub fn internal(from: &str, command: MetaCommand) -> Self {
        Self {
            from: from.to_string(),
            command,
            fingerprint: None,
        }
    }

    /// Encodes the wire form.
    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let payload =
            bincode::serialize(&self.command).map_err(|e| MetaError::Codec(e.to_string()))?;
        let mut buf = Vec::with_capacity(10 + self.from.len() + payload.len());
        buf.push(self.command.opcode());
        buf.extend_from_slice(&(self.from.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.from.as_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        match &self.fingerprint {
            Some(fp) => {
                buf.push(1);
                let fp_bytes =
                    bincode::serialize(fp).map_err(|e| MetaError::Codec(e.to_string()))?;
                buf.extend_from_slice(&fp_bytes);
            }
            None => buf.push(0),
        }
        Ok(buf)
    }

    /// Decodes the wire form, verifying the leading opcode byte.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < 10 {
            return Err(MetaError::Codec("command envelope truncated".to_string()));
        }
        let opcode = buf[0];
        let from_len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
        if buf.len() < 5 + from_len + 4 {
            return Err(MetaError::Codec("command envelope truncated".to_string()));
        }
        let from = String::from_utf8(buf[5..5 + from_len].to_vec())
            .map_err(|_| MetaError::Codec("command address is not utf-8".to_string()))?;
        let mut off = 5 + from_len;
        let payload_len = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if buf.len() < off + payload_len + 1 {
            return Err(MetaError::Codec("command payload truncated".to_string()));
        }
        let command: MetaCommand = bincode::deserialize(&buf[off..off + payload_len])
            .map_err(|e| MetaError::Codec(e.to_string()))?;
        if command.opcode() != opcode {
            return Err(MetaError::Codec(format!(
                "opcode byte {} does not match payload opcode {}",
                opcode,
                command.opcode()
            )));
        }
        off += payload_len;
        let fingerprint = match buf[off] {
            0 => None,
            1 => Some(
                bincode::deserialize(&buf[off + 1..])
                    .map_err(|e| MetaError::Codec(e.to_string()))?,
            ),
            b => {
                return Err(MetaError::Codec(format!(
                    "bad fingerprint marker byte {}",
                    b
                )))
            }
        };
        Ok(Self {
            from,
            command,
            fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip_without_fingerprint() {
        let env = CommandEnvelope::internal(
            "10.0.0.1:9021",
            MetaCommand::UnlinkInode {
                ino: InodeId::new(42),
                ts: 1_700_000_000,
            },
        );
        let buf = env.encode().unwrap();
        assert_eq!(buf[0], 3);
        assert_eq!(CommandEnvelope::decode(&buf).unwrap(), env);
    }

    #[test]
    fn test_envelope_roundtrip_with_fingerprint() {
        let env = CommandEnvelope {
            from: "10.0.0.2:9021".to_string(),
            command: MetaCommand::CreateInode {
                mode: 0o100644,
                uid: 1,
                gid: 1,
                target: Vec::new(),
                ts: 7,
            },
            fingerprint: Some(RequestFingerprint {
                client_id: 9,
                client_start: 1,
                request_id: 2,
                client_ip: 3,
                payload_crc: 4,
            }),
        };
        let buf = env.encode().unwrap();
        assert_eq!(CommandEnvelope::decode(&buf).unwrap(), env);
    }

    #[test]
    fn test_decode_rejects_opcode_mismatch() {
        let env = CommandEnvelope::internal(
            "x",
            MetaCommand::EvictInode {
                ino: InodeId::new(1),
            },
        );
        let mut buf = env.encode().unwrap();
        buf[0] = 1;
        assert!(CommandEnvelope::decode(&buf).is_err());
    }

    #[test]
    fn test_opcodes_are_distinct() {
        use std::collections::HashSet;
        let commands = vec![
            MetaCommand::CreateInode {
                mode: 0,
                uid: 0,
                gid: 0,
                target: vec![],
                ts: 0,
            },
            MetaCommand::EvictInode {
                ino: InodeId::new(0),
            },
            MetaCommand::SyncDelExtents { cursor: 0 },
            MetaCommand::SyncDelExtentsV2 {
                cursor: 0,
                keys: vec![],
            },
            MetaCommand::InternalCleanDeletedInode { inos: vec![] },
        ];
        let codes: HashSet<u8> = commands.iter().map(|c| c.opcode()).collect();
        assert_eq!(codes.len(), commands.len());
    }

    #[test]
    fn test_payload_encoding_is_stable() {
        // Apply relies on byte-stable command encoding; a change here is a
        // wire format break.
        let cmd = MetaCommand::EvictInode {
            ino: InodeId::new(5),
        };
        let a = bincode::serialize(&cmd).unwrap();
        let b = bincode::serialize(&cmd).unwrap();
        assert_eq!(a, b);
    }
}
