//! Core types for the meta partition service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a unique identifier for an inode within a volume
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root inode ID (always 1)
    pub const ROOT_INODE: InodeId = InodeId(1);

    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a unique identifier for a meta partition
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(u64);

impl PartitionId {
    /// Creates a new PartitionId from a raw u64 value
    pub fn new(id: u64) -> Self {
        PartitionId(id)
    }

    /// Returns the raw u64 value of this partition ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a unique identifier for a metadata server node in the cluster
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code returned to clients for every metadata operation.
///
/// Logical collisions and transient conditions travel as status codes,
/// never as errors; errors are reserved for backend and codec failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Operation succeeded.
    Ok = 0,
    /// Entity already exists (or directory still has children).
    Exists = 1,
    /// Entity does not exist.
    NotExist = 2,
    /// Referenced ID is outside the partition's inode range.
    OutOfRange = 3,
    /// Transient condition (leader change, queue full); client must retry.
    Again = 4,
    /// The inode cursor reached the end of the partition's range.
    InodeFull = 5,
    /// Operation not permitted in the partition's current state.
    AccessDenied = 6,
    /// Unclassified failure.
    Err = 7,
}

impl Status {
    /// Returns the wire byte for this status.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a status from its wire byte. Unknown bytes map to `Err`.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => Status::Ok,
            1 => Status::Exists,
            2 => Status::NotExist,
            3 => Status::OutOfRange,
            4 => Status::Again,
            5 => Status::InodeFull,
            6 => Status::AccessDenied,
            _ => Status::Err,
        }
    }

    /// Returns true for `Status::Ok`.
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Exists => "exists",
            Status::NotExist => "not-exist",
            Status::OutOfRange => "out-of-range",
            Status::Again => "again",
            Status::InodeFull => "inode-full",
            Status::AccessDenied => "access-denied",
            Status::Err => "err",
        };
        write!(f, "{}", s)
    }
}

/// Error types for meta partition operations
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The requested inode does not exist.
    #[error("inode {0} not found")]
    InodeNotFound(InodeId),

    /// The requested partition is not hosted on this node.
    #[error("partition {0} not found")]
    PartitionNotFound(PartitionId),

    /// A binary payload could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Operation requires the raft leader but this replica is not the leader.
    #[error("not the raft leader")]
    NotLeader {
        /// Hint about the current leader, if known
        leader_hint: Option<NodeId>,
    },

    /// An error occurred in the raft consensus layer.
    #[error("raft error: {0}")]
    Raft(String),

    /// A read or write on the storage backend failed. The replica is
    /// considered diverged; apply must halt.
    #[error("backend error: {0}")]
    Backend(String),

    /// A snapshot stream failed verification or was malformed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// The partition is stopping; background work must exit.
    #[error("partition is stopped")]
    Stopped,

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// POSIX-style file type bits carried in the inode mode field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
}

impl FileType {
    /// Returns the POSIX S_IFMT bits for this file type
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
        }
    }

    /// Extracts the file type from a full mode word. Unknown S_IFMT bits
    /// are treated as a regular file.
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            _ => FileType::RegularFile,
        }
    }
}

/// Returns true if the mode word names a directory.
pub fn is_dir_mode(mode: u32) -> bool {
    FileType::from_mode(mode) == FileType::Directory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            Status::Ok,
            Status::Exists,
            Status::NotExist,
            Status::OutOfRange,
            Status::Again,
            Status::InodeFull,
            Status::AccessDenied,
            Status::Err,
        ] {
            assert_eq!(Status::from_u8(s.as_u8()), s);
        }
    }

    #[test]
    fn test_status_unknown_maps_to_err() {
        assert_eq!(Status::from_u8(200), Status::Err);
    }

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(FileType::from_mode(0o100644), FileType::RegularFile);
        assert_eq!(FileType::from_mode(0o040755), FileType::Directory);
        assert_eq!(FileType::from_mode(0o120777), FileType::Symlink);
    }

    #[test]
    fn test_is_dir_mode() {
        assert!(is_dir_mode(0o040755));
        assert!(!is_dir_mode(0o100644));
    }

    #[test]
    fn test_inode_id_display() {
        assert_eq!(InodeId::new(42).to_string(), "42");
        assert_eq!(InodeId::ROOT_INODE.as_u64(), 1);
    }
}
