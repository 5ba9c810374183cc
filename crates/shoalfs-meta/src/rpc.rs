//! Client packet framing and the read-only request surface.
//!
//! A packet is `[u32 total-len][u8 opcode][u64 partition-id]
//! [u64 request-id][u32 crc][body]`; the CRC covers the body and is
//! verified on decode. Mutating opcodes reuse the raft command opcodes
//! (1..=36) and carry a [`crate::command::CommandEnvelope`] body; read
//! opcodes start at 0x40 with a bincode [`ReadRequest`] body. Connection
//! handling and pooling live in the transport layer.

use serde::{Deserialize, Serialize};

use crate::dentry::{DeletedDentry, Dentry};
use crate::inode::{DeletedInode, Inode};
use crate::partition::PartitionStat;
use crate::types::{InodeId, MetaError, PartitionId, Status};

/// First opcode of the read-only range.
pub const OP_READ_BASE: u8 = 0x40;

/// Point inode read.
pub const OP_INODE_GET: u8 = 0x40;
/// Batched inode read.
pub const OP_INODE_GET_BATCH: u8 = 0x41;
/// Name resolution.
pub const OP_LOOKUP: u8 = 0x42;
/// Directory listing.
pub const OP_READ_DIR: u8 = 0x43;
/// Partition statistics.
pub const OP_STAT_FS: u8 = 0x44;
/// Trash dentry listing.
pub const OP_DELETE_DENTRY_LOOKUP: u8 = 0x45;
/// Trash inode read.
pub const OP_DELETED_INODE_GET: u8 = 0x46;

/// A framed client packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Operation code.
    pub opcode: u8,
    /// Target partition.
    pub partition_id: PartitionId,
    /// Client request identity (echoed in the response).
    pub request_id: u64,
    /// CRC32 of the body.
    pub crc: u32,
    /// Operation payload.
    pub body: Vec<u8>,
}

impl Packet {
    /// Header length past the length prefix.
    const HEADER_LEN: usize = 1 + 8 + 8 + 4;

    /// Builds a packet, computing the body CRC.
    pub fn new(opcode: u8, partition_id: PartitionId, request_id: u64, body: Vec<u8>) -> Self {
        let crc = crc32fast::hash(&body);
        Self {
            opcode,
            partition_id,
            request_id,
            crc,
            body,
        }
    }

    /// True for opcodes in the read-only range.
    pub fn is_read(&self) -> bool {
        self.opcode >= OP_READ_BASE
    }

    /// Encodes the length-prefixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        let total = Self::HEADER_LEN + self.body.len();
        let mut buf = Vec::with_capacity(4 + total);
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.partition_id.as_u64().to_be_bytes());
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.extend_from_slice(&self.crc.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decodes one packet from the front of `buf`, returning it and the
    /// bytes consumed. `Ok(None)` means more bytes are needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, MetaError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let total = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if total < Self::HEADER_LEN {
            return Err(MetaError::Codec(format!("packet length {} too small", total)));
        }
        if buf.len() < 4 + total {
            return Ok(None);
        }
        let p = &buf[4..4 + total];
        let opcode = p[0];
        let partition_id = PartitionId::new(u64::from_be_bytes(p[1..9].try_into().unwrap()));
        let request_id = u64::from_be_bytes(p[9..17].try_into().unwrap());
        let crc = u32::from_be_bytes(p[17..21].try_into().unwrap());
        let body = p[21..].to_vec();
        if crc32fast::hash(&body) != crc {
            return Err(MetaError::Codec("packet body crc mismatch".to_string()));
        }
        Ok(Some((
            Self {
                opcode,
                partition_id,
                request_id,
                crc,
                body,
            },
            4 + total,
        )))
    }
}

/// Read-only operations served without raft.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReadRequest {
    /// Read one live inode.
    InodeGet {
        /// Target inode.
        ino: InodeId,
    },
    /// Read a batch of live inodes.
    InodeGetBatch {
        /// Target inodes.
        inos: Vec<InodeId>,
    },
    /// Resolve one name.
    Lookup {
        /// Parent directory.
        parent: InodeId,
        /// Entry name.
        name: String,
    },
    /// List a directory.
    ReadDir {
        /// Parent directory.
        parent: InodeId,
        /// Resume strictly after this name.
        from: Option<String>,
        /// Maximum entries returned.
        limit: u32,
    },
    /// Partition statistics.
    StatFs,
    /// List trash entries of one name.
    DeleteDentryLookup {
        /// Parent directory.
        parent: InodeId,
        /// Entry name.
        name: String,
    },
    /// Read one trash inode.
    DeletedInodeGet {
        /// Target inode.
        ino: InodeId,
    },
}

impl ReadRequest {
    /// The wire opcode of this request.
    pub fn opcode(&self) -> u8 {
        match self {
            ReadRequest::InodeGet { .. } => OP_INODE_GET,
            ReadRequest::InodeGetBatch { .. } => OP_INODE_GET_BATCH,
            ReadRequest::Lookup { .. } => OP_LOOKUP,
            ReadRequest::ReadDir { .. } => OP_READ_DIR,
            ReadRequest::StatFs => OP_STAT_FS,
            ReadRequest::DeleteDentryLookup { .. } => OP_DELETE_DENTRY_LOOKUP,
            ReadRequest::DeletedInodeGet { .. } => OP_DELETED_INODE_GET,
        }
    }
}

/// Payload of a read response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReadResponse {
    /// One inode, if present.
    Inode(Option<Inode>),
    /// Batch of inodes.
    Inodes(Vec<Inode>),
    /// One dentry, if present.
    Dentry(Option<Dentry>),
    /// Directory listing.
    Dentries(Vec<Dentry>),
    /// Partition statistics.
    Stat(PartitionStat),
    /// Trash dentry listing.
    DeletedDentries(Vec<DeletedDentry>),
    /// One trash inode, if present.
    DeletedInode(Option<DeletedInode>),
}

/// A framed response: status code plus an optional payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoed request identity.
    pub request_id: u64,
    /// Outcome.
    pub status: Status,
    /// bincode payload ([`ReadResponse`] or [`crate::applier::ApplyResult`]).
    pub body: Vec<u8>,
}

impl RpcResponse {
    /// A bare status reply.
    pub fn of(request_id: u64, status: Status) -> Self {
        Self {
            request_id,
            status,
            body: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let p = Packet::new(OP_INODE_GET, PartitionId::new(7), 99, vec![1, 2, 3]);
        let wire = p.encode();
        let (decoded, used) = Packet::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded, p);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn test_partial_packet_needs_more_bytes() {
        let p = Packet::new(OP_LOOKUP, PartitionId::new(1), 1, vec![9; 100]);
        let wire = p.encode();
        assert!(Packet::decode(&wire[..10]).unwrap().is_none());
        assert!(Packet::decode(&wire[..3]).unwrap().is_none());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let p = Packet::new(OP_LOOKUP, PartitionId::new(1), 1, vec![1, 2, 3]);
        let mut wire = p.encode();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(Packet::decode(&wire).is_err());
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let a = Packet::new(OP_STAT_FS, PartitionId::new(1), 1, vec![]);
        let b = Packet::new(OP_INODE_GET, PartitionId::new(2), 2, vec![5]);
        let mut wire = a.encode();
        wire.extend(b.encode());
        let (first, used) = Packet::decode(&wire).unwrap().unwrap();
        assert_eq!(first, a);
        let (second, _) = Packet::decode(&wire[used..]).unwrap().unwrap();
        assert_eq!(second, b);
    }

    #[test]
    fn test_read_request_opcodes() {
        assert_eq!(
            ReadRequest::InodeGet {
                ino: InodeId::new(1)
            }
            .opcode(),
            OP_INODE_GET
        );
        assert_eq!(ReadRequest::StatFs.opcode(), OP_STAT_FS);
        assert!(ReadRequest::StatFs.opcode() >= OP_READ_BASE);
    }

    #[test]
    fn test_read_request_bincode_roundtrip() {
        let req = ReadRequest::ReadDir {
            parent: InodeId::new(5),
            from: Some("marker".to_string()),
            limit: 100,
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: ReadRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, req);
    }
}
