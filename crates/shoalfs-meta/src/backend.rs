//! Storage backend abstraction: a uniform ordered-map surface over the
//! partition's entity trees.
//!
//! The applier sees one contract regardless of backend: `begin` a batch,
//! stage puts and deletes against tagged trees, then `commit` everything
//! together with the applied-index bump. `get` observes committed state
//! only; command handlers that must see their own staged writes resolve
//! through [`lookup_through`], which overlays the batch, so both backends
//! behave identically. `get` returns an owned copy, so readers can never
//! alias a value a later writer mutates.
//!
//! Two implementations exist: an in-memory ordered tree per entity
//! ([`crate::memdb::MemBackend`]) and a persistent LSM where the first
//! key byte is the tree tag ([`crate::lsmdb::LsmBackend`], `lsm` feature).

use crate::types::MetaError;

/// Identifies one of the partition's trees. The tag byte doubles as the
/// on-disk key prefix of the LSM backend and the snapshot item tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TreeTag {
    /// Reserved record holding applied index and aggregate counters.
    BaseInfo = 0,
    /// Live inodes.
    Inode = 1,
    /// Live directory entries.
    Dentry = 2,
    /// Extended attributes.
    Extend = 3,
    /// Multipart uploads.
    Multipart = 4,
    /// Trash-tier directory entries.
    DeletedDentry = 5,
    /// Trash-tier inodes.
    DeletedInode = 6,
    /// Date-keyed extent-delete journal.
    ExtentDel = 7,
}

impl TreeTag {
    /// The entity trees in fixed snapshot order.
    pub const ENTITY_ORDER: [TreeTag; 6] = [
        TreeTag::Inode,
        TreeTag::Dentry,
        TreeTag::Extend,
        TreeTag::Multipart,
        TreeTag::DeletedDentry,
        TreeTag::DeletedInode,
    ];

    /// Every data table (entities plus the extent-delete journal).
    pub const ALL_TABLES: [TreeTag; 7] = [
        TreeTag::Inode,
        TreeTag::Dentry,
        TreeTag::Extend,
        TreeTag::Multipart,
        TreeTag::DeletedDentry,
        TreeTag::DeletedInode,
        TreeTag::ExtentDel,
    ];

    /// The tag byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a tag byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(TreeTag::BaseInfo),
            1 => Some(TreeTag::Inode),
            2 => Some(TreeTag::Dentry),
            3 => Some(TreeTag::Extend),
            4 => Some(TreeTag::Multipart),
            5 => Some(TreeTag::DeletedDentry),
            6 => Some(TreeTag::DeletedInode),
            7 => Some(TreeTag::ExtentDel),
            _ => None,
        }
    }

    /// Index of this tag within [`TreeTag::ALL_TABLES`].
    pub fn table_index(self) -> usize {
        self as usize - 1
    }
}

/// The reserved base-info record: applied index, allocation cursor, and
/// aggregate counters, persisted atomically with every committed batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BaseInfo {
    /// Index of the last applied raft command.
    pub applied_index: u64,
    /// Next-inode-ID allocation cursor.
    pub cursor: u64,
    /// Extent-delete journal cursor (packed `YYMMDDHH` date).
    pub del_cursor: u64,
    /// Sum of sizes over live inodes.
    pub live_size: u64,
    /// Sum of sizes over trash inodes.
    pub deleted_size: u64,
    /// Cardinality of each data table, indexed per [`TreeTag::ALL_TABLES`].
    pub counts: [u64; 7],
}

impl BaseInfo {
    /// Encoded record length.
    pub const ENCODED_LEN: usize = 40 + 7 * 8;

    /// Encodes the canonical big-endian record.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.extend_from_slice(&self.applied_index.to_be_bytes());
        buf.extend_from_slice(&self.cursor.to_be_bytes());
        buf.extend_from_slice(&self.del_cursor.to_be_bytes());
        buf.extend_from_slice(&self.live_size.to_be_bytes());
        buf.extend_from_slice(&self.deleted_size.to_be_bytes());
        for c in &self.counts {
            buf.extend_from_slice(&c.to_be_bytes());
        }
        buf
    }

    /// Decodes a canonical record.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(MetaError::Codec(format!(
                "base-info record has {} bytes, want {}",
                buf.len(),
                Self::ENCODED_LEN
            )));
        }
        let u64_at = |off: usize| u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        let mut counts = [0u64; 7];
        for (i, c) in counts.iter_mut().enumerate() {
            *c = u64_at(40 + i * 8);
        }
        Ok(Self {
            applied_index: u64_at(0),
            cursor: u64_at(8),
            del_cursor: u64_at(16),
            live_size: u64_at(24),
            deleted_size: u64_at(32),
            counts,
        })
    }

    /// Cardinality of one table.
    pub fn count(&self, tag: TreeTag) -> u64 {
        self.counts[tag.table_index()]
    }
}

/// One staged mutation inside a write batch.
#[derive(Clone, Debug)]
pub enum BatchOp {
    /// Insert or replace a key.
    Put {
        /// Target tree.
        tag: TreeTag,
        /// Tree key.
        key: Vec<u8>,
        /// Encoded entity value.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target tree.
        tag: TreeTag,
        /// Tree key.
        key: Vec<u8>,
    },
}

/// A batch of mutations applied atomically with one applied-index bump.
///
/// Dropping an uncommitted batch discards it (`release` in the contract).
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Staged operations in call order.
    pub(crate) ops: Vec<BatchOp>,
    /// Cardinality deltas accumulated by put/delete, per data table.
    pub(crate) count_deltas: [i64; 7],
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Looks up the pending state of a key within this batch.
    ///
    /// `None` means untouched; `Some(None)` staged delete; `Some(Some(v))`
    /// staged put.
    pub(crate) fn pending(&self, tag: TreeTag, key: &[u8]) -> Option<Option<&[u8]>> {
        for op in self.ops.iter().rev() {
            match op {
                BatchOp::Put {
                    tag: t,
                    key: k,
                    value,
                } if *t == tag && k.as_slice() == key => return Some(Some(value.as_slice())),
                BatchOp::Delete { tag: t, key: k } if *t == tag && k.as_slice() == key => {
                    return Some(None)
                }
                _ => {}
            }
        }
        None
    }

    pub(crate) fn stage_put(&mut self, tag: TreeTag, key: Vec<u8>, value: Vec<u8>, inserted: bool) {
        if inserted {
            self.count_deltas[tag.table_index()] += 1;
        }
        self.ops.push(BatchOp::Put { tag, key, value });
    }

    pub(crate) fn stage_delete(&mut self, tag: TreeTag, key: Vec<u8>) {
        self.count_deltas[tag.table_index()] -= 1;
        self.ops.push(BatchOp::Delete { tag, key });
    }
}

/// Outcome of a `put`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    /// The value previously stored under the key, if any.
    pub prior: Option<Vec<u8>>,
    /// True if the key was absent and has been inserted.
    pub inserted: bool,
}

/// One `(tree, key, value)` triple from a whole-partition snapshot scan.
pub type SnapshotTriple = (TreeTag, Vec<u8>, Vec<u8>);

/// Uniform ordered-map surface over the partition's trees.
pub trait MetaBackend: Send + Sync {
    /// Opens a new empty write batch.
    fn begin(&self) -> WriteBatch {
        WriteBatch::new()
    }

    /// Atomically applies the batch, the new base-info record (carrying
    /// the applied-index bump and counter updates), and makes everything
    /// visible to readers. A crash before commit re-applies the command.
    fn commit(&self, batch: WriteBatch, base: &BaseInfo) -> Result<(), MetaError>;

    /// Reads the committed value under a key, as an owned copy.
    fn get(&self, tag: TreeTag, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError>;

    /// Stages an insert. With `replace` false an existing key is left
    /// untouched and reported via the outcome; staged ops in the same
    /// batch are observed.
    fn put(
        &self,
        batch: &mut WriteBatch,
        tag: TreeTag,
        key: Vec<u8>,
        value: Vec<u8>,
        replace: bool,
    ) -> Result<PutOutcome, MetaError>;

    /// Stages a removal. Returns true if the key existed (committed or
    /// staged in this batch).
    fn delete(&self, batch: &mut WriteBatch, tag: TreeTag, key: &[u8])
        -> Result<bool, MetaError>;

    /// Iterates committed `(key, value)` pairs of `[start, end)` in
    /// ascending key order (`end` `None` scans to the tree's end). The
    /// callback returns false to stop early.
    fn range(
        &self,
        tag: TreeTag,
        start: &[u8],
        end: Option<&[u8]>,
        cb: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, MetaError>,
    ) -> Result<(), MetaError>;

    /// The greatest key in a tree, if any.
    fn max_key(&self, tag: TreeTag) -> Result<Option<Vec<u8>>, MetaError>;

    /// Cardinality of a tree.
    fn len(&self, tag: TreeTag) -> Result<u64, MetaError>;

    /// Reads the committed base-info record.
    fn base_info(&self) -> Result<BaseInfo, MetaError>;

    /// Collects every `(tag, key, value)` triple in fixed tree order, as a
    /// point-in-time view for snapshot streaming.
    fn snapshot_triples(&self) -> Result<Vec<SnapshotTriple>, MetaError>;

    /// Wipes every tree and the base-info record, ahead of a snapshot
    /// install.
    fn clear(&self) -> Result<(), MetaError>;
}

/// Resolves a key against the batch first, then the committed state.
pub(crate) fn lookup_through(
    backend: &dyn MetaBackend,
    batch: &WriteBatch,
    tag: TreeTag,
    key: &[u8],
) -> Result<Option<Vec<u8>>, MetaError> {
    match batch.pending(tag, key) {
        Some(Some(v)) => Ok(Some(v.to_vec())),
        Some(None) => Ok(None),
        None => backend.get(tag, key),
    }
}
