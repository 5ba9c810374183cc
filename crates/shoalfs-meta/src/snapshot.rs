//! Whole-partition snapshot streaming for joining followers.
//!
//! The leader walks every tree in fixed order and emits framed items
//! `[tag][version][len][payload]`; the final record carries the base-info
//! counters and a CRC per entity tree. The receiver wipes its state,
//! inserts every item, recomputes the CRCs, and only installs the applied
//! index once they match; a mismatch aborts the join and leaves the
//! replica empty rather than divergent.
//!
//! Two formats share the framing: V1 streams one item per entity, V2
//! ships one bulk chunk per tree for faster recovery of large partitions.
//! Access time is not replicated deterministically, so inode and
//! deleted-inode payloads are hashed with the access-time field zeroed.

use crc32fast::Hasher;

use crate::backend::{BaseInfo, MetaBackend, TreeTag};
use crate::inode::zero_atime;
use crate::types::MetaError;

/// Item tag for the serialized dedup ledger.
const TAG_LEDGER: u8 = 0xF0;
/// Item tag for the terminal record.
const TAG_FINAL: u8 = 0xFF;

/// Per-entity streaming format.
pub const VERSION_V1: u8 = 1;
/// Bulk per-tree chunk format.
pub const VERSION_V2: u8 = 2;

/// One framed snapshot item.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotItem {
    /// A single entity record (V1).
    Entity {
        /// Source tree.
        tag: TreeTag,
        /// Tree key.
        key: Vec<u8>,
        /// Encoded entity.
        value: Vec<u8>,
    },
    /// Every record of one tree, concatenated (V2).
    TreeChunk {
        /// Source tree.
        tag: TreeTag,
        /// `[u32 key-len][key][u32 val-len][value]` frames.
        records: Vec<u8>,
    },
    /// The serialized dedup ledger.
    Ledger(Vec<u8>),
    /// Terminal record: counters plus per-entity-tree CRCs.
    Final {
        /// Base-info to install (applied index, cursor, sizes, counts).
        base: BaseInfo,
        /// CRC per tree in [`TreeTag::ENTITY_ORDER`] order, extent-delete
        /// journal last.
        tree_crcs: [u32; 7],
    },
}

/// Computes the per-tree CRCs of a backend's committed state.
///
/// Inode-tree and deleted-inode-tree values are hashed with access time
/// zeroed; trash dentries hash verbatim.
pub fn tree_crcs(backend: &dyn MetaBackend) -> Result<[u32; 7], MetaError> {
    let mut out = [0u32; 7];
    for (i, tag) in TreeTag::ALL_TABLES.iter().enumerate() {
        let mut hasher = Hasher::new();
        backend.range(*tag, &[], None, &mut |k, v| {
            hasher.update(k);
            if matches!(tag, TreeTag::Inode | TreeTag::DeletedInode) {
                let mut value = v.to_vec();
                zero_atime(&mut value);
                hasher.update(&value);
            } else {
                hasher.update(v);
            }
            Ok(true)
        })?;
        out[i] = hasher.finalize();
    }
    Ok(out)
}

/// Builds the full item stream for a joining follower.
pub fn build(
    backend: &dyn MetaBackend,
    ledger: Vec<u8>,
    version: u8,
) -> Result<Vec<SnapshotItem>, MetaError> {
    let triples = backend.snapshot_triples()?;
    let mut items = Vec::new();
    match version {
        VERSION_V1 => {
            for (tag, key, value) in triples {
                items.push(SnapshotItem::Entity { tag, key, value });
            }
        }
        VERSION_V2 => {
            for tag in TreeTag::ALL_TABLES {
                let mut records = Vec::new();
                for (t, key, value) in triples.iter().filter(|(t, _, _)| *t == tag) {
                    debug_assert_eq!(*t, tag);
                    records.extend_from_slice(&(key.len() as u32).to_be_bytes());
                    records.extend_from_slice(key);
                    records.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    records.extend_from_slice(value);
                }
                if !records.is_empty() {
                    items.push(SnapshotItem::TreeChunk { tag, records });
                }
            }
        }
        v => {
            return Err(MetaError::Snapshot(format!(
                "unsupported snapshot version {}",
                v
            )))
        }
    }
    items.push(SnapshotItem::Ledger(ledger));
    items.push(SnapshotItem::Final {
        base: backend.base_info()?,
        tree_crcs: tree_crcs(backend)?,
    });
    Ok(items)
}

/// Encodes an item stream into wire bytes.
pub fn encode(items: &[SnapshotItem], version: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut frame = |tag: u8, payload: &[u8]| {
        buf.push(tag);
        buf.push(version);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
    };
    for item in items {
        match item {
            SnapshotItem::Entity { tag, key, value } => {
                let mut payload = Vec::with_capacity(4 + key.len() + value.len());
                payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
                payload.extend_from_slice(key);
                payload.extend_from_slice(value);
                frame(tag.as_u8(), &payload);
            }
            SnapshotItem::TreeChunk { tag, records } => frame(tag.as_u8(), records),
            SnapshotItem::Ledger(bytes) => frame(TAG_LEDGER, bytes),
            SnapshotItem::Final { base, tree_crcs } => {
                let mut payload = base.encode();
                for crc in tree_crcs {
                    payload.extend_from_slice(&crc.to_be_bytes());
                }
                frame(TAG_FINAL, &payload);
            }
        }
    }
    buf
}

/// Decodes wire bytes back into an item stream.
pub fn decode(buf: &[u8]) -> Result<Vec<SnapshotItem>, MetaError> {
    let mut items = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        if buf.len() < off + 6 {
            return Err(MetaError::Snapshot("item header truncated".to_string()));
        }
        let tag = buf[off];
        let version = buf[off + 1];
        let len = u32::from_be_bytes(buf[off + 2..off + 6].try_into().unwrap()) as usize;
        off += 6;
        if buf.len() < off + len {
            return Err(MetaError::Snapshot("item payload truncated".to_string()));
        }
        let payload = &buf[off..off + len];
        off += len;
        match tag {
            TAG_LEDGER => items.push(SnapshotItem::Ledger(payload.to_vec())),
            TAG_FINAL => {
                if payload.len() != BaseInfo::ENCODED_LEN + 28 {
                    return Err(MetaError::Snapshot("final record malformed".to_string()));
                }
                let base = BaseInfo::decode(&payload[..BaseInfo::ENCODED_LEN])?;
                let mut tree_crcs = [0u32; 7];
                for (i, crc) in tree_crcs.iter_mut().enumerate() {
                    let at = BaseInfo::ENCODED_LEN + i * 4;
                    *crc = u32::from_be_bytes(payload[at..at + 4].try_into().unwrap());
                }
                items.push(SnapshotItem::Final { base, tree_crcs });
            }
            t => {
                let tree_tag = TreeTag::from_u8(t).filter(|t| *t != TreeTag::BaseInfo).ok_or_else(
                    || MetaError::Snapshot(format!("unknown snapshot item tag {}", t)),
                )?;
                match version {
                    VERSION_V1 => {
                        if payload.len() < 4 {
                            return Err(MetaError::Snapshot("entity item truncated".to_string()));
                        }
                        let key_len =
                            u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
                        if payload.len() < 4 + key_len {
                            return Err(MetaError::Snapshot("entity key truncated".to_string()));
                        }
                        items.push(SnapshotItem::Entity {
                            tag: tree_tag,
                            key: payload[4..4 + key_len].to_vec(),
                            value: payload[4 + key_len..].to_vec(),
                        });
                    }
                    VERSION_V2 => items.push(SnapshotItem::TreeChunk {
                        tag: tree_tag,
                        records: payload.to_vec(),
                    }),
                    v => {
                        return Err(MetaError::Snapshot(format!(
                            "unsupported snapshot version {}",
                            v
                        )))
                    }
                }
            }
        }
    }
    Ok(items)
}

/// Installs an item stream into a backend.
///
/// The backend is wiped first; the applied index and counters land only
/// with the final record, after the per-tree CRCs verify. On mismatch the
/// backend is wiped again and the join aborts. Returns the serialized
/// dedup ledger for the partition to restore.
pub fn install(
    backend: &dyn MetaBackend,
    items: &[SnapshotItem],
) -> Result<Vec<u8>, MetaError> {
    backend.clear()?;
    let interim = BaseInfo::default();
    let mut ledger = Vec::new();
    let mut finished = false;
    for item in items {
        if finished {
            return Err(MetaError::Snapshot(
                "items after the final record".to_string(),
            ));
        }
        match item {
            SnapshotItem::Entity { tag, key, value } => {
                let mut batch = backend.begin();
                backend.put(&mut batch, *tag, key.clone(), value.clone(), true)?;
                backend.commit(batch, &interim)?;
            }
            SnapshotItem::TreeChunk { tag, records } => {
                let mut batch = backend.begin();
                let mut off = 0;
                while off < records.len() {
                    if records.len() < off + 4 {
                        return Err(MetaError::Snapshot("chunk truncated".to_string()));
                    }
                    let key_len =
                        u32::from_be_bytes(records[off..off + 4].try_into().unwrap()) as usize;
                    off += 4;
                    if records.len() < off + key_len + 4 {
                        return Err(MetaError::Snapshot("chunk key truncated".to_string()));
                    }
                    let key = records[off..off + key_len].to_vec();
                    off += key_len;
                    let val_len =
                        u32::from_be_bytes(records[off..off + 4].try_into().unwrap()) as usize;
                    off += 4;
                    if records.len() < off + val_len {
                        return Err(MetaError::Snapshot("chunk value truncated".to_string()));
                    }
                    let value = records[off..off + val_len].to_vec();
                    off += val_len;
                    backend.put(&mut batch, *tag, key, value, true)?;
                }
                backend.commit(batch, &interim)?;
            }
            SnapshotItem::Ledger(bytes) => ledger = bytes.clone(),
            SnapshotItem::Final { base, tree_crcs } => {
                verify_tree_crcs(backend, tree_crcs)?;
                let batch = backend.begin();
                backend.commit(batch, base)?;
                finished = true;
            }
        }
    }
    if !finished {
        backend.clear()?;
        return Err(MetaError::Snapshot("stream ended without final record".to_string()));
    }
    Ok(ledger)
}

fn verify_tree_crcs(backend: &dyn MetaBackend, expected: &[u32; 7]) -> Result<(), MetaError> {
    let local = tree_crcs(backend)?;
    if local != *expected {
        backend.clear()?;
        return Err(MetaError::Snapshot(format!(
            "tree crc mismatch: local {:?}, leader {:?}",
            local, expected
        )));
    }
    Ok(())
}
