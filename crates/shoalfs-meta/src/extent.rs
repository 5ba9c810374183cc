//! Extent keys and the per-inode sorted extent list.
//!
//! An extent is a contiguous byte range stored on a data partition. Each
//! inode carries a file-offset-ordered, non-overlapping sequence of extent
//! keys; insertions trim or evict whatever they overlap and the evicted
//! keys are handed to the extent-delete pipeline.

use crate::types::MetaError;

/// A single extent record: a contiguous range of bytes on a data partition.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExtentKey {
    /// Byte offset of this extent within the file.
    pub file_offset: u64,
    /// Owning data partition.
    pub partition_id: u64,
    /// Extent identifier within the data partition.
    pub extent_id: u64,
    /// Byte offset within the stored extent.
    pub extent_offset: u64,
    /// Length of the range in bytes.
    pub size: u32,
    /// CRC of the extent payload as reported by the data node.
    pub crc: u32,
}

impl ExtentKey {
    /// Encoded size of one extent record.
    pub const ENCODED_LEN: usize = 40;

    /// Returns the file offset one past the end of this extent.
    pub fn end(&self) -> u64 {
        self.file_offset + self.size as u64
    }

    /// Appends the big-endian fixed-width encoding to `buf`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.file_offset.to_be_bytes());
        buf.extend_from_slice(&self.partition_id.to_be_bytes());
        buf.extend_from_slice(&self.extent_id.to_be_bytes());
        buf.extend_from_slice(&self.extent_offset.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.crc.to_be_bytes());
    }

    /// Decodes one record from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(MetaError::Codec(format!(
                "extent record truncated: {} bytes",
                buf.len()
            )));
        }
        let u64_at = |off: usize| u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        let u32_at = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(Self {
            file_offset: u64_at(0),
            partition_id: u64_at(8),
            extent_id: u64_at(16),
            extent_offset: u64_at(24),
            size: u32_at(32),
            crc: u32_at(36),
        })
    }

    /// Returns true if the two extents name the same stored range on the
    /// same data partition, ignoring the file offset.
    pub fn same_storage(&self, other: &ExtentKey) -> bool {
        self.partition_id == other.partition_id
            && self.extent_id == other.extent_id
            && self.extent_offset == other.extent_offset
            && self.size == other.size
    }
}

/// File-offset-ordered, non-overlapping sequence of extent keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SortedExtents {
    keys: Vec<ExtentKey>,
}

impl SortedExtents {
    /// Creates an empty extent list.
    pub fn new() -> Self {
        Self { keys: Vec::new() }
    }

    /// Number of extents in the list.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the list holds no extents.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The extent keys in file-offset order.
    pub fn keys(&self) -> &[ExtentKey] {
        &self.keys
    }

    /// Total file size covered: the end offset of the last extent.
    pub fn covered_size(&self) -> u64 {
        self.keys.last().map(|k| k.end()).unwrap_or(0)
    }

    /// Sum of the sizes of all extents (holes excluded).
    pub fn total_bytes(&self) -> u64 {
        self.keys.iter().map(|k| k.size as u64).sum()
    }

    /// Appends an extent at or beyond the current end of file.
    ///
    /// If the new extent overlaps the tail, overlapped keys are trimmed or
    /// evicted; evicted keys are returned so their storage can be reclaimed.
    pub fn append(&mut self, ek: ExtentKey) -> Vec<ExtentKey> {
        let deleted = self.punch(ek.file_offset, ek.end());
        self.keys.push(ek);
        self.keys.sort_by_key(|k| k.file_offset);
        deleted
    }

    /// Inserts an extent at an arbitrary file offset, preserving non-overlap.
    ///
    /// Keys fully covered by the new range are evicted and returned; keys
    /// partially covered are split around it.
    pub fn insert(&mut self, ek: ExtentKey) -> Vec<ExtentKey> {
        self.append(ek)
    }

    /// Drops every extent at or beyond `new_size`, splitting the boundary
    /// extent if it straddles it. Returns the evicted keys.
    pub fn truncate(&mut self, new_size: u64) -> Vec<ExtentKey> {
        let mut deleted = Vec::new();
        let mut kept = Vec::with_capacity(self.keys.len());
        for k in self.keys.drain(..) {
            if k.end() <= new_size {
                kept.push(k);
            } else if k.file_offset >= new_size {
                deleted.push(k);
            } else {
                // Straddles the cut: keep the head, reclaim the tail.
                let keep_len = (new_size - k.file_offset) as u32;
                let mut head = k;
                head.size = keep_len;
                kept.push(head);
                let mut tail = k;
                tail.file_offset = new_size;
                tail.extent_offset = k.extent_offset + keep_len as u64;
                tail.size = k.size - keep_len;
                deleted.push(tail);
            }
        }
        self.keys = kept;
        deleted
    }

    /// Replaces `old` extents with `new` ones in a single step.
    ///
    /// Every key in `old` must be present verbatim; otherwise the merge is
    /// rejected and nothing changes.
    pub fn merge(&mut self, old: &[ExtentKey], new: &[ExtentKey]) -> Result<Vec<ExtentKey>, ()> {
        for o in old {
            if !self.keys.iter().any(|k| k == o) {
                return Err(());
            }
        }
        self.keys.retain(|k| !old.contains(k));
        let mut deleted = Vec::new();
        for n in new {
            deleted.extend(self.append(*n));
        }
        Ok(deleted)
    }

    /// Enumerates extents overlapping `[start, end)` in file-offset order.
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = &ExtentKey> {
        self.keys
            .iter()
            .filter(move |k| k.file_offset < end && k.end() > start)
    }

    /// Removes and returns up to `count` extents from the tail of the list.
    pub fn drain_tail(&mut self, count: usize) -> Vec<ExtentKey> {
        let split = self.keys.len().saturating_sub(count);
        self.keys.split_off(split)
    }

    /// Appends the encoding of every extent to `buf`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        for k in &self.keys {
            k.encode_to(buf);
        }
    }

    /// Decodes a whole buffer of fixed-width extent records.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() % ExtentKey::ENCODED_LEN != 0 {
            return Err(MetaError::Codec(format!(
                "extent list length {} not a multiple of {}",
                buf.len(),
                ExtentKey::ENCODED_LEN
            )));
        }
        let mut keys = Vec::with_capacity(buf.len() / ExtentKey::ENCODED_LEN);
        for chunk in buf.chunks_exact(ExtentKey::ENCODED_LEN) {
            keys.push(ExtentKey::decode(chunk)?);
        }
        Ok(Self { keys })
    }

    /// Removes keys overlapping `[start, end)`: fully covered keys are
    /// evicted, straddling keys are trimmed with only the overlapped part
    /// reported. Returns the storage ranges that became garbage.
    fn punch(&mut self, start: u64, end: u64) -> Vec<ExtentKey> {
        let mut deleted = Vec::new();
        let mut kept = Vec::with_capacity(self.keys.len());
        for k in self.keys.drain(..) {
            if k.end() <= start || k.file_offset >= end {
                kept.push(k);
                continue;
            }
            if k.file_offset < start {
                let keep_len = (start - k.file_offset) as u32;
                let mut head = k;
                head.size = keep_len;
                kept.push(head);
            }
            if k.end() > end {
                let skip = (end - k.file_offset) as u32;
                let mut tail = k;
                tail.file_offset = end;
                tail.extent_offset = k.extent_offset + skip as u64;
                tail.size = k.size - skip;
                kept.push(tail);
            }
            if k.file_offset >= start && k.end() <= end {
                // Fully covered; whole stored range is garbage.
                deleted.push(k);
            }
        }
        kept.sort_by_key(|k| k.file_offset);
        self.keys = kept;
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ek(file_offset: u64, size: u32) -> ExtentKey {
        ExtentKey {
            file_offset,
            partition_id: 7,
            extent_id: file_offset / 100 + 1,
            extent_offset: 0,
            size,
            crc: 0,
        }
    }

    #[test]
    fn test_extent_key_roundtrip() {
        let k = ExtentKey {
            file_offset: 4096,
            partition_id: 12,
            extent_id: 34,
            extent_offset: 8,
            size: 1024,
            crc: 0xdeadbeef,
        };
        let mut buf = Vec::new();
        k.encode_to(&mut buf);
        assert_eq!(buf.len(), ExtentKey::ENCODED_LEN);
        assert_eq!(ExtentKey::decode(&buf).unwrap(), k);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(ExtentKey::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_append_disjoint() {
        let mut se = SortedExtents::new();
        assert!(se.append(ek(0, 100)).is_empty());
        assert!(se.append(ek(100, 100)).is_empty());
        assert_eq!(se.len(), 2);
        assert_eq!(se.covered_size(), 200);
    }

    #[test]
    fn test_append_overwrites_tail() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 100));
        // Rewrites [100, 200) entirely.
        let deleted = se.append(ek(100, 100));
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].file_offset, 100);
        assert_eq!(se.len(), 2);
    }

    #[test]
    fn test_insert_splits_straddling_extent() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 300));
        let deleted = se.insert(ek(100, 100));
        // Straddled extent is trimmed, not evicted.
        assert!(deleted.is_empty());
        assert_eq!(se.len(), 3);
        let offs: Vec<u64> = se.keys().iter().map(|k| k.file_offset).collect();
        assert_eq!(offs, vec![0, 100, 200]);
        assert_eq!(se.keys()[0].size, 100);
        assert_eq!(se.keys()[2].size, 100);
        // Tail fragment addresses the original extent past the insert.
        assert_eq!(se.keys()[2].extent_offset, 200);
    }

    #[test]
    fn test_insert_evicts_covered_extents() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 100));
        se.append(ek(200, 100));
        let deleted = se.insert(ek(50, 200));
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].file_offset, 100);
        assert_eq!(se.covered_size(), 300);
    }

    #[test]
    fn test_truncate_drops_tail() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 100));
        let deleted = se.truncate(100);
        assert_eq!(deleted.len(), 1);
        assert_eq!(se.len(), 1);
        assert_eq!(se.covered_size(), 100);
    }

    #[test]
    fn test_truncate_splits_boundary() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 200));
        let deleted = se.truncate(150);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].file_offset, 150);
        assert_eq!(deleted[0].size, 50);
        assert_eq!(deleted[0].extent_offset, 150);
        assert_eq!(se.covered_size(), 150);
    }

    #[test]
    fn test_truncate_to_zero() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 100));
        let deleted = se.truncate(0);
        assert_eq!(deleted.len(), 2);
        assert!(se.is_empty());
    }

    #[test]
    fn test_merge_replaces_old_keys() {
        let mut se = SortedExtents::new();
        let a = ek(0, 100);
        let b = ek(100, 100);
        se.append(a);
        se.append(b);
        let merged = ExtentKey {
            file_offset: 0,
            partition_id: 9,
            extent_id: 77,
            extent_offset: 0,
            size: 200,
            crc: 0,
        };
        se.merge(&[a, b], &[merged]).unwrap();
        assert_eq!(se.len(), 1);
        assert_eq!(se.keys()[0], merged);
    }

    #[test]
    fn test_merge_rejects_missing_old_key() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        let missing = ek(500, 100);
        assert!(se.merge(&[missing], &[ek(0, 200)]).is_err());
        // Nothing changed.
        assert_eq!(se.len(), 1);
        assert_eq!(se.covered_size(), 100);
    }

    #[test]
    fn test_range_enumeration() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 100));
        se.append(ek(200, 100));
        let hits: Vec<u64> = se.range(50, 150).map(|k| k.file_offset).collect();
        assert_eq!(hits, vec![0, 100]);
    }

    #[test]
    fn test_drain_tail() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 100));
        se.append(ek(200, 100));
        let tail = se.drain_tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].file_offset, 100);
        assert_eq!(se.len(), 1);
    }

    #[test]
    fn test_list_roundtrip() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(100, 50));
        let mut buf = Vec::new();
        se.encode_to(&mut buf);
        let decoded = SortedExtents::decode(&buf).unwrap();
        assert_eq!(decoded, se);
    }

    #[test]
    fn test_list_decode_bad_length() {
        assert!(SortedExtents::decode(&[0u8; 41]).is_err());
    }

    #[test]
    fn test_total_bytes_excludes_holes() {
        let mut se = SortedExtents::new();
        se.append(ek(0, 100));
        se.append(ek(500, 100));
        assert_eq!(se.total_bytes(), 200);
        assert_eq!(se.covered_size(), 600);
    }
}
