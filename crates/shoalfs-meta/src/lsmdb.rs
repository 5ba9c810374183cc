//! Persistent LSM storage backend over rocksdb.
//!
//! All trees share a single key space; the first byte of every on-disk
//! key is the tree tag, so per-tree ranges are bounded by adjacent tag
//! values. The base-info record (applied index, cursor, counters) is
//! written inside the same write batch as the command's mutations, which
//! makes apply atomic with respect to visibility: after a crash, either
//! the whole command is present together with its index bump, or none of
//! it is.

use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch as DbBatch, DB};

use crate::backend::{
    lookup_through, BaseInfo, BatchOp, MetaBackend, PutOutcome, SnapshotTriple, TreeTag,
    WriteBatch,
};
use crate::types::MetaError;

/// The single-byte key of the base-info record.
const BASE_INFO_KEY: [u8; 1] = [TreeTag::BaseInfo as u8];

fn db_err(e: rocksdb::Error) -> MetaError {
    MetaError::Backend(e.to_string())
}

fn tagged(tag: TreeTag, key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + key.len());
    k.push(tag.as_u8());
    k.extend_from_slice(key);
    k
}

/// Exclusive upper bound of a tree's on-disk key range.
fn tag_upper(tag: TreeTag) -> [u8; 1] {
    [tag.as_u8() + 1]
}

/// Rocksdb-backed meta backend.
pub struct LsmBackend {
    db: DB,
}

impl LsmBackend {
    /// Opens (or creates) the store under `path`.
    pub fn open(path: &Path) -> Result<Self, MetaError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(db_err)?;
        Ok(Self { db })
    }
}

impl MetaBackend for LsmBackend {
    fn commit(&self, batch: WriteBatch, base: &BaseInfo) -> Result<(), MetaError> {
        let mut db_batch = DbBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { tag, key, value } => db_batch.put(tagged(tag, &key), value),
                BatchOp::Delete { tag, key } => db_batch.delete(tagged(tag, &key)),
            }
        }
        db_batch.put(BASE_INFO_KEY, base.encode());
        self.db.write(db_batch).map_err(db_err)
    }

    fn get(&self, tag: TreeTag, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        self.db.get(tagged(tag, key)).map_err(db_err)
    }

    fn put(
        &self,
        batch: &mut WriteBatch,
        tag: TreeTag,
        key: Vec<u8>,
        value: Vec<u8>,
        replace: bool,
    ) -> Result<PutOutcome, MetaError> {
        let prior = lookup_through(self, batch, tag, &key)?;
        let inserted = prior.is_none();
        if inserted || replace {
            batch.stage_put(tag, key, value, inserted);
        }
        Ok(PutOutcome { prior, inserted })
    }

    fn delete(
        &self,
        batch: &mut WriteBatch,
        tag: TreeTag,
        key: &[u8],
    ) -> Result<bool, MetaError> {
        let existed = lookup_through(self, batch, tag, key)?.is_some();
        if existed {
            batch.stage_delete(tag, key.to_vec());
        }
        Ok(existed)
    }

    fn range(
        &self,
        tag: TreeTag,
        start: &[u8],
        end: Option<&[u8]>,
        cb: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, MetaError>,
    ) -> Result<(), MetaError> {
        let lower = tagged(tag, start);
        let upper = match end {
            Some(e) => tagged(tag, e),
            None => tag_upper(tag).to_vec(),
        };
        let iter = self
            .db
            .iterator(IteratorMode::From(&lower, Direction::Forward));
        for item in iter {
            let (k, v) = item.map_err(db_err)?;
            if k.as_ref() >= upper.as_slice() {
                break;
            }
            if !cb(&k[1..], &v)? {
                break;
            }
        }
        Ok(())
    }

    fn max_key(&self, tag: TreeTag) -> Result<Option<Vec<u8>>, MetaError> {
        let upper = tag_upper(tag);
        let mut iter = self
            .db
            .iterator(IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (k, _) = item.map_err(db_err)?;
                if k.first() == Some(&tag.as_u8()) {
                    Ok(Some(k[1..].to_vec()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn len(&self, tag: TreeTag) -> Result<u64, MetaError> {
        // Cardinalities are maintained in base-info; a full scan per call
        // would defeat the point of the LSM backend.
        Ok(self.base_info()?.count(tag))
    }

    fn base_info(&self) -> Result<BaseInfo, MetaError> {
        match self.db.get(BASE_INFO_KEY).map_err(db_err)? {
            Some(buf) => BaseInfo::decode(&buf),
            None => Ok(BaseInfo::default()),
        }
    }

    fn snapshot_triples(&self) -> Result<Vec<SnapshotTriple>, MetaError> {
        let snap = self.db.snapshot();
        let mut out = Vec::new();
        for tag in TreeTag::ALL_TABLES {
            let lower = [tag.as_u8()];
            let upper = tag_upper(tag);
            let iter = snap.iterator(IteratorMode::From(&lower, Direction::Forward));
            for item in iter {
                let (k, v) = item.map_err(db_err)?;
                if k.as_ref() >= upper.as_slice() {
                    break;
                }
                out.push((tag, k[1..].to_vec(), v.to_vec()));
            }
        }
        Ok(out)
    }

    fn clear(&self) -> Result<(), MetaError> {
        let mut db_batch = DbBatch::default();
        db_batch.delete_range([0u8], [TreeTag::ExtentDel.as_u8() + 1]);
        self.db.write(db_batch).map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, LsmBackend) {
        let dir = tempfile::tempdir().unwrap();
        let db = LsmBackend::open(dir.path()).unwrap();
        (dir, db)
    }

    fn commit_one(db: &LsmBackend, batch: WriteBatch) {
        let mut base = db.base_info().unwrap();
        base.applied_index += 1;
        for (i, d) in batch.count_deltas.iter().enumerate() {
            base.counts[i] = (base.counts[i] as i64 + d) as u64;
        }
        db.commit(batch, &base).unwrap();
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, db) = open_temp();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1, 2], vec![9], true)
            .unwrap();
        commit_one(&db, batch);
        assert_eq!(db.get(TreeTag::Inode, &[1, 2]).unwrap(), Some(vec![9]));
        // Same raw key under a different tag is a different entry.
        assert_eq!(db.get(TreeTag::Dentry, &[1, 2]).unwrap(), None);
    }

    #[test]
    fn test_applied_index_atomic_with_batch() {
        let (_dir, db) = open_temp();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![1], true)
            .unwrap();
        commit_one(&db, batch);
        let base = db.base_info().unwrap();
        assert_eq!(base.applied_index, 1);
        assert_eq!(base.count(TreeTag::Inode), 1);
    }

    #[test]
    fn test_range_respects_tag_boundaries() {
        let (_dir, db) = open_temp();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![1], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Dentry, vec![0], vec![2], true)
            .unwrap();
        commit_one(&db, batch);

        let mut seen = Vec::new();
        db.range(TreeTag::Inode, &[], None, &mut |k, _| {
            seen.push(k.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![vec![1]]);
    }

    #[test]
    fn test_max_key_per_tag() {
        let (_dir, db) = open_temp();
        assert_eq!(db.max_key(TreeTag::Inode).unwrap(), None);
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![5], vec![], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Inode, vec![3], vec![], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Dentry, vec![200], vec![], true)
            .unwrap();
        commit_one(&db, batch);
        assert_eq!(db.max_key(TreeTag::Inode).unwrap(), Some(vec![5]));
        assert_eq!(db.max_key(TreeTag::Multipart).unwrap(), None);
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = LsmBackend::open(dir.path()).unwrap();
            let mut batch = db.begin();
            db.put(&mut batch, TreeTag::Inode, vec![1], vec![42], true)
                .unwrap();
            commit_one(&db, batch);
        }
        let db = LsmBackend::open(dir.path()).unwrap();
        assert_eq!(db.get(TreeTag::Inode, &[1]).unwrap(), Some(vec![42]));
        assert_eq!(db.base_info().unwrap().applied_index, 1);
    }

    #[test]
    fn test_snapshot_triples_order() {
        let (_dir, db) = open_temp();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::DeletedInode, vec![1], vec![1], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Inode, vec![2], vec![2], true)
            .unwrap();
        commit_one(&db, batch);
        let triples = db.snapshot_triples().unwrap();
        let tags: Vec<TreeTag> = triples.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(tags, vec![TreeTag::Inode, TreeTag::DeletedInode]);
    }

    #[test]
    fn test_clear() {
        let (_dir, db) = open_temp();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![1], true)
            .unwrap();
        commit_one(&db, batch);
        db.clear().unwrap();
        assert_eq!(db.get(TreeTag::Inode, &[1]).unwrap(), None);
        assert_eq!(db.base_info().unwrap(), BaseInfo::default());
    }
}
