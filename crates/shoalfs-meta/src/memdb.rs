//! In-memory storage backend: one ordered tree per entity under a
//! read/write lock.
//!
//! Mutations stay staged in the write batch until commit, so readers only
//! ever observe fully applied commands. `get` hands out owned copies;
//! Rust's value semantics give copy-on-read without an explicit clone
//! call at the call sites. This backend does not persist across restarts;
//! a replica rebuilds from a raft snapshot plus log replay.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::backend::{
    lookup_through, BaseInfo, BatchOp, MetaBackend, PutOutcome, SnapshotTriple, TreeTag,
    WriteBatch,
};
use crate::types::MetaError;

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

struct Trees {
    tables: [Tree; 7],
    base: BaseInfo,
}

/// In-memory meta backend.
pub struct MemBackend {
    inner: RwLock<Trees>,
}

impl MemBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Trees {
                tables: Default::default(),
                base: BaseInfo::default(),
            }),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Trees>, MetaError> {
        self.inner
            .read()
            .map_err(|e| MetaError::Backend(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Trees>, MetaError> {
        self.inner
            .write()
            .map_err(|e| MetaError::Backend(e.to_string()))
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaBackend for MemBackend {
    fn commit(&self, batch: WriteBatch, base: &BaseInfo) -> Result<(), MetaError> {
        let mut trees = self.write()?;
        for op in batch.ops {
            match op {
                BatchOp::Put { tag, key, value } => {
                    trees.tables[tag.table_index()].insert(key, value);
                }
                BatchOp::Delete { tag, key } => {
                    trees.tables[tag.table_index()].remove(&key);
                }
            }
        }
        trees.base = base.clone();
        Ok(())
    }

    fn get(&self, tag: TreeTag, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let trees = self.read()?;
        Ok(trees.tables[tag.table_index()].get(key).cloned())
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
        let trees = self.read()?;
        let lower = Bound::Included(start.to_vec());
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        for (k, v) in trees.tables[tag.table_index()].range::<Vec<u8>, _>((lower, upper)) {
            if !cb(k, v)? {
                break;
            }
        }
        Ok(())
    }

    fn max_key(&self, tag: TreeTag) -> Result<Option<Vec<u8>>, MetaError> {
        let trees = self.read()?;
        Ok(trees.tables[tag.table_index()]
            .last_key_value()
            .map(|(k, _)| k.clone()))
    }

    fn len(&self, tag: TreeTag) -> Result<u64, MetaError> {
        let trees = self.read()?;
        Ok(trees.tables[tag.table_index()].len() as u64)
    }

    fn base_info(&self) -> Result<BaseInfo, MetaError> {
        let trees = self.read()?;
        Ok(trees.base.clone())
    }

    fn snapshot_triples(&self) -> Result<Vec<SnapshotTriple>, MetaError> {
        let trees = self.read()?;
        let mut out = Vec::new();
        for tag in TreeTag::ALL_TABLES {
            for (k, v) in &trees.tables[tag.table_index()] {
                out.push((tag, k.clone(), v.clone()));
            }
        }
        Ok(out)
    }

    fn clear(&self) -> Result<(), MetaError> {
        let mut trees = self.write()?;
        for table in trees.tables.iter_mut() {
            table.clear();
        }
        trees.base = BaseInfo::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_base(backend: &MemBackend, batch: &WriteBatch) -> BaseInfo {
        let mut base = backend.base_info().unwrap();
        base.applied_index += 1;
        for (i, d) in batch.count_deltas.iter().enumerate() {
            base.counts[i] = (base.counts[i] as i64 + d) as u64;
        }
        base
    }

    #[test]
    fn test_staged_put_invisible_until_commit() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![10], true)
            .unwrap();
        assert_eq!(db.get(TreeTag::Inode, &[1]).unwrap(), None);
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();
        assert_eq!(db.get(TreeTag::Inode, &[1]).unwrap(), Some(vec![10]));
    }

    #[test]
    fn test_put_no_replace_reports_prior() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![10], true)
            .unwrap();
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();

        let mut batch = db.begin();
        let out = db
            .put(&mut batch, TreeTag::Inode, vec![1], vec![20], false)
            .unwrap();
        assert!(!out.inserted);
        assert_eq!(out.prior, Some(vec![10]));
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();
        // Not replaced.
        assert_eq!(db.get(TreeTag::Inode, &[1]).unwrap(), Some(vec![10]));
    }

    #[test]
    fn test_put_observes_same_batch() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![10], true)
            .unwrap();
        let out = db
            .put(&mut batch, TreeTag::Inode, vec![1], vec![20], true)
            .unwrap();
        assert!(!out.inserted);
        assert_eq!(out.prior, Some(vec![10]));
    }

    #[test]
    fn test_delete_reports_existence() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        assert!(!db.delete(&mut batch, TreeTag::Inode, &[1]).unwrap());
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![10], true)
            .unwrap();
        assert!(db.delete(&mut batch, TreeTag::Inode, &[1]).unwrap());
    }

    #[test]
    fn test_range_bounds_and_early_stop() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        for k in 1u8..=5 {
            db.put(&mut batch, TreeTag::Dentry, vec![k], vec![k], true)
                .unwrap();
        }
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();

        let mut seen = Vec::new();
        db.range(TreeTag::Dentry, &[2], Some(&[5]), &mut |k, _| {
            seen.push(k[0]);
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![2, 3, 4]);

        let mut seen = Vec::new();
        db.range(TreeTag::Dentry, &[1], None, &mut |k, _| {
            seen.push(k[0]);
            Ok(k[0] < 2)
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_max_key_and_len() {
        let db = MemBackend::new();
        assert_eq!(db.max_key(TreeTag::Inode).unwrap(), None);
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![3], vec![], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![], true)
            .unwrap();
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();
        assert_eq!(db.max_key(TreeTag::Inode).unwrap(), Some(vec![3]));
        assert_eq!(db.len(TreeTag::Inode).unwrap(), 2);
    }

    #[test]
    fn test_snapshot_triples_fixed_order() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Dentry, vec![2], vec![2], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Inode, vec![9], vec![9], true)
            .unwrap();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![1], true)
            .unwrap();
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();

        let triples = db.snapshot_triples().unwrap();
        let tags: Vec<TreeTag> = triples.iter().map(|(t, _, _)| *t).collect();
        assert_eq!(tags, vec![TreeTag::Inode, TreeTag::Inode, TreeTag::Dentry]);
        assert_eq!(triples[0].1, vec![1]);
        assert_eq!(triples[1].1, vec![9]);
    }

    #[test]
    fn test_clear_wipes_everything() {
        let db = MemBackend::new();
        let mut batch = db.begin();
        db.put(&mut batch, TreeTag::Inode, vec![1], vec![1], true)
            .unwrap();
        let mut base = commit_base(&db, &batch);
        base.cursor = 77;
        db.commit(batch, &base).unwrap();

        db.clear().unwrap();
        assert_eq!(db.len(TreeTag::Inode).unwrap(), 0);
        assert_eq!(db.base_info().unwrap(), BaseInfo::default());
    }

    #[test]
    fn test_commit_bumps_applied_index() {
        let db = MemBackend::new();
        let batch = db.begin();
        let base = commit_base(&db, &batch);
        db.commit(batch, &base).unwrap();
        assert_eq!(db.base_info().unwrap().applied_index, 1);
    }
}
