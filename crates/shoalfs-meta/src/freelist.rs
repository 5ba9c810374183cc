//! The free list: expired trash inodes awaiting extent reclamation.
//!
//! Process-local and never replicated; each replica rebuilds its own list
//! from the trash tree at startup, and the extent-delete journal keeps
//! the pipeline crash-safe. The list is bounded: when full, pushes are
//! refused and the inode is picked up again on a later trash scan.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::types::InodeId;

struct Inner {
    queue: VecDeque<InodeId>,
    members: HashSet<InodeId>,
}

/// Bounded FIFO of inode IDs ready for reclamation, with de-duplication.
pub struct FreeList {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl FreeList {
    /// Creates a list bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                members: HashSet::new(),
            }),
            capacity,
        }
    }

    /// Queues an inode. Returns false if it is already queued or the list
    /// is full.
    pub fn push(&self, ino: InodeId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.members.contains(&ino) || inner.queue.len() >= self.capacity {
            return false;
        }
        inner.members.insert(ino);
        inner.queue.push_back(ino);
        true
    }

    /// Re-queues an inode at the front for deferred retry. A full list
    /// still accepts retries so a failed RPC cannot lose the inode.
    pub fn push_front(&self, ino: InodeId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.members.insert(ino) {
            inner.queue.push_front(ino);
        }
    }

    /// Dequeues up to `count` inodes.
    pub fn pop_batch(&self, count: usize) -> Vec<InodeId> {
        let mut inner = self.inner.lock().unwrap();
        let n = count.min(inner.queue.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let ino = inner.queue.pop_front().unwrap();
            inner.members.remove(&ino);
            out.push(ino);
        }
        out
    }

    /// Number of queued inodes.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `ino` is currently queued.
    pub fn contains(&self, ino: InodeId) -> bool {
        self.inner.lock().unwrap().members.contains(&ino)
    }

    /// Drops everything. Used when a replica loses leadership; the trash
    /// tree remains the source of truth.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let fl = FreeList::new(10);
        assert!(fl.push(InodeId::new(1)));
        assert!(fl.push(InodeId::new(2)));
        assert_eq!(
            fl.pop_batch(10),
            vec![InodeId::new(1), InodeId::new(2)]
        );
        assert!(fl.is_empty());
    }

    #[test]
    fn test_push_deduplicates() {
        let fl = FreeList::new(10);
        assert!(fl.push(InodeId::new(1)));
        assert!(!fl.push(InodeId::new(1)));
        assert_eq!(fl.len(), 1);
    }

    #[test]
    fn test_push_refused_when_full() {
        let fl = FreeList::new(2);
        assert!(fl.push(InodeId::new(1)));
        assert!(fl.push(InodeId::new(2)));
        assert!(!fl.push(InodeId::new(3)));
    }

    #[test]
    fn test_push_front_orders_retry_first() {
        let fl = FreeList::new(10);
        fl.push(InodeId::new(1));
        fl.push_front(InodeId::new(9));
        assert_eq!(fl.pop_batch(1), vec![InodeId::new(9)]);
    }

    #[test]
    fn test_push_front_bypasses_capacity() {
        let fl = FreeList::new(1);
        fl.push(InodeId::new(1));
        fl.push_front(InodeId::new(2));
        assert_eq!(fl.len(), 2);
    }

    #[test]
    fn test_pop_batch_partial() {
        let fl = FreeList::new(10);
        fl.push(InodeId::new(1));
        assert_eq!(fl.pop_batch(5).len(), 1);
        assert!(fl.pop_batch(5).is_empty());
    }

    #[test]
    fn test_clear() {
        let fl = FreeList::new(10);
        fl.push(InodeId::new(1));
        fl.clear();
        assert!(fl.is_empty());
        assert!(!fl.contains(InodeId::new(1)));
    }

    #[test]
    fn test_popped_inode_can_be_requeued() {
        let fl = FreeList::new(10);
        fl.push(InodeId::new(1));
        fl.pop_batch(1);
        assert!(fl.push(InodeId::new(1)));
    }
}
