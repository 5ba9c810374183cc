//! Request-deduplication ledger.
//!
//! Every mutating client request carries a fingerprint; a retried request
//! must observe the response code its first execution produced instead of
//! re-running the operation. The ledger is replicated state: entries are
//! recorded during apply using the command's own timestamp, so every
//! replica evicts identically, and the ledger travels inside partition
//! snapshots.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{MetaError, Status};

/// Identity of one client request.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RequestFingerprint {
    /// Client identifier.
    pub client_id: u64,
    /// Client process start time, to disambiguate ID reuse.
    pub client_start: u64,
    /// Per-client request sequence number.
    pub request_id: u64,
    /// Client IPv4 address.
    pub client_ip: u32,
    /// CRC of the request payload.
    pub payload_crc: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerEntry {
    status: Status,
    recorded_ms: u64,
}

/// Bounded ordered set of recent request fingerprints with their response
/// codes.
///
/// Eviction is LRU by record time, but an entry younger than the retry
/// window is never evicted even when the ledger is over capacity: a
/// client may still legitimately retry it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupLedger {
    entries: BTreeMap<RequestFingerprint, LedgerEntry>,
    order: VecDeque<RequestFingerprint>,
    capacity: usize,
    retain_ms: u64,
    // Monotone command clock; commands without a timestamp reuse the
    // latest one seen so replay stays deterministic.
    clock_ms: u64,
}

impl DedupLedger {
    /// Creates a ledger bounded to `capacity` entries, retaining every
    /// entry for at least `retain_ms` regardless of pressure.
    pub fn new(capacity: usize, retain_ms: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            order: VecDeque::new(),
            capacity,
            retain_ms,
            clock_ms: 0,
        }
    }

    /// Number of tracked fingerprints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no fingerprints are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the response code previously produced for a fingerprint.
    pub fn check(&self, fp: &RequestFingerprint) -> Option<Status> {
        self.entries.get(fp).map(|e| e.status)
    }

    /// Records the response produced for a fingerprint at `now_ms`
    /// (command time, not wall clock) and evicts what the bound allows.
    /// A `now_ms` of zero (command without a timestamp) reuses the latest
    /// command time seen.
    pub fn record(&mut self, fp: RequestFingerprint, status: Status, now_ms: u64) {
        let now_ms = now_ms.max(self.clock_ms);
        self.clock_ms = now_ms;
        if self
            .entries
            .insert(
                fp,
                LedgerEntry {
                    status,
                    recorded_ms: now_ms,
                },
            )
            .is_none()
        {
            self.order.push_back(fp);
        }
        self.evict(now_ms);
    }

    fn evict(&mut self, now_ms: u64) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.front().copied() else {
                break;
            };
            let evictable = match self.entries.get(&oldest) {
                Some(e) => now_ms.saturating_sub(e.recorded_ms) >= self.retain_ms,
                // Stale order entry from an overwrite; drop it.
                None => true,
            };
            if !evictable {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&oldest);
        }
    }

    /// Serializes the ledger for inclusion in a partition snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>, MetaError> {
        bincode::serialize(self).map_err(|e| MetaError::Snapshot(e.to_string()))
    }

    /// Restores a ledger from snapshot bytes.
    pub fn restore(buf: &[u8]) -> Result<Self, MetaError> {
        bincode::deserialize(buf).map_err(|e| MetaError::Snapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(request_id: u64) -> RequestFingerprint {
        RequestFingerprint {
            client_id: 1,
            client_start: 1_700_000_000,
            request_id,
            client_ip: 0x0a000001,
            payload_crc: 0,
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let mut ledger = DedupLedger::new(16, 60_000);
        assert_eq!(ledger.check(&fp(1)), None);
        ledger.record(fp(1), Status::Ok, 1000);
        assert_eq!(ledger.check(&fp(1)), Some(Status::Ok));
    }

    #[test]
    fn test_distinct_fingerprints_do_not_collide() {
        let mut ledger = DedupLedger::new(16, 60_000);
        ledger.record(fp(1), Status::Ok, 1000);
        assert_eq!(ledger.check(&fp(2)), None);
        let mut other_client = fp(1);
        other_client.client_id = 2;
        assert_eq!(ledger.check(&other_client), None);
    }

    #[test]
    fn test_over_capacity_evicts_old_entries() {
        let mut ledger = DedupLedger::new(2, 1000);
        ledger.record(fp(1), Status::Ok, 0);
        ledger.record(fp(2), Status::Ok, 0);
        // Third entry arrives long after the retry window.
        ledger.record(fp(3), Status::Exists, 10_000);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.check(&fp(1)), None);
        assert_eq!(ledger.check(&fp(3)), Some(Status::Exists));
    }

    #[test]
    fn test_young_entries_survive_pressure() {
        let mut ledger = DedupLedger::new(1, 60_000);
        ledger.record(fp(1), Status::Ok, 1000);
        ledger.record(fp(2), Status::Ok, 2000);
        // fp(1) is over capacity but inside the retry window.
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.check(&fp(1)), Some(Status::Ok));
    }

    #[test]
    fn test_re_record_keeps_single_entry() {
        let mut ledger = DedupLedger::new(16, 60_000);
        ledger.record(fp(1), Status::Ok, 1000);
        ledger.record(fp(1), Status::Ok, 2000);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut ledger = DedupLedger::new(16, 60_000);
        ledger.record(fp(1), Status::Ok, 1000);
        ledger.record(fp(2), Status::NotExist, 2000);
        let buf = ledger.snapshot().unwrap();
        let restored = DedupLedger::restore(&buf).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.check(&fp(2)), Some(Status::NotExist));
    }
}
