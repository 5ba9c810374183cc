//! Leader-driven extent reclamation.
//!
//! One cooperative worker per partition drains the free list and the
//! extent-delete journal, batches extents by destination data partition,
//! and issues rate-limited delete RPCs. Nothing is forgotten on failure:
//! an inode whose extents were not all acknowledged goes back to the
//! front of the free list, and journal records survive until a
//! `SyncDelExtentsV2` proposal removes them on every replica. Re-running
//! a cycle after a crash re-issues deletes the data nodes already saw,
//! which they treat as idempotent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::backend::MetaBackend;
use crate::command::{CommandEnvelope, MetaCommand};
use crate::config::ReclaimConfig;
use crate::delete_wal::{self, pack_date};
use crate::extent::ExtentKey;
use crate::partition::Partition;
use crate::types::{InodeId, MetaError, Status};

/// Outbound surface to the data nodes. The real client lives in the
/// transport layer; tests script failures per data partition.
pub trait ExtentDeleter: Send + Sync {
    /// Deletes a batch of extents on one data partition. An error leaves
    /// every extent of the batch unacknowledged.
    fn delete_extents(&self, data_partition: u64, extents: &[ExtentKey]) -> Result<(), MetaError>;
}

/// Token bucket bounding delete-RPC rate. Callers that outrun it are
/// deferred to the next cycle rather than dropped.
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_per_ms: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, burst: u64) -> Self {
        Self {
            tokens: burst as f64,
            max_tokens: burst as f64,
            refill_per_ms: rate_per_sec as f64 / 1_000.0,
            last_refill_ms: u64::MAX,
        }
    }

    fn try_acquire(&mut self, n: f64, now_ms: u64) -> bool {
        if self.last_refill_ms == u64::MAX {
            self.last_refill_ms = now_ms;
        }
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        self.tokens = (self.tokens + elapsed as f64 * self.refill_per_ms).min(self.max_tokens);
        self.last_refill_ms = now_ms;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Counters from one reclaim cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Inodes drained from the free list.
    pub drained: usize,
    /// Inodes whose extents were fully acknowledged and proposed clean.
    pub cleaned: usize,
    /// Inodes deferred to a later cycle.
    pub deferred: usize,
    /// Journal records acknowledged and rotated out.
    pub journal_acked: usize,
    /// Journal records kept for retry.
    pub journal_deferred: usize,
    /// Delete RPC batches issued.
    pub rpc_batches: usize,
    /// Batches deferred by the rate limiter.
    pub throttled: usize,
}

/// The per-partition reclaim worker.
pub struct Reclaimer {
    partition: Arc<Partition>,
    deleter: Arc<dyn ExtentDeleter>,
    cfg: ReclaimConfig,
    bucket: Mutex<TokenBucket>,
    was_leader: Mutex<bool>,
    // Tail extents already acknowledged per oversized inode. Local-only:
    // a crash resets it and the deletes re-issue, which data nodes treat
    // as idempotent.
    progress: Mutex<HashMap<InodeId, usize>>,
}

impl Reclaimer {
    /// Creates a worker for `partition`.
    pub fn new(
        partition: Arc<Partition>,
        deleter: Arc<dyn ExtentDeleter>,
        cfg: ReclaimConfig,
    ) -> Self {
        let bucket = TokenBucket::new(cfg.rpc_rate_per_sec, cfg.rpc_burst);
        Self {
            partition,
            deleter,
            cfg,
            bucket: Mutex::new(bucket),
            was_leader: Mutex::new(false),
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one reclaim cycle at `now_ts` (unix seconds).
    pub fn run_cycle(&self, now_ts: u64) -> Result<CycleStats, MetaError> {
        let mut stats = CycleStats::default();
        if self.partition.is_stopped() || self.partition.is_halted() {
            return Ok(stats);
        }
        let is_leader = self.partition.is_leader();
        {
            let mut was = self.was_leader.lock().unwrap();
            if !is_leader {
                if *was {
                    // Lost leadership: drop transient queue state. The
                    // trash tree rebuilds it on the next promotion.
                    self.partition.applier().free_list().clear();
                    self.progress.lock().unwrap().clear();
                }
                *was = false;
                return Ok(stats);
            }
            if !*was {
                self.partition.rebuild_free_list()?;
                *was = true;
            }
        }

        self.reclaim_inodes(now_ts, &mut stats)?;
        self.reclaim_journal(now_ts, &mut stats)?;
        if stats != CycleStats::default() {
            tracing::debug!(partition = %self.partition.id(), ?stats, "reclaim cycle");
        }
        Ok(stats)
    }

    /// Inode-driven path: expired trash inodes from the free list.
    fn reclaim_inodes(&self, now_ts: u64, stats: &mut CycleStats) -> Result<(), MetaError> {
        let free_list = self.partition.applier().free_list();
        let drained = free_list.pop_batch(self.cfg.batch_count);
        stats.drained = drained.len();
        if drained.is_empty() {
            return Ok(());
        }

        // Candidate inodes with the extent slice worked this cycle.
        let mut candidates: Vec<(InodeId, Vec<ExtentKey>, bool, usize)> = Vec::new();
        for ino in drained {
            let (_, deleted) = self.partition.deleted_inode_get(ino)?;
            let Some(deleted) = deleted else {
                // Already cleaned by an earlier proposal.
                continue;
            };
            let keys = deleted.inode.extents.keys();
            let done = self
                .progress
                .lock()
                .unwrap()
                .get(&ino)
                .copied()
                .unwrap_or(0)
                .min(keys.len());
            let remaining = keys.len() - done;
            let take = remaining.min(self.cfg.max_extents_per_inode);
            // Bound per-cycle work from the tail; the front waits for a
            // later cycle, tracked by the progress marker.
            let slice = keys[keys.len() - done - take..keys.len() - done].to_vec();
            let complete = done + take == keys.len();
            for ek in &slice {
                let line = format!(
                    "ino {} dp {} ext {} off {} size {}",
                    ino, ek.partition_id, ek.extent_id, ek.extent_offset, ek.size
                );
                if let Err(e) = self.partition.inode_extent_audit().append(&line, now_ts) {
                    tracing::warn!(error = %e, "inode extent audit append failed");
                }
            }
            candidates.push((ino, slice, complete, take));
        }

        // Group extents by destination data partition.
        let mut groups: BTreeMap<u64, Vec<(usize, ExtentKey)>> = BTreeMap::new();
        for (idx, (_, slice, _, _)) in candidates.iter().enumerate() {
            for ek in slice {
                groups.entry(ek.partition_id).or_default().push((idx, *ek));
            }
        }

        let mut failed: HashSet<usize> = HashSet::new();
        for (dp, members) in groups {
            let extents: Vec<ExtentKey> = members.iter().map(|(_, ek)| *ek).collect();
            if !self.acquire_token(now_ts) {
                stats.throttled += 1;
                failed.extend(members.iter().map(|(idx, _)| *idx));
                continue;
            }
            stats.rpc_batches += 1;
            if let Err(e) = self.deleter.delete_extents(dp, &extents) {
                tracing::warn!(
                    partition = %self.partition.id(),
                    data_partition = dp,
                    error = %e,
                    "extent delete rpc failed; deferring owners"
                );
                failed.extend(members.iter().map(|(idx, _)| *idx));
            }
        }

        let mut to_clean = Vec::new();
        let mut deferred = Vec::new();
        for (idx, (ino, _, complete, take)) in candidates.iter().enumerate() {
            if failed.contains(&idx) {
                deferred.push(*ino);
            } else if !complete {
                // This slice acked; advance the tail marker and come back
                // for the rest next cycle.
                *self.progress.lock().unwrap().entry(*ino).or_insert(0) += take;
                deferred.push(*ino);
            } else {
                self.progress.lock().unwrap().remove(ino);
                to_clean.push(*ino);
            }
        }
        if !to_clean.is_empty() {
            let env = CommandEnvelope::internal(
                "reclaimer",
                MetaCommand::InternalCleanDeletedInode {
                    inos: to_clean.clone(),
                },
            );
            match self.partition.submit(env) {
                Ok(res) if res.status == Status::Ok => stats.cleaned = to_clean.len(),
                Ok(res) => {
                    tracing::warn!(status = %res.status, "free-inode proposal rejected");
                    deferred.extend(to_clean);
                }
                Err(e) => {
                    deferred.extend(to_clean);
                    stats.deferred = deferred.len();
                    for ino in deferred.into_iter().rev() {
                        self.partition.applier().free_list().push_front(ino);
                    }
                    return Err(e);
                }
            }
        }
        stats.deferred = deferred.len();
        for ino in deferred.into_iter().rev() {
            self.partition.applier().free_list().push_front(ino);
        }
        Ok(())
    }

    /// Journal-driven path: records dated before the cursor.
    fn reclaim_journal(&self, now_ts: u64, stats: &mut CycleStats) -> Result<(), MetaError> {
        let backend = self.partition.applier().backend();
        let mut cursor = backend.base_info()?.del_cursor;
        let today = pack_date(now_ts);
        if today > cursor {
            let env = CommandEnvelope::internal(
                "reclaimer",
                MetaCommand::SyncDelExtents { cursor: today },
            );
            if self.partition.submit(env)?.status == Status::Ok {
                cursor = today;
            }
        }
        let eligible = delete_wal::eligible_records(backend.as_ref(), cursor)?;
        if eligible.is_empty() {
            return Ok(());
        }
        for (_, ek) in &eligible {
            let line = format!(
                "dp {} ext {} off {} size {}",
                ek.partition_id, ek.extent_id, ek.extent_offset, ek.size
            );
            if let Err(e) = self.partition.extent_audit().append(&line, now_ts) {
                tracing::warn!(error = %e, "extent audit append failed");
            }
        }

        let mut groups: BTreeMap<u64, Vec<(Vec<u8>, ExtentKey)>> = BTreeMap::new();
        for (key, ek) in eligible {
            groups.entry(ek.partition_id).or_default().push((key, ek));
        }
        let mut survivors = Vec::new();
        for (dp, members) in groups {
            let extents: Vec<ExtentKey> = members.iter().map(|(_, ek)| *ek).collect();
            let acked = if !self.acquire_token(now_ts) {
                stats.throttled += 1;
                false
            } else {
                stats.rpc_batches += 1;
                match self.deleter.delete_extents(dp, &extents) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            data_partition = dp,
                            error = %e,
                            "journal extent delete rpc failed; records retained"
                        );
                        false
                    }
                }
            };
            if acked {
                stats.journal_acked += members.len();
            } else {
                stats.journal_deferred += members.len();
                survivors.extend(members.into_iter().map(|(key, _)| key));
            }
        }
        // Replicate the rotation: drop acked records everywhere, keep the
        // survivors for the next cycle.
        let env = CommandEnvelope::internal(
            "reclaimer",
            MetaCommand::SyncDelExtentsV2 {
                cursor,
                keys: survivors,
            },
        );
        self.partition.submit(env)?;
        Ok(())
    }

    fn acquire_token(&self, now_ts: u64) -> bool {
        self.bucket.lock().unwrap().try_acquire(1.0, now_ts * 1_000)
    }
}

/// The async shell: sleeps the configured interval between cycles and
/// exits promptly on the partition's stop signal.
pub async fn run_reclaimer(reclaimer: Arc<Reclaimer>, mut stop: watch::Receiver<bool>) {
    let interval =
        std::time::Duration::from_millis(reclaimer.cfg.effective_interval_ms());
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                let now_ts = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                if let Err(e) = reclaimer.run_cycle(now_ts) {
                    tracing::error!(
                        partition = %reclaimer.partition.id(),
                        error = %e,
                        "reclaim cycle failed"
                    );
                }
            }
        }
    }
    tracing::info!(partition = %reclaimer.partition.id(), "reclaimer exited");
}
