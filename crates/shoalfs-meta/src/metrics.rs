//! Metadata operation metrics collector.
//!
//! Tracks operation counts, latencies, and error rates per partition for
//! monitoring. In-process only; scraping and export belong to the admin
//! surface.

use std::collections::HashMap;
use std::sync::RwLock;

/// Operation classes tracked by the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricOp {
    /// Inode creation.
    CreateInode,
    /// Inode unlink (single or batch).
    UnlinkInode,
    /// Trash eviction.
    EvictInode,
    /// Attribute update.
    SetAttr,
    /// Dentry creation.
    CreateDentry,
    /// Dentry removal.
    DeleteDentry,
    /// Extent append/insert/truncate/merge.
    ExtentUpdate,
    /// Extended attribute update.
    Xattr,
    /// Multipart upload operation.
    Multipart,
    /// Trash recover or clean.
    Trash,
    /// Point inode read.
    InodeGet,
    /// Name resolution.
    Lookup,
    /// Directory listing.
    ReadDir,
    /// Partition statistics.
    StatFs,
    /// Reclaimer cycle.
    Reclaim,
}

impl MetricOp {
    /// Stable label for logs and dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricOp::CreateInode => "create_inode",
            MetricOp::UnlinkInode => "unlink_inode",
            MetricOp::EvictInode => "evict_inode",
            MetricOp::SetAttr => "set_attr",
            MetricOp::CreateDentry => "create_dentry",
            MetricOp::DeleteDentry => "delete_dentry",
            MetricOp::ExtentUpdate => "extent_update",
            MetricOp::Xattr => "xattr",
            MetricOp::Multipart => "multipart",
            MetricOp::Trash => "trash",
            MetricOp::InodeGet => "inode_get",
            MetricOp::Lookup => "lookup",
            MetricOp::ReadDir => "read_dir",
            MetricOp::StatFs => "stat_fs",
            MetricOp::Reclaim => "reclaim",
        }
    }
}

/// Per-operation aggregates.
#[derive(Clone, Debug, Default)]
pub struct OpMetrics {
    /// Number of operations.
    pub count: u64,
    /// Number of failed operations.
    pub errors: u64,
    /// Total duration in microseconds.
    pub total_duration_us: u64,
    /// Maximum duration in microseconds.
    pub max_duration_us: u64,
}

impl OpMetrics {
    /// Average duration in microseconds.
    pub fn avg_duration_us(&self) -> u64 {
        if self.count > 0 {
            self.total_duration_us / self.count
        } else {
            0
        }
    }

    /// Errors over total operations.
    pub fn error_rate(&self) -> f64 {
        if self.count > 0 {
            self.errors as f64 / self.count as f64
        } else {
            0.0
        }
    }
}

/// Collects operation metrics for one partition or the whole node.
pub struct MetricsCollector {
    ops: RwLock<HashMap<MetricOp, OpMetrics>>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self {
            ops: RwLock::new(HashMap::new()),
        }
    }

    /// Records one operation.
    pub fn record(&self, op: MetricOp, duration_us: u64, ok: bool) {
        let mut ops = self.ops.write().unwrap();
        let m = ops.entry(op).or_default();
        m.count += 1;
        if !ok {
            m.errors += 1;
        }
        m.total_duration_us += duration_us;
        m.max_duration_us = m.max_duration_us.max(duration_us);
    }

    /// Snapshot of one operation's aggregates.
    pub fn get(&self, op: MetricOp) -> OpMetrics {
        let ops = self.ops.read().unwrap();
        ops.get(&op).cloned().unwrap_or_default()
    }

    /// Snapshot of every tracked operation.
    pub fn dump(&self) -> Vec<(MetricOp, OpMetrics)> {
        let ops = self.ops.read().unwrap();
        let mut out: Vec<_> = ops.iter().map(|(k, v)| (*k, v.clone())).collect();
        out.sort_by_key(|(k, _)| k.as_str());
        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
