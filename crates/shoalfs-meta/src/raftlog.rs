//! The consensus seam.
//!
//! Raft itself is an external library from this crate's point of view:
//! it orders commands, elects leaders, and streams snapshots. The state
//! machine only needs the narrow surface below: propose a command and
//! learn the index it applied at. [`LocalRaft`] is the in-process,
//! single-replica realization used by tests and standalone deployments;
//! it preserves the contract that proposals are single-writer per
//! partition and that `propose` returns only after the local apply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::applier::{Applier, ApplyResult};
use crate::command::CommandEnvelope;
use crate::types::MetaError;

/// Where ordered commands land: the partition's state machine.
pub trait CommandSink: Send + Sync {
    /// Applies one command at the given index.
    fn apply_command(&self, env: &CommandEnvelope, index: u64) -> Result<ApplyResult, MetaError>;
}

impl CommandSink for Applier {
    fn apply_command(&self, env: &CommandEnvelope, index: u64) -> Result<ApplyResult, MetaError> {
        self.apply(env, index)
    }
}

/// The consensus surface the partition depends on.
pub trait RaftLog: Send + Sync {
    /// Replicates a command and blocks until it applies locally.
    fn propose(&self, env: &CommandEnvelope) -> Result<(u64, ApplyResult), MetaError>;

    /// True when this replica is the group leader.
    fn is_leader(&self) -> bool;

    /// Address of the current leader, when known.
    fn leader_addr(&self) -> Option<String>;
}

/// Single-replica raft: commands apply immediately in proposal order.
pub struct LocalRaft {
    sink: Arc<dyn CommandSink>,
    last_index: Mutex<u64>,
    leader: AtomicBool,
}

impl LocalRaft {
    /// Creates a log resuming after `applied_index` (from the backend's
    /// base-info record).
    pub fn new(sink: Arc<dyn CommandSink>, applied_index: u64) -> Self {
        Self {
            sink,
            last_index: Mutex::new(applied_index),
            leader: AtomicBool::new(true),
        }
    }

    /// Flips leadership, for tests exercising follower behavior.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl RaftLog for LocalRaft {
    fn propose(&self, env: &CommandEnvelope) -> Result<(u64, ApplyResult), MetaError> {
        if !self.is_leader() {
            return Err(MetaError::NotLeader { leader_hint: None });
        }
        // Proposals are single-writer: the index is assigned and applied
        // under one lock so no gap or reorder is observable.
        let mut last = self
            .last_index
            .lock()
            .map_err(|e| MetaError::Raft(e.to_string()))?;
        let index = *last + 1;
        let result = self.sink.apply_command(env, index)?;
        *last = index;
        Ok((index, result))
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_addr(&self) -> Option<String> {
        None
    }
}
