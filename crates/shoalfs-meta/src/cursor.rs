//! Inode-ID allocation within a partition's `[start, end]` range.
//!
//! The cursor value itself is replicated state (it lives in the backend's
//! base-info record); this module holds the pure allocation and reset
//! rules so every replica computes identical outcomes during apply.

use crate::command::CursorMode;
use crate::types::Status;

/// The inode-ID range a partition owns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InodeRange {
    /// First allocatable ID.
    pub start: u64,
    /// Last allocatable ID (inclusive).
    pub end: u64,
}

impl InodeRange {
    /// Creates a range. `start` must be at least 1 and not exceed `end`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start >= 1 && start <= end);
        Self { start, end }
    }

    /// Returns true if `ino` falls inside the range.
    pub fn contains(&self, ino: u64) -> bool {
        ino >= self.start && ino <= self.end
    }

    /// True for the volume's last partition, whose range is unbounded.
    pub fn is_max_partition(&self) -> bool {
        self.end == u64::MAX
    }

    /// True once the cursor has consumed the whole range.
    pub fn is_exhausted(&self, cursor: u64) -> bool {
        cursor >= self.end
    }

    /// Draws the next inode ID given the current cursor (the last
    /// allocated ID, or zero before the first allocation).
    pub fn next_id(&self, cursor: u64) -> Result<u64, Status> {
        if self.is_exhausted(cursor) {
            return Err(Status::InodeFull);
        }
        Ok(if cursor < self.start {
            self.start
        } else {
            cursor + 1
        })
    }

    /// Validates a cursor reset and computes the new cursor value.
    ///
    /// `Add` freezes the partition by raising the cursor to the end of the
    /// range. `Sub` re-opens a frozen partition by lowering the cursor,
    /// but only when the partition is actually read-only, the requested
    /// cursor clears the maximum allocated ID, and enough of the range
    /// would be reclaimed to be worth replicating. Never valid on the max
    /// partition.
    pub fn validate_reset(
        &self,
        mode: CursorMode,
        cursor: u64,
        new_cursor: u64,
        max_ino: u64,
        min_headroom: u64,
    ) -> Result<u64, Status> {
        if self.is_max_partition() {
            return Err(Status::AccessDenied);
        }
        match mode {
            CursorMode::Add => Ok(self.end),
            CursorMode::Sub => {
                if !self.is_exhausted(cursor) {
                    // Operation mismatch: Sub is only for frozen partitions.
                    return Err(Status::AccessDenied);
                }
                if new_cursor <= max_ino {
                    return Err(Status::OutOfRange);
                }
                if self.end - new_cursor < min_headroom {
                    return Err(Status::OutOfRange);
                }
                Ok(new_cursor)
            }
        }
    }
}
