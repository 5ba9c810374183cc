//! Rotated append-only audit files for operator forensics.
//!
//! Each partition keeps sidecar logs (`delete_extent_key_list`,
//! `inode_delete_extent_key_list`, `INODE_DEL`) recording every extent
//! and inode handed to the reclaimer. Files rotate on size and age into
//! `<name>.bak_<ts>` siblings, and the backups are capped by total bytes
//! with the oldest dropped first. Loss of an audit file never affects
//! correctness; the journal in the backend is the source of truth.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::MetaError;

/// Rotation policy for one audit file.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RotateConfig {
    /// Rotate once the active file exceeds this many bytes.
    pub max_bytes: u64,
    /// Rotate once the active file is older than this many seconds.
    pub max_age_secs: u64,
    /// Drop oldest backups once active + backups exceed this many bytes.
    pub total_cap_bytes: u64,
}

impl Default for RotateConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 << 20,
            max_age_secs: 7 * 86_400,
            total_cap_bytes: 200 << 20,
        }
    }
}

struct State {
    file: Option<File>,
    written: u64,
    opened_ts: u64,
}

/// One append-only, rotated audit file.
pub struct AuditLog {
    dir: PathBuf,
    name: String,
    cfg: RotateConfig,
    state: Mutex<State>,
}

impl AuditLog {
    /// Opens (creating if absent) `<dir>/<name>`.
    pub fn open(dir: &Path, name: &str, cfg: RotateConfig, now_ts: u64) -> Result<Self, MetaError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            cfg,
            state: Mutex::new(State {
                file: Some(file),
                written,
                opened_ts: now_ts,
            }),
        })
    }

    /// Appends one record line, rotating first if the policy requires.
    pub fn append(&self, record: &str, now_ts: u64) -> Result<(), MetaError> {
        let mut state = self.state.lock().unwrap();
        let due = state.written >= self.cfg.max_bytes
            || now_ts.saturating_sub(state.opened_ts) >= self.cfg.max_age_secs;
        if due && state.written > 0 {
            self.rotate_locked(&mut state, now_ts)?;
        }
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| MetaError::Backend("audit file closed".to_string()))?;
        file.write_all(record.as_bytes())?;
        file.write_all(b"\n")?;
        state.written += record.len() as u64 + 1;
        Ok(())
    }

    /// Bytes written to the active file.
    pub fn active_bytes(&self) -> u64 {
        self.state.lock().unwrap().written
    }

    /// Lists backup file paths, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>, MetaError> {
        let prefix = format!("{}.bak_", self.name);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let fname = entry.file_name();
            if fname.to_string_lossy().starts_with(&prefix) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    fn rotate_locked(&self, state: &mut State, now_ts: u64) -> Result<(), MetaError> {
        state.file = None;
        let active = self.dir.join(&self.name);
        let mut backup = self.dir.join(format!("{}.bak_{}", self.name, now_ts));
        // A same-second rotation must not clobber the previous backup.
        let mut n = 0;
        while backup.exists() {
            n += 1;
            backup = self.dir.join(format!("{}.bak_{}_{}", self.name, now_ts, n));
        }
        std::fs::rename(&active, &backup)?;
        tracing::info!(
            file = %active.display(),
            backup = %backup.display(),
            "rotated audit file"
        );
        let file = OpenOptions::new().create(true).append(true).open(&active)?;
        state.file = Some(file);
        state.written = 0;
        state.opened_ts = now_ts;
        self.enforce_cap(state.written)?;
        Ok(())
    }

    fn enforce_cap(&self, active_bytes: u64) -> Result<(), MetaError> {
        let backups = self.backups()?;
        let mut total = active_bytes;
        let mut sizes = Vec::with_capacity(backups.len());
        for path in &backups {
            let len = std::fs::metadata(path)?.len();
            total += len;
            sizes.push(len);
        }
        for (path, len) in backups.iter().zip(sizes) {
            if total <= self.cfg.total_cap_bytes {
                break;
            }
            std::fs::remove_file(path)?;
            tracing::warn!(file = %path.display(), "dropped audit backup over byte cap");
            total -= len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> RotateConfig {
        RotateConfig {
            max_bytes: 64,
            max_age_secs: 100,
            total_cap_bytes: 1024,
        }
    }

    #[test]
    fn test_append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), "delete_extent_key_list", small_cfg(), 0).unwrap();
        log.append("ek 1", 1).unwrap();
        log.append("ek 2", 2).unwrap();
        let content = std::fs::read_to_string(dir.path().join("delete_extent_key_list")).unwrap();
        assert_eq!(content, "ek 1\nek 2\n");
    }

    #[test]
    fn test_rotates_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), "delete_extent_key_list", small_cfg(), 0).unwrap();
        let line = "x".repeat(70);
        log.append(&line, 1).unwrap();
        log.append("after", 2).unwrap();
        assert_eq!(log.backups().unwrap().len(), 1);
        let content = std::fs::read_to_string(dir.path().join("delete_extent_key_list")).unwrap();
        assert_eq!(content, "after\n");
    }

    #[test]
    fn test_rotates_on_age() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), "INODE_DEL", small_cfg(), 0).unwrap();
        log.append("old", 1).unwrap();
        log.append("new", 200).unwrap();
        assert_eq!(log.backups().unwrap().len(), 1);
    }

    #[test]
    fn test_same_second_rotations_do_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RotateConfig {
            max_bytes: 4,
            max_age_secs: 1_000_000,
            total_cap_bytes: 1024,
        };
        let log = AuditLog::open(dir.path(), "INODE_DEL", cfg, 0).unwrap();
        log.append("aaaaaa", 5).unwrap();
        log.append("bbbbbb", 5).unwrap();
        log.append("cccccc", 5).unwrap();
        assert_eq!(log.backups().unwrap().len(), 2);
    }

    #[test]
    fn test_total_cap_drops_oldest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RotateConfig {
            max_bytes: 32,
            max_age_secs: 1_000_000,
            total_cap_bytes: 100,
        };
        let log = AuditLog::open(dir.path(), "k", cfg, 0).unwrap();
        for i in 0..6 {
            log.append(&"y".repeat(40), 10 + i).unwrap();
        }
        let backups = log.backups().unwrap();
        let total: u64 = backups
            .iter()
            .map(|p| std::fs::metadata(p).unwrap().len())
            .sum();
        assert!(total + log.active_bytes() <= 100 + 41);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = AuditLog::open(dir.path(), "k", small_cfg(), 0).unwrap();
            log.append("first", 1).unwrap();
        }
        let log = AuditLog::open(dir.path(), "k", small_cfg(), 2).unwrap();
        log.append("second", 3).unwrap();
        let content = std::fs::read_to_string(dir.path().join("k")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
