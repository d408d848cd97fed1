//! Node-wide advisory lock.
//!
//! Production, commit and sync hold `node.lock` for their whole run. The
//! file is created with `create_new`, so a second holder fails with `Busy`
//! instead of waiting. A lock older than the stale age is assumed abandoned
//! by a crashed process and taken over.

use crate::storage::read_json;
use crate::types::UnixTime;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("node is busy: {operation} holds the lock since {acquired_at} (pid {pid})")]
    Busy { operation: String, pid: u32, acquired_at: UnixTime },
    #[error("lock io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    operation: String,
    acquired_at: UnixTime,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct NodeLock {
    path: PathBuf,
}

impl NodeLock {
    pub fn acquire(path: impl AsRef<Path>, operation: &str, now: UnixTime, stale_after_secs: u64) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let info = LockInfo { pid: std::process::id(), operation: operation.to_string(), acquired_at: now };
        match Self::create(&path, &info) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        // unreadable contents count as age zero, i.e. not stale
        let held: Option<LockInfo> = read_json(&path).ok().flatten();
        let (holder, acquired_at, pid) = match &held {
            Some(h) => (h.operation.clone(), h.acquired_at, h.pid),
            None => ("unknown".to_string(), now, 0),
        };
        if now.saturating_sub(acquired_at) < stale_after_secs {
            return Err(LockError::Busy { operation: holder, pid, acquired_at });
        }
        warn!(path = %path.display(), holder = %holder, pid, acquired_at, "taking over stale node lock");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::create(&path, &info).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                // another process won the takeover race
                LockError::Busy { operation: holder.clone(), pid, acquired_at }
            } else {
                e.into()
            }
        })
    }

    fn create(path: &Path, info: &LockInfo) -> io::Result<Self> {
        let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
        let body = serde_json::to_vec(info).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        f.write_all(&body)?;
        f.sync_all()?;
        debug!(path = %path.display(), operation = %info.operation, "node lock acquired");
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release node lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_busy_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let first = NodeLock::acquire(&path, "produce", 100, 60).unwrap();
        match NodeLock::acquire(&path, "sync", 110, 60) {
            Err(LockError::Busy { operation, acquired_at, .. }) => {
                assert_eq!(operation, "produce");
                assert_eq!(acquired_at, 100);
            }
            other => panic!("expected Busy, got {other:?}"),
        }
        drop(first);
        assert!(!path.exists());
        NodeLock::acquire(&path, "sync", 111, 60).unwrap();
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.lock");
        let abandoned = NodeLock::acquire(&path, "produce", 100, 60).unwrap();
        std::mem::forget(abandoned);
        let lock = NodeLock::acquire(&path, "sync", 200, 60).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }
}
