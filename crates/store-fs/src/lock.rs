use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Utc;
use core_model::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::layout;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Contents of a `<record>.lock` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub filepath: String,
    pub operation_id: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub pid: u32,
}

impl LockInfo {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at)
    }

    pub fn is_stale(&self, now_ms: i64) -> bool {
        let age = self.age_ms(now_ms);
        age >= 0 && age as u64 >= self.timeout_ms
    }
}

#[derive(Debug, Clone)]
pub struct FileLock {
    lock_path: PathBuf,
    info: LockInfo,
}

impl FileLock {
    pub fn operation_id(&self) -> &str {
        &self.info.operation_id
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { info: LockInfo, age_ms: i64 },
    /// Abandoned or unreadable; the next acquirer will take it over.
    Stale { info: Option<LockInfo> },
}

enum Sidecar {
    Missing,
    Malformed,
    Present(LockInfo),
}

fn read_sidecar(lock_path: &Path) -> StoreResult<Sidecar> {
    let bytes = match fs::read(lock_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Sidecar::Missing),
        Err(e) => return Err(StoreError::io(lock_path, e)),
    };
    Ok(match serde_json::from_slice::<LockInfo>(&bytes) {
        Ok(info) => Sidecar::Present(info),
        Err(_) => Sidecar::Malformed,
    })
}

fn remove_stale(lock_path: &Path) -> StoreResult<()> {
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(lock_path, e)),
    }
}

/// Advisory, single-host locking through sidecar files. Any process that
/// follows the protocol may take over a lock older than its timeout.
#[derive(Debug, Clone)]
pub struct LockManager {
    timeout: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn acquire(&self, target: &Path, operation_id: &str) -> StoreResult<FileLock> {
        self.acquire_with_timeout(target, operation_id, self.timeout)
    }

    pub fn acquire_with_timeout(
        &self,
        target: &Path,
        operation_id: &str,
        timeout: Duration,
    ) -> StoreResult<FileLock> {
        let lock_path = layout::lock_path(target);
        let now_ms = Utc::now().timestamp_millis();
        match read_sidecar(&lock_path)? {
            Sidecar::Missing => {}
            Sidecar::Malformed => {
                warn!(path = %lock_path.display(), "malformed lock sidecar; treating as stale");
                remove_stale(&lock_path)?;
            }
            Sidecar::Present(existing) => {
                if !existing.is_stale(now_ms) {
                    return Err(StoreError::LockBusy {
                        path: target.to_path_buf(),
                        holder: existing.operation_id,
                    });
                }
                warn!(
                    path = %lock_path.display(),
                    holder = %existing.operation_id,
                    age_ms = existing.age_ms(now_ms),
                    "taking over abandoned lock"
                );
                remove_stale(&lock_path)?;
            }
        }

        let info = LockInfo {
            filepath: target.display().to_string(),
            operation_id: operation_id.to_string(),
            created_at: now_ms,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            pid: std::process::id(),
        };
        let payload = serde_json::to_vec(&info)?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = match read_sidecar(&lock_path) {
                    Ok(Sidecar::Present(other)) => other.operation_id,
                    _ => "unknown".to_string(),
                };
                return Err(StoreError::LockBusy {
                    path: target.to_path_buf(),
                    holder,
                });
            }
            Err(e) => return Err(StoreError::io(&lock_path, e)),
        };
        if let Err(e) = file.write_all(&payload) {
            drop(file);
            let _ = fs::remove_file(&lock_path);
            return Err(StoreError::io(&lock_path, e));
        }
        debug!(path = %lock_path.display(), operation_id, "lock acquired");
        Ok(FileLock { lock_path, info })
    }

    /// Idempotent. A sidecar now owned by another operation is left alone.
    pub fn release(&self, lock: &FileLock) -> StoreResult<()> {
        match read_sidecar(&lock.lock_path)? {
            Sidecar::Missing => return Ok(()),
            Sidecar::Present(current) if current.operation_id != lock.info.operation_id => {
                warn!(
                    path = %lock.lock_path.display(),
                    ours = %lock.info.operation_id,
                    holder = %current.operation_id,
                    "lock was taken over; not releasing"
                );
                return Ok(());
            }
            _ => {}
        }
        remove_stale(&lock.lock_path)?;
        debug!(path = %lock.lock_path.display(), operation_id = %lock.info.operation_id, "lock released");
        Ok(())
    }

    pub fn inspect(&self, target: &Path) -> StoreResult<LockState> {
        let lock_path = layout::lock_path(target);
        let now_ms = Utc::now().timestamp_millis();
        Ok(match read_sidecar(&lock_path)? {
            Sidecar::Missing => LockState::Free,
            Sidecar::Malformed => LockState::Stale { info: None },
            Sidecar::Present(info) if info.is_stale(now_ms) => LockState::Stale { info: Some(info) },
            Sidecar::Present(info) => {
                let age_ms = info.age_ms(now_ms);
                LockState::Held { info, age_ms }
            }
        })
    }

    /// True when a live (non-stale) lock is held on `target`.
    pub fn is_held(&self, target: &Path) -> bool {
        matches!(self.inspect(target), Ok(LockState::Held { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::ErrorKind as StoreErrorKind;

    #[test]
    fn acquire_and_release() {
        let dir = crate::tempdir();
        let target = dir.join("1.json");
        let locks = LockManager::default();
        let lock = locks.acquire(&target, "op-a").unwrap();
        assert!(layout::lock_path(&target).exists());
        assert_eq!(lock.operation_id(), "op-a");
        locks.release(&lock).unwrap();
        assert!(!layout::lock_path(&target).exists());
    }

    #[test]
    fn second_acquire_is_busy() {
        let dir = crate::tempdir();
        let target = dir.join("1.json");
        let locks = LockManager::default();
        let _held = locks.acquire(&target, "op-a").unwrap();
        let err = locks.acquire(&target, "op-b").unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::LockBusy);
        assert!(err.to_string().contains("op-a"));
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = crate::tempdir();
        let target = dir.join("1.json");
        let locks = LockManager::default();
        locks
            .acquire_with_timeout(&target, "op-old", Duration::ZERO)
            .unwrap();
        let lock = locks.acquire(&target, "op-new").unwrap();
        assert_eq!(lock.operation_id(), "op-new");
        let state = locks.inspect(&target).unwrap();
        assert!(matches!(state, LockState::Held { ref info, .. } if info.operation_id == "op-new"));
    }

    #[test]
    fn malformed_sidecar_is_stale() {
        let dir = crate::tempdir();
        let target = dir.join("1.json");
        fs::write(layout::lock_path(&target), "not json").unwrap();
        let locks = LockManager::default();
        assert_eq!(locks.inspect(&target).unwrap(), LockState::Stale { info: None });
        let lock = locks.acquire(&target, "op-a").unwrap();
        assert_eq!(lock.operation_id(), "op-a");
    }

    #[test]
    fn release_is_idempotent() {
        let dir = crate::tempdir();
        let target = dir.join("1.json");
        let locks = LockManager::default();
        let lock = locks.acquire(&target, "op-a").unwrap();
        locks.release(&lock).unwrap();
        locks.release(&lock).unwrap();
    }

    #[test]
    fn release_leaves_stolen_lock() {
        let dir = crate::tempdir();
        let target = dir.join("1.json");
        let locks = LockManager::default();
        let old = locks
            .acquire_with_timeout(&target, "op-old", Duration::ZERO)
            .unwrap();
        let _new = locks.acquire(&target, "op-new").unwrap();
        locks.release(&old).unwrap();
        assert!(locks.is_held(&target));
    }

    #[test]
    fn future_created_at_is_not_stale() {
        let info = LockInfo {
            filepath: "x".to_string(),
            operation_id: "op".to_string(),
            created_at: 2_000,
            timeout_ms: 10,
            pid: 0,
        };
        assert!(!info.is_stale(1_000));
        assert!(info.is_stale(2_010));
    }

    #[test]
    fn io_failure_reports_error_not_panic() {
        let locks = LockManager::default();
        let err = locks
            .acquire(Path::new("/nonexistent/chronik/dir/1.json"), "op")
            .unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Io);
    }
}
