//! Crash-safe file primitives for conversation records: advisory sidecar
//! locks, temp-then-rename writes with verification, and checksummed backups
//! that can be rolled back.

mod atomic;
pub mod backup;
pub mod layout;
mod lock;

pub use atomic::{AtomicWriter, WriteOutcome, validate_record_bytes};
pub use backup::{BackupInfo, BackupMeta};
pub use lock::{DEFAULT_LOCK_TIMEOUT, FileLock, LockInfo, LockManager, LockState};

#[cfg(test)]
pub(crate) fn tempdir() -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("chronik_store_{}_{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
