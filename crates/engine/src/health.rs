use std::{fs, path::Path, path::PathBuf};

use core_model::{DocumentFormat, StoreError, StoreResult};
use migrate::detect_format;
use serde::Serialize;
use serde_json::Value;
use store_fs::{LockManager, LockState, layout};
use tracing::warn;

/// Snapshot of a collection directory: record formats, leftover sidecars and
/// backups. Gathered without taking any lock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionHealth {
    pub records: usize,
    pub unified: usize,
    pub legacy: usize,
    pub ambiguous: usize,
    pub broken: Vec<PathBuf>,
    pub live_locks: Vec<PathBuf>,
    pub stale_locks: Vec<PathBuf>,
    pub temp_files: Vec<PathBuf>,
    pub backups: usize,
}

impl CollectionHealth {
    pub fn pending_migrations(&self) -> usize {
        self.legacy + self.ambiguous
    }

    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
            && self.stale_locks.is_empty()
            && self.temp_files.is_empty()
            && self.pending_migrations() == 0
    }
}

fn classify(path: &Path) -> StoreResult<DocumentFormat> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let value: Value = serde_json::from_slice(&bytes)?;
    Ok(detect_format(&value))
}

pub(crate) fn scan(dir: &Path, locks: &LockManager) -> StoreResult<CollectionHealth> {
    let mut health = CollectionHealth::default();
    for path in layout::collect_record_files(dir)? {
        health.records += 1;
        match classify(&path) {
            Ok(DocumentFormat::Unified) => health.unified += 1,
            Ok(DocumentFormat::Legacy) => health.legacy += 1,
            Ok(DocumentFormat::AmbiguousLegacy) => health.ambiguous += 1,
            Err(_) => health.broken.push(path),
        }
    }

    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut others: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    others.sort();
    for path in others {
        if layout::is_temp_file(&path) {
            health.temp_files.push(path);
        } else if layout::is_backup_file(&path) {
            health.backups += 1;
        } else if let Some(target) = path
            .to_str()
            .and_then(|s| s.strip_suffix(layout::LOCK_SUFFIX))
            .map(PathBuf::from)
        {
            match locks.inspect(&target) {
                Ok(LockState::Held { .. }) => health.live_locks.push(path),
                Ok(LockState::Stale { .. }) => health.stale_locks.push(path),
                Ok(LockState::Free) => {}
                Err(e) => {
                    warn!(lock = %path.display(), error = %e, "unreadable lock sidecar");
                    health.stale_locks.push(path);
                }
            }
        }
    }
    Ok(health)
}
