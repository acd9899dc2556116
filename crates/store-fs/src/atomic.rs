use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use core_model::{StoreError, StoreResult};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    backup::{self, BackupInfo},
    layout,
    lock::{FileLock, LockManager},
};

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub bytes_written: usize,
    /// Copy of the previous file, retained for the caller to keep or drop.
    pub backup: Option<BackupInfo>,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultPoint {
    AfterTempWrite,
    BeforeRename,
}

/// Structural check applied before and after a record is written: a JSON
/// object with a non-empty `version` and a `messages` or `entries` array.
pub fn validate_record_bytes(bytes: &[u8]) -> StoreResult<()> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Some(obj) = value.as_object() else {
        return Err(StoreError::validation("record must be a json object"));
    };
    match obj.get("version") {
        Some(Value::String(v)) if !v.is_empty() => {}
        _ => return Err(StoreError::validation("record has no schema version")),
    }
    let has_messages = obj.get("messages").is_some_and(Value::is_array);
    let has_entries = obj.get("entries").is_some_and(Value::is_array);
    if !has_messages && !has_entries {
        return Err(StoreError::validation(
            "record has neither a messages nor an entries array",
        ));
    }
    Ok(())
}

fn write_synced(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Writes records through a temp file that is verified before it replaces the
/// destination. The destination is only ever touched by the final rename.
#[derive(Debug, Clone, Default)]
pub struct AtomicWriter {
    locks: LockManager,
    #[cfg(test)]
    fail_at: Option<FaultPoint>,
}

impl AtomicWriter {
    pub fn new(locks: LockManager) -> Self {
        Self {
            locks,
            #[cfg(test)]
            fail_at: None,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[cfg(test)]
    pub(crate) fn fail_at(mut self, point: FaultPoint) -> Self {
        self.fail_at = Some(point);
        self
    }

    #[cfg(test)]
    fn inject(&self, point: FaultPoint) -> StoreResult<()> {
        if self.fail_at == Some(point) {
            return Err(StoreError::io(
                PathBuf::from("<injected>"),
                io::Error::other(format!("injected failure at {point:?}")),
            ));
        }
        Ok(())
    }

    pub fn write(
        &self,
        path: &Path,
        content: &[u8],
        operation_id: &str,
        make_backup: bool,
    ) -> StoreResult<WriteOutcome> {
        self.write_with(path, operation_id, make_backup, |_, _| Ok(Some(content.to_vec())))?
            .ok_or_else(|| StoreError::io(path, io::Error::other("write produced no content")))
    }

    /// Like [`AtomicWriter::write`], but the content is produced under the
    /// lock by `build`. It receives the current file bytes, read after the
    /// lock was taken, and the path the backup will be written to (when one
    /// will be taken) so it can be recorded in the content. Returning
    /// `Ok(None)` leaves the file alone and yields `Ok(None)`.
    pub fn write_with<F>(
        &self,
        path: &Path,
        operation_id: &str,
        make_backup: bool,
        build: F,
    ) -> StoreResult<Option<WriteOutcome>>
    where
        F: FnOnce(Option<&[u8]>, Option<&Path>) -> StoreResult<Option<Vec<u8>>>,
    {
        let lock = self.locks.acquire(path, operation_id)?;
        let temp = layout::temp_path(path, operation_id);
        let result = self.write_locked(path, &temp, operation_id, make_backup, build);
        self.finalize(&temp, &lock);
        match &result {
            Ok(Some(outcome)) => info!(
                path = %path.display(),
                operation_id,
                bytes = outcome.bytes_written,
                backup = outcome.backup.is_some(),
                "record written"
            ),
            Ok(None) => debug!(path = %path.display(), operation_id, "nothing to write"),
            Err(e) => warn!(path = %path.display(), operation_id, error = %e, "record write failed"),
        }
        result
    }

    fn write_locked<F>(
        &self,
        path: &Path,
        temp: &Path,
        operation_id: &str,
        make_backup: bool,
        build: F,
    ) -> StoreResult<Option<WriteOutcome>>
    where
        F: FnOnce(Option<&[u8]>, Option<&Path>) -> StoreResult<Option<Vec<u8>>>,
    {
        let current = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let planned_backup = (make_backup && current.is_some())
            .then(|| layout::backup_path(path, operation_id, Utc::now().timestamp()));
        let Some(content) = build(current.as_deref(), planned_backup.as_deref())? else {
            return Ok(None);
        };
        validate_record_bytes(&content)?;

        let backup = match &planned_backup {
            Some(at) => backup::create_backup_at(path, at, operation_id)?,
            None => None,
        };

        write_synced(temp, &content).map_err(|e| StoreError::io(temp, e))?;
        #[cfg(test)]
        self.inject(FaultPoint::AfterTempWrite)?;

        let reread = fs::read(temp).map_err(|e| StoreError::io(temp, e))?;
        if reread != content {
            return Err(StoreError::io(
                temp,
                io::Error::other("temp file does not match written content"),
            ));
        }
        validate_record_bytes(&reread)?;
        #[cfg(test)]
        self.inject(FaultPoint::BeforeRename)?;

        fs::rename(temp, path).map_err(|e| StoreError::io(path, e))?;
        Ok(Some(WriteOutcome {
            path: path.to_path_buf(),
            bytes_written: content.len(),
            backup,
        }))
    }

    /// Best effort; never changes the outcome of the operation it follows.
    fn finalize(&self, temp: &Path, lock: &FileLock) {
        match fs::remove_file(temp) {
            Ok(()) => debug!(temp = %temp.display(), "temp file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(temp = %temp.display(), error = %e, "failed to remove temp file"),
        }
        if let Err(e) = self.locks.release(lock) {
            warn!(lock = %lock.lock_path().display(), error = %e, "failed to release lock");
        }
    }

    /// Restores `path` from a verified backup. A backup whose checksum does
    /// not match its metadata is never restored.
    pub fn rollback(&self, path: &Path, backup_path: &Path, operation_id: &str) -> StoreResult<()> {
        let lock = self.locks.acquire(path, operation_id)?;
        let temp = layout::temp_path(path, operation_id);
        let result = (|| {
            let (_meta, bytes) = backup::verify_backup(backup_path)?;
            write_synced(&temp, &bytes).map_err(|e| StoreError::io(&temp, e))?;
            fs::rename(&temp, path).map_err(|e| StoreError::io(path, e))?;
            if !path.exists() {
                return Err(StoreError::io(
                    path,
                    io::Error::new(ErrorKind::NotFound, "restored file missing after rollback"),
                ));
            }
            Ok(())
        })();
        self.finalize(&temp, &lock);
        match &result {
            Ok(()) => info!(path = %path.display(), backup = %backup_path.display(), "record rolled back"),
            Err(e) => warn!(path = %path.display(), backup = %backup_path.display(), error = %e, "rollback failed"),
        }
        result
    }

    /// Temp-then-rename write for the collection index, which is not a record
    /// and skips record validation.
    pub fn write_index(&self, path: &Path, value: &Value, operation_id: &str) -> StoreResult<()> {
        let lock = self.locks.acquire(path, operation_id)?;
        let temp = layout::temp_path(path, operation_id);
        let result = (|| {
            let bytes = serde_json::to_vec_pretty(value)?;
            write_synced(&temp, &bytes).map_err(|e| StoreError::io(&temp, e))?;
            fs::rename(&temp, path).map_err(|e| StoreError::io(path, e))
        })();
        self.finalize(&temp, &lock);
        result
    }

    /// Removes temp files left behind by interrupted writes whose record is
    /// no longer locked. Returns how many were removed.
    pub fn sweep_temp_files(&self, dir: &Path) -> StoreResult<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let mut removed = 0;
        for path in entries.flatten().map(|e| e.path()) {
            if !layout::is_temp_file(&path) {
                continue;
            }
            let Some(target) = layout::target_of_temp(&path) else {
                continue;
            };
            if self.locks.is_held(&target) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(temp = %path.display(), error = %e, "failed to sweep temp file"),
            }
        }
        Ok(removed)
    }
}
