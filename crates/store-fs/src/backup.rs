use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, TimeZone, Utc};
use core_model::{StoreError, StoreResult, byte_sum};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::layout;

/// Integrity sidecar written next to every backup as `<backup>.meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub original_file: String,
    pub operation_id: String,
    pub created_at: DateTime<Utc>,
    pub checksum: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub meta_path: PathBuf,
    pub meta: BackupMeta,
}

/// Copies `original` to a timestamped backup. Returns `None` when there is no
/// original to back up.
pub fn create_backup(original: &Path, operation_id: &str) -> StoreResult<Option<BackupInfo>> {
    let at = layout::backup_path(original, operation_id, Utc::now().timestamp());
    create_backup_at(original, &at, operation_id)
}

pub fn create_backup_at(
    original: &Path,
    path: &Path,
    operation_id: &str,
) -> StoreResult<Option<BackupInfo>> {
    let bytes = match fs::read(original) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(original, e)),
    };
    let meta_path = layout::meta_path(path);
    fs::write(path, &bytes).map_err(|e| StoreError::io(path, e))?;

    let meta = BackupMeta {
        original_file: original.display().to_string(),
        operation_id: operation_id.to_string(),
        created_at: Utc::now(),
        checksum: byte_sum(&bytes),
        size: bytes.len() as u64,
    };
    let encoded = serde_json::to_vec_pretty(&meta)?;
    if let Err(e) = fs::write(&meta_path, encoded) {
        let _ = fs::remove_file(path);
        return Err(StoreError::io(&meta_path, e));
    }
    debug!(backup = %path.display(), size = meta.size, "backup created");
    Ok(Some(BackupInfo {
        path: path.to_path_buf(),
        meta_path,
        meta,
    }))
}

pub fn read_meta(backup: &Path) -> StoreResult<BackupMeta> {
    let meta_path = layout::meta_path(backup);
    let bytes = match fs::read(&meta_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::integrity(backup, "backup metadata missing"));
        }
        Err(e) => return Err(StoreError::io(&meta_path, e)),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::integrity(backup, format!("backup metadata unreadable: {e}")))
}

/// Reads a backup and checks it against its metadata. Returns the verified
/// bytes; any mismatch is an integrity error and the bytes are not returned.
pub fn verify_backup(backup: &Path) -> StoreResult<(BackupMeta, Vec<u8>)> {
    let meta = read_meta(backup)?;
    let bytes = fs::read(backup).map_err(|e| StoreError::io(backup, e))?;
    if bytes.len() as u64 != meta.size {
        return Err(StoreError::integrity(
            backup,
            format!("size {} does not match recorded {}", bytes.len(), meta.size),
        ));
    }
    let actual = byte_sum(&bytes);
    if actual != meta.checksum {
        return Err(StoreError::integrity(
            backup,
            format!("checksum {actual} does not match recorded {}", meta.checksum),
        ));
    }
    Ok((meta, bytes))
}

pub fn remove_backup(info: &BackupInfo) -> StoreResult<()> {
    for path in [&info.path, &info.meta_path] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(path, e)),
        }
    }
    Ok(())
}

fn backup_files_in(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    Ok(entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| layout::is_backup_file(p))
        .collect())
}

/// Backups of one record, newest first. Backups without readable metadata
/// are skipped.
pub fn list_backups(record: &Path) -> StoreResult<Vec<BackupInfo>> {
    let Some(dir) = record.parent() else {
        return Ok(Vec::new());
    };
    let Some(name) = record.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{name}{}_", layout::BACKUP_SUFFIX);
    let mut out = Vec::new();
    for path in backup_files_in(dir)? {
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&prefix));
        if !matches {
            continue;
        }
        match read_meta(&path) {
            Ok(meta) => out.push(BackupInfo {
                meta_path: layout::meta_path(&path),
                path,
                meta,
            }),
            Err(e) => warn!(backup = %path.display(), error = %e, "skipping backup"),
        }
    }
    out.sort_by(|a, b| {
        b.meta
            .created_at
            .cmp(&a.meta.created_at)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(out)
}

pub fn latest_backup(record: &Path) -> StoreResult<Option<BackupInfo>> {
    Ok(list_backups(record)?.into_iter().next())
}

/// Unix timestamp embedded in a backup file name.
fn timestamp_from_name(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let secs: i64 = name.rsplit('_').next()?.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Deletes backups in `dir` created before `now - older_than`. Returns how
/// many were removed.
pub fn prune_backups(dir: &Path, older_than: Duration) -> StoreResult<usize> {
    let cutoff = Utc::now() - older_than;
    let mut removed = 0;
    for path in backup_files_in(dir)? {
        let created = read_meta(&path)
            .map(|m| m.created_at)
            .ok()
            .or_else(|| timestamp_from_name(&path));
        let Some(created) = created else {
            warn!(backup = %path.display(), "cannot date backup; keeping");
            continue;
        };
        if created >= cutoff {
            continue;
        }
        let meta_path = layout::meta_path(&path);
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        if let Err(e) = fs::remove_file(&meta_path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %meta_path.display(), error = %e, "failed to remove backup metadata");
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::ErrorKind as StoreErrorKind;

    #[test]
    fn backup_of_missing_file_is_none() {
        let dir = crate::tempdir();
        assert!(create_backup(&dir.join("1.json"), "op").unwrap().is_none());
    }

    #[test]
    fn create_and_verify() {
        let dir = crate::tempdir();
        let record = dir.join("1.json");
        fs::write(&record, b"{\"version\":\"2.0\"}").unwrap();
        let info = create_backup(&record, "0123456789").unwrap().unwrap();
        assert!(info.path.exists());
        assert!(info.meta_path.exists());
        assert_eq!(info.meta.size, 17);
        let (meta, bytes) = verify_backup(&info.path).unwrap();
        assert_eq!(meta, info.meta);
        assert_eq!(bytes, fs::read(&record).unwrap());
    }

    #[test]
    fn tampered_backup_fails_integrity() {
        let dir = crate::tempdir();
        let record = dir.join("1.json");
        fs::write(&record, b"abcdef").unwrap();
        let info = create_backup(&record, "op").unwrap().unwrap();
        fs::write(&info.path, b"abcdeg").unwrap();
        let err = verify_backup(&info.path).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Integrity);
    }

    #[test]
    fn missing_meta_fails_integrity() {
        let dir = crate::tempdir();
        let backup = dir.join("1.json.backup_abc_1");
        fs::write(&backup, b"x").unwrap();
        let err = verify_backup(&backup).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Integrity);
    }

    #[test]
    fn list_backups_newest_first_and_scoped_to_record() {
        let dir = crate::tempdir();
        let record = dir.join("1.json");
        let other = dir.join("11.json");
        fs::write(&record, b"one").unwrap();
        fs::write(&other, b"eleven").unwrap();
        let first = create_backup(&record, "aaaaaaaa").unwrap().unwrap();
        fs::write(&record, b"two").unwrap();
        let second = create_backup(&record, "bbbbbbbb").unwrap().unwrap();
        create_backup(&other, "cccccccc").unwrap().unwrap();

        let listed = list_backups(&record).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second.path);
        assert_eq!(listed[1].path, first.path);
        assert_eq!(latest_backup(&record).unwrap().unwrap().path, second.path);
    }

    #[test]
    fn prune_removes_only_old_backups() {
        let dir = crate::tempdir();
        let record = dir.join("1.json");
        fs::write(&record, b"data").unwrap();
        let fresh = create_backup(&record, "freshfresh").unwrap().unwrap();
        let old = dir.join("1.json.backup_oldoldol_1000");
        fs::write(&old, b"data").unwrap();

        let removed = prune_backups(&dir, Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.path.exists());
    }

    #[test]
    fn remove_backup_deletes_both_files() {
        let dir = crate::tempdir();
        let record = dir.join("1.json");
        fs::write(&record, b"data").unwrap();
        let info = create_backup(&record, "op").unwrap().unwrap();
        remove_backup(&info).unwrap();
        assert!(!info.path.exists());
        assert!(!info.meta_path.exists());
        remove_backup(&info).unwrap();
    }
}
