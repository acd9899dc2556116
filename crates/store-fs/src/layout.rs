use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use core_model::{StoreError, StoreResult, deterministic_id};

/// Collection-level index; never treated as a record.
pub const INDEX_FILE: &str = "metadata.json";
pub const RECORD_SUFFIX: &str = ".json";
pub const TEMP_MARKER: &str = ".tmp_";
pub const LOCK_SUFFIX: &str = ".lock";
pub const BACKUP_SUFFIX: &str = ".backup";
pub const META_SUFFIX: &str = ".meta";

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn record_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}{RECORD_SUFFIX}"))
}

pub fn temp_path(path: &Path, operation_id: &str) -> PathBuf {
    with_suffix(path, &format!("{TEMP_MARKER}{operation_id}"))
}

pub fn lock_path(path: &Path) -> PathBuf {
    with_suffix(path, LOCK_SUFFIX)
}

/// `<record><BACKUP_SUFFIX>_<shortOpId>_<unixTs>`
pub fn backup_path(path: &Path, operation_id: &str, unix_ts: i64) -> PathBuf {
    with_suffix(
        path,
        &format!(
            "{BACKUP_SUFFIX}_{}_{unix_ts}",
            short_operation_id(operation_id)
        ),
    )
}

pub fn meta_path(backup: &Path) -> PathBuf {
    with_suffix(backup, META_SUFFIX)
}

pub fn short_operation_id(operation_id: &str) -> &str {
    operation_id.get(..8).unwrap_or(operation_id)
}

pub fn new_operation_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string();
    let id = deterministic_id(&[
        "op",
        &std::process::id().to_string(),
        &nanos,
        &seq.to_string(),
    ]);
    id[..16].to_string()
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

pub fn is_record_file(path: &Path) -> bool {
    match file_name(path) {
        Some(name) => {
            name != INDEX_FILE && name.len() > RECORD_SUFFIX.len() && name.ends_with(RECORD_SUFFIX)
        }
        None => false,
    }
}

pub fn record_id(path: &Path) -> Option<String> {
    file_name(path)?
        .strip_suffix(RECORD_SUFFIX)
        .map(ToOwned::to_owned)
}

pub fn is_temp_file(path: &Path) -> bool {
    file_name(path).is_some_and(|n| n.contains(&format!("{RECORD_SUFFIX}{TEMP_MARKER}")))
}

/// Record path a temp file was destined for.
pub fn target_of_temp(path: &Path) -> Option<PathBuf> {
    let name = file_name(path)?;
    let idx = name.find(TEMP_MARKER)?;
    Some(path.with_file_name(&name[..idx]))
}

pub fn is_backup_file(path: &Path) -> bool {
    file_name(path).is_some_and(|n| {
        n.contains(&format!("{RECORD_SUFFIX}{BACKUP_SUFFIX}_")) && !n.ends_with(META_SUFFIX)
    })
}

/// Record files directly under `dir`, sorted by name. Sidecars, backups and
/// the collection index are skipped.
pub fn collect_record_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_record_file(p))
        .collect();
    out.sort();
    Ok(out)
}
