use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use core_model::{
    ConversationRecord, DocumentFormat, ErrorKind, HistoryDocument, StoreError, StoreResult,
};
use rayon::prelude::*;
use serde_json::Value;
use store_fs::{AtomicWriter, layout};
use tracing::{debug, info, warn};

mod convert;
mod detect;
mod validate;

pub use convert::{ensure_current_version, entries_to_messages, upgrade_legacy};
pub use detect::{detect_format, parse_document};
pub use validate::{validate_record, validate_unified};

/// How a record holding both populated `entries` and populated `messages`
/// is migrated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AmbiguousPolicy {
    /// Re-derive messages from entries. Messages added after an interrupted
    /// migration are replaced; the backup keeps them.
    #[default]
    PreferEntries,
    /// Keep the messages and drop the entries.
    PreferMessages,
}

impl AmbiguousPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmbiguousPolicy::PreferEntries => "prefer-entries",
            AmbiguousPolicy::PreferMessages => "prefer-messages",
        }
    }

    /// Format to migrate from once the policy is applied.
    pub fn resolve(&self, detected: DocumentFormat) -> DocumentFormat {
        match (detected, self) {
            (DocumentFormat::AmbiguousLegacy, AmbiguousPolicy::PreferEntries) => {
                DocumentFormat::Legacy
            }
            (DocumentFormat::AmbiguousLegacy, AmbiguousPolicy::PreferMessages) => {
                DocumentFormat::Unified
            }
            (other, _) => other,
        }
    }
}

impl fmt::Display for AmbiguousPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AmbiguousPolicy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-entries" => Ok(AmbiguousPolicy::PreferEntries),
            "prefer-messages" => Ok(AmbiguousPolicy::PreferMessages),
            _ => Err(StoreError::validation(format!("unknown ambiguous policy: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationOptions {
    pub dry_run: bool,
    /// Migrate files of a collection concurrently. Each file is still
    /// written under its own lock.
    pub parallel: bool,
    pub ambiguous: AmbiguousPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    AlreadyCurrent,
    Migrated {
        from: DocumentFormat,
        entry_count: usize,
        backup: Option<PathBuf>,
    },
    WouldMigrate {
        from: DocumentFormat,
    },
}

#[derive(Debug, Clone)]
pub struct FileError {
    pub file: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationSummary {
    pub scanned: usize,
    pub migrated_count: usize,
    pub skipped_count: usize,
    pub pending_count: usize,
    pub failed_count: usize,
    pub errors: Vec<FileError>,
}

impl MigrationSummary {
    fn record(&mut self, file: &Path, result: StoreResult<MigrationOutcome>) {
        self.scanned += 1;
        match result {
            Ok(MigrationOutcome::AlreadyCurrent) => self.skipped_count += 1,
            Ok(MigrationOutcome::Migrated { .. }) => self.migrated_count += 1,
            Ok(MigrationOutcome::WouldMigrate { .. }) => self.pending_count += 1,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "migration failed");
                self.failed_count += 1;
                self.errors.push(FileError {
                    file: file.to_path_buf(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum MigrationPhase {
    Scanning,
    Migrating { file_count: usize },
    FileDone { file: PathBuf, ok: bool },
    Done { migrated: usize, failed: usize },
}

/// Reads a raw record in memory, upgrading legacy content without writing.
/// Returns the unified record and the format it was read as.
pub fn upgrade_document(
    value: Value,
    policy: AmbiguousPolicy,
) -> StoreResult<(ConversationRecord, DocumentFormat)> {
    let detected = detect_format(&value);
    let record = match parse_document(value, policy.resolve(detected))? {
        HistoryDocument::Legacy(legacy) => upgrade_legacy(legacy, None),
        HistoryDocument::Unified(mut record) => {
            ensure_current_version(&mut record);
            record
        }
    };
    Ok((record, detected))
}

fn migration_error(path: &Path, err: StoreError, rolled_back: bool) -> StoreError {
    match err {
        StoreError::Validation(reason) => StoreError::Migration {
            path: path.to_path_buf(),
            reason,
            rolled_back,
        },
        other => other,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Builds the migrated bytes for the record currently on disk, or `None`
/// when it is already unified. Returns the detected format alongside.
fn migrated_bytes(
    path: &Path,
    current: &[u8],
    policy: AmbiguousPolicy,
    backup: Option<&Path>,
) -> StoreResult<Option<(Vec<u8>, DocumentFormat, usize)>> {
    let value: Value = serde_json::from_slice(current)?;
    let detected = detect_format(&value);
    if detected == DocumentFormat::Unified {
        return Ok(None);
    }
    let mut entry_count = 0;
    let mut record = match parse_document(value, policy.resolve(detected))? {
        HistoryDocument::Legacy(mut legacy) => {
            entry_count = legacy.entries.len();
            if legacy.filename.is_empty() {
                legacy.filename = file_name_of(path);
            }
            upgrade_legacy(legacy, backup.map(file_name_of))
        }
        HistoryDocument::Unified(record) => record,
    };
    ensure_current_version(&mut record);
    validate_record(&record)?;
    Ok(Some((serde_json::to_vec_pretty(&record)?, detected, entry_count)))
}

/// Re-reads a freshly migrated record and checks it with `check`. On failure
/// the record is restored from `backup` when there is one.
fn verify_migrated(
    writer: &AtomicWriter,
    path: &Path,
    backup: Option<&Path>,
    check: impl FnOnce(&Value) -> StoreResult<()>,
) -> StoreResult<()> {
    let verified = fs::read(path)
        .map_err(|e| StoreError::io(path, e))
        .and_then(|bytes| Ok(serde_json::from_slice::<Value>(&bytes)?))
        .and_then(|value| check(&value));
    let Err(e) = verified else {
        return Ok(());
    };
    let Some(backup_path) = backup else {
        return Err(migration_error(path, e, false));
    };
    warn!(path = %path.display(), error = %e, "migrated record failed verification; rolling back");
    writer.rollback(path, backup_path, &layout::new_operation_id())?;
    Err(StoreError::Migration {
        path: path.to_path_buf(),
        reason: e.to_string(),
        rolled_back: true,
    })
}

/// Migrates one record file in place. Unified records are left untouched.
/// The record is classified and converted from the bytes read under its
/// lock. A backup is taken before the write and restored if the written
/// record fails validation.
pub fn migrate_file(
    writer: &AtomicWriter,
    path: &Path,
    opts: &MigrationOptions,
) -> StoreResult<MigrationOutcome> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let value: Value = serde_json::from_slice(&bytes)?;
    let detected = detect_format(&value);
    if detected == DocumentFormat::Unified {
        return Ok(MigrationOutcome::AlreadyCurrent);
    }
    if opts.dry_run {
        return Ok(MigrationOutcome::WouldMigrate { from: detected });
    }

    let operation_id = layout::new_operation_id();
    let mut converted = None;
    let outcome = writer
        .write_with(path, &operation_id, true, |current, backup| {
            let Some(current) = current else {
                return Err(StoreError::NotFound(path.display().to_string()));
            };
            let Some((bytes, from, entry_count)) =
                migrated_bytes(path, current, opts.ambiguous, backup)?
            else {
                return Ok(None);
            };
            converted = Some((from, entry_count));
            Ok(Some(bytes))
        })
        .map_err(|e| migration_error(path, e, false))?;
    let (Some(outcome), Some((from, entry_count))) = (outcome, converted) else {
        debug!(path = %path.display(), "record became current before it was locked");
        return Ok(MigrationOutcome::AlreadyCurrent);
    };
    let backup = outcome.backup.map(|b| b.path);
    verify_migrated(writer, path, backup.as_deref(), validate_unified)?;

    info!(path = %path.display(), %from, entry_count, "record migrated");
    Ok(MigrationOutcome::Migrated {
        from,
        entry_count,
        backup,
    })
}

/// Migrates every record in `dir`. A failing file is reported in the summary
/// and never stops the batch.
pub fn migrate_collection(
    writer: &AtomicWriter,
    dir: &Path,
    opts: &MigrationOptions,
    on_progress: impl Fn(MigrationPhase) + Sync,
) -> StoreResult<MigrationSummary> {
    on_progress(MigrationPhase::Scanning);
    let files = layout::collect_record_files(dir)?;
    on_progress(MigrationPhase::Migrating {
        file_count: files.len(),
    });

    let migrate_one = |file: &PathBuf| {
        let result = migrate_file(writer, file, opts);
        on_progress(MigrationPhase::FileDone {
            file: file.clone(),
            ok: result.is_ok(),
        });
        (file.clone(), result)
    };
    let results: Vec<(PathBuf, StoreResult<MigrationOutcome>)> = if opts.parallel {
        files.par_iter().map(migrate_one).collect()
    } else {
        files.iter().map(migrate_one).collect()
    };

    let mut summary = MigrationSummary::default();
    for (file, result) in results {
        summary.record(&file, result);
    }
    on_progress(MigrationPhase::Done {
        migrated: summary.migrated_count,
        failed: summary.failed_count,
    });
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{CURRENT_SCHEMA_VERSION, Role};
    use serde_json::json;
    use std::sync::Mutex;

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("chronik_migrate_{}_{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_json(path: &Path, value: &Value) {
        fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    }

    fn legacy_doc() -> Value {
        json!({
            "title": "legacy chat",
            "timestamp": "2024-03-01 10:00:00",
            "filename": "1.json",
            "entries": [
                {"request": "fix bug", "response": "done", "timestamp": 1000},
                {"request": "thanks", "timestamp": 1001}
            ]
        })
    }

    fn unified_doc() -> Value {
        json!({
            "version": CURRENT_SCHEMA_VERSION,
            "title": "new chat",
            "timestamp": "2024-03-02T00:00:00+00:00",
            "filename": "2.json",
            "messages": [{"role": "user", "content": "hello", "timestamp": 5, "uuid": "u1"}]
        })
    }

    #[test]
    fn migrates_legacy_file_with_backup() {
        let dir = tempdir();
        let path = dir.join("1.json");
        write_json(&path, &legacy_doc());
        let writer = AtomicWriter::default();

        let outcome = migrate_file(&writer, &path, &MigrationOptions::default()).unwrap();
        let MigrationOutcome::Migrated { from, entry_count, backup } = outcome else {
            panic!("expected migration, got {outcome:?}");
        };
        assert_eq!(from, DocumentFormat::Legacy);
        assert_eq!(entry_count, 2);
        let backup = backup.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&fs::read(&backup).unwrap()).unwrap(),
            legacy_doc()
        );

        let written: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        validate_unified(&written).unwrap();
        assert!(written.get("entries").is_none());
        assert_eq!(written["messages"].as_array().unwrap().len(), 3);
        assert_eq!(
            written["migration_metadata"]["backup_file"],
            backup.file_name().unwrap().to_str().unwrap()
        );
    }

    #[test]
    fn unified_file_is_a_no_op() {
        let dir = tempdir();
        let path = dir.join("2.json");
        write_json(&path, &unified_doc());
        let before = fs::read(&path).unwrap();
        let writer = AtomicWriter::default();
        let outcome = migrate_file(&writer, &path, &MigrationOptions::default()).unwrap();
        assert_eq!(outcome, MigrationOutcome::AlreadyCurrent);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(store_fs::backup::list_backups(&path).unwrap().is_empty());
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let dir = tempdir();
        let path = dir.join("1.json");
        write_json(&path, &legacy_doc());
        let before = fs::read(&path).unwrap();
        let opts = MigrationOptions {
            dry_run: true,
            ..Default::default()
        };
        let outcome = migrate_file(&AtomicWriter::default(), &path, &opts).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::WouldMigrate {
                from: DocumentFormat::Legacy
            }
        );
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn ambiguous_record_follows_policy() {
        let mut doc = legacy_doc();
        doc["messages"] = json!([{"role": "user", "content": "edited later", "timestamp": 9}]);

        let dir = tempdir();
        let path = dir.join("1.json");
        write_json(&path, &doc);
        let outcome = migrate_file(&AtomicWriter::default(), &path, &MigrationOptions::default()).unwrap();
        assert!(matches!(
            outcome,
            MigrationOutcome::Migrated { from: DocumentFormat::AmbiguousLegacy, .. }
        ));
        let written: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["messages"][0]["content"], "fix bug");

        let path = dir.join("3.json");
        write_json(&path, &doc);
        let opts = MigrationOptions {
            ambiguous: AmbiguousPolicy::PreferMessages,
            ..Default::default()
        };
        migrate_file(&AtomicWriter::default(), &path, &opts).unwrap();
        let written: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["messages"][0]["content"], "edited later");
        assert!(written.get("entries").is_none());
    }

    #[test]
    fn invalid_legacy_content_is_migration_failure_and_untouched() {
        let dir = tempdir();
        let path = dir.join("1.json");
        let doc = json!({"entries": [{"request": "q", "timestamp": {"bad": true}}]});
        write_json(&path, &doc);
        let before = fs::read(&path).unwrap();
        let err = migrate_file(&AtomicWriter::default(), &path, &MigrationOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Migration);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn versioned_and_half_migrated_legacy_files_migrate_cleanly() {
        let dir = tempdir();
        let mut versioned = legacy_doc();
        versioned["version"] = json!("1.0");
        let path = dir.join("1.json");
        write_json(&path, &versioned);
        let outcome = migrate_file(&AtomicWriter::default(), &path, &MigrationOptions::default()).unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { from: DocumentFormat::Legacy, .. }));
        let text = fs::read_to_string(&path).unwrap();
        let written: Value = serde_json::from_str(&text).unwrap();
        validate_unified(&written).unwrap();
        assert_eq!(written["migration_metadata"]["source_version"], "1.0");

        let mut half = legacy_doc();
        half["version"] = json!(CURRENT_SCHEMA_VERSION);
        half["migration_metadata"] = json!({"version": CURRENT_SCHEMA_VERSION, "entry_count": 7});
        half["messages"] = json!([{"role": "user", "content": "partial", "timestamp": 9}]);
        let path = dir.join("2.json");
        write_json(&path, &half);
        let outcome = migrate_file(&AtomicWriter::default(), &path, &MigrationOptions::default()).unwrap();
        assert!(matches!(
            outcome,
            MigrationOutcome::Migrated { from: DocumentFormat::AmbiguousLegacy, entry_count: 2, .. }
        ));
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("\"migration_metadata\":").count(), 1);
        let written: Value = serde_json::from_str(&text).unwrap();
        validate_unified(&written).unwrap();
        assert_eq!(written["migration_metadata"]["entry_count"], 2);
    }

    #[test]
    fn conversion_uses_bytes_read_under_lock() {
        let dir = tempdir();
        let path = dir.join("1.json");
        write_json(&path, &legacy_doc());
        let (bytes, from, entry_count) =
            migrated_bytes(&path, &serde_json::to_vec(&legacy_doc()).unwrap(), AmbiguousPolicy::default(), None)
                .unwrap()
                .unwrap();
        assert_eq!((from, entry_count), (DocumentFormat::Legacy, 2));
        validate_unified(&serde_json::from_slice(&bytes).unwrap()).unwrap();

        // Another writer saved a unified record after the unlocked pre-read.
        let saved = serde_json::to_vec(&unified_doc()).unwrap();
        assert!(migrated_bytes(&path, &saved, AmbiguousPolicy::default(), None).unwrap().is_none());
        fs::write(&path, &saved).unwrap();
        let writer = AtomicWriter::default();
        let outcome = writer
            .write_with(&path, "op", true, |current, backup| {
                Ok(migrated_bytes(&path, current.unwrap(), AmbiguousPolicy::default(), backup)?
                    .map(|(bytes, _, _)| bytes))
            })
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(fs::read(&path).unwrap(), saved);
        assert!(store_fs::backup::list_backups(&path).unwrap().is_empty());
    }

    #[test]
    fn failed_verification_restores_backup() {
        let dir = tempdir();
        let path = dir.join("1.json");
        write_json(&path, &legacy_doc());
        let original = fs::read(&path).unwrap();
        let writer = AtomicWriter::default();
        // Passes the writer's structural check but not unified validation.
        let bad = br#"{"version":"2.0","messages":[{"role":"robot","content":"x","timestamp":1}]}"#;
        let outcome = writer.write(&path, bad, "op", true).unwrap();
        let backup = outcome.backup.map(|b| b.path);
        assert!(backup.is_some());

        let err = verify_migrated(&writer, &path, backup.as_deref(), validate_unified).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Migration);
        assert!(matches!(err, StoreError::Migration { rolled_back: true, .. }));
        assert_eq!(fs::read(&path).unwrap(), original);

        fs::write(&path, bad).unwrap();
        let err = verify_migrated(&writer, &path, None, validate_unified).unwrap_err();
        assert!(matches!(err, StoreError::Migration { rolled_back: false, .. }));
        assert_eq!(fs::read(&path).unwrap(), bad);

        write_json(&path, &unified_doc());
        verify_migrated(&writer, &path, None, validate_unified).unwrap();
    }

    #[test]
    fn upgrade_document_in_memory() {
        let (record, format) = upgrade_document(legacy_doc(), AmbiguousPolicy::default()).unwrap();
        assert_eq!(format, DocumentFormat::Legacy);
        assert_eq!(record.messages[0].role, Role::User);
        assert_eq!(record.version, CURRENT_SCHEMA_VERSION);

        let mut old = unified_doc();
        old["version"] = json!("1.0");
        let (record, format) = upgrade_document(old, AmbiguousPolicy::default()).unwrap();
        assert_eq!(format, DocumentFormat::Unified);
        assert_eq!(record.version, CURRENT_SCHEMA_VERSION);
        assert!(record.migration_metadata.is_none());
    }

    #[test]
    fn batch_continues_past_failures() {
        let dir = tempdir();
        write_json(&dir.join("1.json"), &legacy_doc());
        write_json(&dir.join("2.json"), &unified_doc());
        fs::write(dir.join("3.json"), "{ truncated").unwrap();
        write_json(&dir.join("metadata.json"), &json!({"latest_filename": "2.json"}));

        for parallel in [false, true] {
            let run = tempdir();
            for name in ["1.json", "2.json", "3.json", "metadata.json"] {
                fs::copy(dir.join(name), run.join(name)).unwrap();
            }
            let phases = Mutex::new(Vec::new());
            let opts = MigrationOptions {
                parallel,
                ..Default::default()
            };
            let summary = migrate_collection(&AtomicWriter::default(), &run, &opts, |p| {
                phases.lock().unwrap().push(p);
            })
            .unwrap();
            assert_eq!(summary.scanned, 3);
            assert_eq!(summary.migrated_count, 1);
            assert_eq!(summary.skipped_count, 1);
            assert_eq!(summary.failed_count, 1);
            assert_eq!(summary.errors[0].kind, ErrorKind::Validation);
            assert!(summary.errors[0].file.ends_with("3.json"));
            let phases = phases.into_inner().unwrap();
            assert!(matches!(phases.last(), Some(MigrationPhase::Done { migrated: 1, failed: 1 })));
        }
    }
}
