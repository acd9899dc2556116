use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::Utc;
use core_model::{
    CURRENT_SCHEMA_VERSION, ConversationRecord, EngineKind, HistoryEngine, ListItem, ListOptions,
    ListSort, Message, SaveOutcome, SearchHit, StoreError, StoreResult,
};
use migrate::{
    AmbiguousPolicy, MigrationOptions, MigrationPhase, MigrationSummary, migrate_collection,
    upgrade_document, validate_record,
};
use read_cache::{CacheStats, ReadCache};
use reconcile::{DiagnosticsProvider, FileReader, ReconcileOptions, ReconcileReport, reconcile};
use serde_json::{Value, json};
use store_fs::{
    AtomicWriter, BackupInfo, LockManager,
    backup::{self, list_backups, verify_backup},
    layout,
};
use tracing::{debug, info, warn};

use crate::{EngineConfig, health, health::CollectionHealth, listing};

const SNIPPET_CONTEXT: usize = 40;

/// JSON-document-per-conversation store rooted at one collection directory.
#[derive(Debug)]
pub struct JsonHistoryStore {
    root: PathBuf,
    config: EngineConfig,
    writer: AtomicWriter,
    cache: ReadCache<ConversationRecord>,
}

fn check_id(id: &str) -> StoreResult<&str> {
    let id = id.strip_suffix(layout::RECORD_SUFFIX).unwrap_or(id);
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(StoreError::validation(format!("invalid conversation id: {id:?}")));
    }
    Ok(id)
}

fn snippet(text: &str, at: usize, len: usize) -> String {
    let mut start = at.saturating_sub(SNIPPET_CONTEXT);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (at + len + SNIPPET_CONTEXT).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    let mut out = text[start..end].replace('\n', " ");
    if start > 0 {
        out.insert_str(0, "...");
    }
    if end < text.len() {
        out.push_str("...");
    }
    out
}

impl JsonHistoryStore {
    /// First phase of startup: makes sure `root` is a usable collection
    /// directory and reports leftovers from interrupted writes. Never migrates
    /// or repairs anything.
    pub fn open(root: &Path, config: EngineConfig) -> StoreResult<Self> {
        match fs::metadata(root) {
            Ok(meta) if !meta.is_dir() => {
                return Err(StoreError::validation(format!(
                    "{} is not a directory",
                    root.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
            }
            Err(e) => return Err(StoreError::io(root, e)),
        }
        let store = Self {
            root: root.to_path_buf(),
            config,
            writer: AtomicWriter::new(LockManager::new(config.lock_timeout)),
            cache: ReadCache::new(config.cache),
        };
        let health = store.health()?;
        for lock in &health.stale_locks {
            warn!(lock = %lock.display(), "stale lock found");
        }
        if !health.temp_files.is_empty() {
            warn!(count = health.temp_files.len(), "temp files left by interrupted writes");
        }
        info!(
            root = %root.display(),
            records = health.records,
            pending_migrations = health.pending_migrations(),
            "history store opened"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn record_path(&self, id: &str) -> StoreResult<PathBuf> {
        Ok(layout::record_path(&self.root, check_id(id)?))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(layout::INDEX_FILE)
    }

    fn cache_key(path: &Path) -> String {
        path.display().to_string()
    }

    /// Second phase of startup, run only when the caller asks: migrates every
    /// legacy record in the collection.
    pub fn migrate_if_needed(&mut self, dry_run: bool, parallel: bool) -> StoreResult<MigrationSummary> {
        let opts = MigrationOptions {
            dry_run,
            parallel,
            ambiguous: self.config.ambiguous,
        };
        let started = Instant::now();
        let summary = migrate_collection(&self.writer, &self.root, &opts, |phase| match phase {
            MigrationPhase::Migrating { file_count } => debug!(file_count, "migrating collection"),
            MigrationPhase::FileDone { file, ok } => debug!(file = %file.display(), ok, "file processed"),
            _ => {}
        })?;
        if summary.migrated_count > 0 {
            self.cache.clear();
        }
        info!(
            scanned = summary.scanned,
            migrated = summary.migrated_count,
            pending = summary.pending_count,
            failed = summary.failed_count,
            elapsed = ?started.elapsed(),
            dry_run,
            "migration finished"
        );
        Ok(summary)
    }

    pub fn health(&self) -> StoreResult<CollectionHealth> {
        health::scan(&self.root, self.writer.locks())
    }

    /// Removes temp files whose write is no longer in progress.
    pub fn sweep_temp_files(&self) -> StoreResult<usize> {
        self.writer.sweep_temp_files(&self.root)
    }

    /// Next free numeric id in the collection.
    pub fn next_id(&self) -> StoreResult<String> {
        let max = layout::collect_record_files(&self.root)?
            .iter()
            .filter_map(|p| layout::record_id(p)?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok((max + 1).to_string())
    }

    /// Most recently saved conversation, from the collection index. Falls
    /// back to the newest record when the index is missing or points at a
    /// record that no longer exists.
    pub fn latest(&self) -> StoreResult<Option<String>> {
        let index = self.index_path();
        match fs::read(&index) {
            Ok(bytes) => {
                let indexed = serde_json::from_slice::<Value>(&bytes)
                    .ok()
                    .and_then(|v| v.get("latest_filename")?.as_str().map(ToOwned::to_owned));
                if let Some(filename) = indexed
                    && self.root.join(&filename).exists()
                {
                    return Ok(filename
                        .strip_suffix(layout::RECORD_SUFFIX)
                        .map(ToOwned::to_owned));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&index, e)),
        }
        let newest = listing::list_dir(
            &self.root,
            &ListOptions {
                limit: Some(1),
                sort: ListSort::UpdatedDesc,
                include_broken: false,
            },
        )?;
        Ok(newest.into_iter().next().map(|item| item.id))
    }

    fn write_index(&self, latest: Option<&str>, operation_id: &str) {
        let value = json!({
            "latest_filename": latest,
            "updated_at": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.writer.write_index(&self.index_path(), &value, operation_id) {
            warn!(error = %e, "failed to update collection index");
        }
    }

    pub fn backups(&self, id: &str) -> StoreResult<Vec<BackupInfo>> {
        list_backups(&self.record_path(id)?)
    }

    /// Rolls `id` back to `backup`, or to the newest backup that passes
    /// verification. Returns the backup used.
    pub fn restore_backup(&mut self, id: &str, backup: Option<&Path>) -> StoreResult<PathBuf> {
        let path = self.record_path(id)?;
        let chosen = match backup {
            Some(b) => b.to_path_buf(),
            None => list_backups(&path)?
                .into_iter()
                .find(|b| match verify_backup(&b.path) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(backup = %b.path.display(), error = %e, "skipping unverifiable backup");
                        false
                    }
                })
                .map(|b| b.path)
                .ok_or_else(|| StoreError::NotFound(format!("no verified backup for {id}")))?,
        };
        self.writer
            .rollback(&path, &chosen, &layout::new_operation_id())?;
        self.cache.invalidate(&Self::cache_key(&path));
        Ok(chosen)
    }

    pub fn prune_backups(&self, older_than: chrono::Duration) -> StoreResult<usize> {
        let removed = backup::prune_backups(&self.root, older_than)?;
        info!(removed, "backups pruned");
        Ok(removed)
    }

    /// Loads `id` and reconciles its tool history against current files.
    pub fn reconcile_conversation(
        &mut self,
        id: &str,
        opts: &ReconcileOptions,
        reader: &dyn FileReader,
        diagnostics: &dyn DiagnosticsProvider,
    ) -> StoreResult<(Vec<Message>, ReconcileReport)> {
        let record = self.load(id)?;
        Ok(reconcile(&record.messages, opts, reader, diagnostics))
    }
}

impl HistoryEngine for JsonHistoryStore {
    fn kind(&self) -> EngineKind {
        EngineKind::Json
    }

    /// Stamps and atomically writes `record`. An empty filename allocates the
    /// next numeric id.
    fn save(&mut self, record: &mut ConversationRecord) -> StoreResult<SaveOutcome> {
        if record.filename.is_empty() {
            record.filename = format!("{}{}", self.next_id()?, layout::RECORD_SUFFIX);
        }
        let id = check_id(record.id())?.to_string();
        let path = layout::record_path(&self.root, &id);
        let now = Utc::now().to_rfc3339();
        record.version = CURRENT_SCHEMA_VERSION.to_string();
        record.filename = format!("{id}{}", layout::RECORD_SUFFIX);
        record.timestamp = now.clone();
        if record.created_at.is_none() {
            record.created_at = Some(now);
        }
        validate_record(record)?;
        let bytes = serde_json::to_vec_pretty(record)?;

        let operation_id = layout::new_operation_id();
        let outcome = self.writer.write(&path, &bytes, &operation_id, true)?;
        self.cache.invalidate(&Self::cache_key(&path));
        self.write_index(Some(record.filename.as_str()), &operation_id);

        let backup_path = match outcome.backup {
            Some(b) if self.config.keep_backups => Some(b.path),
            Some(b) => {
                if let Err(e) = backup::remove_backup(&b) {
                    warn!(backup = %b.path.display(), error = %e, "failed to remove save backup");
                }
                None
            }
            None => None,
        };
        Ok(SaveOutcome {
            id,
            path,
            bytes_written: outcome.bytes_written,
            backup_path,
        })
    }

    /// Cached records are only served when they were parsed from the bytes
    /// currently on disk. Legacy records are upgraded in memory, not written.
    fn load(&mut self, id: &str) -> StoreResult<ConversationRecord> {
        let path = self.record_path(id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let key = Self::cache_key(&path);
        if let Some(record) = self.cache.get(&key, Some(&bytes)) {
            debug!(id, "cache hit");
            return Ok(record);
        }
        let value: Value = serde_json::from_slice(&bytes)?;
        let (mut record, format) = upgrade_document(value, AmbiguousPolicy::PreferMessages)?;
        if record.filename.is_empty() {
            record.filename = format!("{}{}", check_id(id)?, layout::RECORD_SUFFIX);
        }
        validate_record(&record)?;
        if format.needs_migration() {
            debug!(id, %format, "legacy record upgraded in memory");
        }
        self.cache.set(&key, record.clone(), &bytes);
        Ok(record)
    }

    fn list(&self, opts: &ListOptions) -> StoreResult<Vec<ListItem>> {
        listing::list_dir(&self.root, opts)
    }

    fn delete(&mut self, id: &str) -> StoreResult<()> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let operation_id = layout::new_operation_id();
        let lock = self.writer.locks().acquire(&path, &operation_id)?;
        let removed = fs::remove_file(&path).map_err(|e| StoreError::io(&path, e));
        if let Err(e) = self.writer.locks().release(&lock) {
            warn!(lock = %lock.lock_path().display(), error = %e, "failed to release lock");
        }
        removed?;
        self.cache.invalidate(&Self::cache_key(&path));

        let filename = format!("{}{}", check_id(id)?, layout::RECORD_SUFFIX);
        let was_latest = fs::read(self.index_path())
            .ok()
            .and_then(|b| serde_json::from_slice::<Value>(&b).ok())
            .is_some_and(|v| v.get("latest_filename").and_then(Value::as_str) == Some(&filename));
        if was_latest {
            let next = self.latest()?.map(|id| format!("{id}{}", layout::RECORD_SUFFIX));
            self.write_index(next.as_deref(), &operation_id);
        }
        info!(id, "conversation deleted");
        Ok(())
    }

    /// Case-insensitive substring scan over message text, newest
    /// conversations first.
    fn search(&mut self, query: &str, limit: usize) -> StoreResult<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut hits = Vec::new();
        for item in self.list(&ListOptions::default())? {
            let record = match self.load(&item.id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(id = %item.id, error = %e, "skipping unreadable record in search");
                    continue;
                }
            };
            for msg in &record.messages {
                let text = msg.content.as_text();
                let lower = text.to_lowercase();
                let Some(at) = lower.find(&needle) else {
                    continue;
                };
                let snippet = if lower.len() == text.len() {
                    snippet(&text, at, needle.len())
                } else {
                    snippet(&lower, at, needle.len())
                };
                hits.push(SearchHit {
                    id: item.id.clone(),
                    title: record.title.clone(),
                    message_uuid: msg.uuid.clone(),
                    role: msg.role,
                    snippet,
                });
                if hits.len() >= limit {
                    return Ok(hits);
                }
            }
        }
        Ok(hits)
    }
}
