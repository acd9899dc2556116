//! Storage engine facade over a directory of conversation records.

use std::{path::Path, time::Duration};

use core_model::{EngineKind, HistoryEngine, StoreResult};
use migrate::AmbiguousPolicy;
use read_cache::CacheConfig;
use store_fs::DEFAULT_LOCK_TIMEOUT;

mod health;
mod listing;
mod store;

pub use health::CollectionHealth;
pub use store::JsonHistoryStore;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub lock_timeout: Duration,
    pub cache: CacheConfig,
    /// Keep the backup taken by each save instead of deleting it once the
    /// write has been verified.
    pub keep_backups: bool,
    /// Applies to `migrate_if_needed`; plain loads always prefer `messages`.
    pub ambiguous: AmbiguousPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cache: CacheConfig::default(),
            keep_backups: false,
            ambiguous: AmbiguousPolicy::default(),
        }
    }
}

pub fn open_engine(
    kind: EngineKind,
    root: &Path,
    config: EngineConfig,
) -> StoreResult<Box<dyn HistoryEngine>> {
    match kind {
        EngineKind::Json => Ok(Box::new(JsonHistoryStore::open(root, config)?)),
    }
}

/// Opens the engine registered under `name`.
pub fn open_engine_by_name(
    name: &str,
    root: &Path,
    config: EngineConfig,
) -> StoreResult<Box<dyn HistoryEngine>> {
    open_engine(name.parse()?, root, config)
}

#[cfg(test)]
pub(crate) fn tempdir() -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("chronik_engine_{}_{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
