use std::{fmt, io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification of a [`StoreError`], stable across error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    LockBusy,
    Validation,
    Integrity,
    Io,
    Migration,
    NotFound,
    UnknownEngine,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LockBusy => "lock_busy",
            ErrorKind::Validation => "validation",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Io => "io",
            ErrorKind::Migration => "migration",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnknownEngine => "unknown_engine",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage locked: {} is held by operation {holder}", .path.display())]
    LockBusy { path: PathBuf, holder: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity check failed for {}: {reason}", .path.display())]
    Integrity { path: PathBuf, reason: String },

    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("migration failed for {}: {reason}", .path.display())]
    Migration {
        path: PathBuf,
        reason: String,
        rolled_back: bool,
    },

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("unknown storage engine: {0}")]
    UnknownEngine(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::LockBusy { .. } => ErrorKind::LockBusy,
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Integrity { .. } => ErrorKind::Integrity,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Migration { .. } => ErrorKind::Migration,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::UnknownEngine(_) => ErrorKind::UnknownEngine,
        }
    }

    /// Lock contention and disk errors may succeed on a later attempt; the
    /// caller owns the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::LockBusy | ErrorKind::Io)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Validation(format!("malformed json: {err}"))
    }
}
