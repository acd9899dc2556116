use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// 1-based inclusive line range. `end: None` reads to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl LineRange {
    fn slice(&self, text: &str) -> Result<String> {
        let start = self.start.max(1);
        let total = text.lines().count();
        if start > total.max(1) {
            bail!("line {start} is past the end of the file ({total} lines)");
        }
        let take = match self.end {
            Some(end) if end < start => bail!("line range {start}..{end} is inverted"),
            Some(end) => end - start + 1,
            None => usize::MAX,
        };
        Ok(text
            .lines()
            .skip(start - 1)
            .take(take)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Source of current file content for refreshed views.
pub trait FileReader {
    fn read(&self, path: &str, range: Option<LineRange>) -> Result<String>;
}

pub trait DiagnosticsProvider {
    fn diagnostics(&self, path: &str) -> Result<Vec<Diagnostic>>;
}

/// Reads files from disk, resolving relative tool paths against `root`.
#[derive(Debug, Clone)]
pub struct FsFileReader {
    root: PathBuf,
}

impl FsFileReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

impl FileReader for FsFileReader {
    fn read(&self, path: &str, range: Option<LineRange>) -> Result<String> {
        let full = self.resolve(path);
        let text = fs::read_to_string(&full)
            .with_context(|| format!("failed to read {}", full.display()))?;
        match range {
            Some(range) => range
                .slice(&text)
                .with_context(|| format!("failed to read {}", full.display())),
            None => Ok(text),
        }
    }
}

/// Provider for hosts without a language server; reports no diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl DiagnosticsProvider for NoDiagnostics {
    fn diagnostics(&self, _path: &str) -> Result<Vec<Diagnostic>> {
        Ok(Vec::new())
    }
}
