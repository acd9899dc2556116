use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

mod error;
pub mod paths;

pub use error::{ErrorKind, StoreError, StoreResult};
pub use paths::normalize_path;

/// Schema version stamped on every record written by this workspace.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => anyhow::bail!("unknown role: {s}"),
        }
    }
}

/// Message and entry timestamps are written either as unix numbers or as
/// free-form strings; both are preserved as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Unix(i64),
    Text(String),
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::Text(Utc::now().to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Unix(n) => write!(f, "{n}"),
            Timestamp::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_user_declined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Plain-text projection: text and thinking blocks joined by newlines,
    /// tool blocks skipped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    let piece = match block {
                        ContentBlock::Text { text } => text.as_str(),
                        ContentBlock::Thinking { thinking, .. } => thinking.as_str(),
                        _ => continue,
                    };
                    if piece.trim().is_empty() {
                        continue;
                    }
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(piece);
                }
                out
            }
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Generating,
    #[default]
    Generated,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub uuid: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub state: MessageState,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub is_user_submission: bool,
    #[serde(default)]
    pub is_dummy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_filepaths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_code: Option<Value>,
}

impl Message {
    pub fn new(uuid: impl Into<String>, role: Role, content: MessageContent, timestamp: Timestamp) -> Self {
        Self {
            uuid: uuid.into(),
            role,
            content,
            timestamp,
            turn_id: None,
            state: MessageState::Generated,
            visible: true,
            is_user_submission: false,
            is_dummy: false,
            selected_filepaths: None,
            selected_code: None,
        }
    }

    pub fn text(uuid: impl Into<String>, role: Role, text: impl Into<String>, timestamp: Timestamp) -> Self {
        Self::new(uuid, role, MessageContent::Text(text.into()), timestamp)
    }

    pub fn tool_use(&self) -> Option<&ToolUse> {
        self.content.blocks().iter().find_map(|b| match b {
            ContentBlock::ToolUse(u) => Some(u),
            _ => None,
        })
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        self.content.blocks().iter().find_map(|b| match b {
            ContentBlock::ToolResult(r) => Some(r),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginalFormat {
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationMetadata {
    pub version: String,
    pub migrated_at: DateTime<Utc>,
    pub original_format: OriginalFormat,
    pub entry_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<String>,
    /// `version` the legacy document declared, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

/// A conversation in the unified message-sequence format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub title: String,
    /// Last update time.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_metadata: Option<MigrationMetadata>,
    /// Fields this workspace does not interpret; carried through load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationRecord {
    pub fn new(filename: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            version: CURRENT_SCHEMA_VERSION.to_string(),
            title: title.into(),
            timestamp: now.clone(),
            created_at: Some(now),
            filename: filename.into(),
            messages: Vec::new(),
            migration_metadata: None,
            extra: Map::new(),
        }
    }

    /// Conversation id: the filename without its `.json` extension.
    pub fn id(&self) -> &str {
        self.filename
            .strip_suffix(".json")
            .unwrap_or(&self.filename)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_filepaths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_code: Option<Value>,
}

/// A conversation in the request/response format that predates messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub entries: Vec<LegacyEntry>,
    /// Messages left behind by an interrupted migration, kept unparsed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The two on-disk shapes, discriminated once at the deserialization boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryDocument {
    Legacy(LegacyRecord),
    Unified(ConversationRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Legacy,
    Unified,
    /// Both `entries` and `messages` populated: a migration that never
    /// completed.
    AmbiguousLegacy,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Legacy => "legacy",
            DocumentFormat::Unified => "unified",
            DocumentFormat::AmbiguousLegacy => "ambiguous_legacy",
        }
    }

    pub fn needs_migration(&self) -> bool {
        !matches!(self, DocumentFormat::Unified)
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Json,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Json => "json",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(EngineKind::Json),
            _ => Err(StoreError::UnknownEngine(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListSort {
    #[default]
    UpdatedDesc,
    UpdatedAsc,
    Filename,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub sort: ListSort,
    /// Report unreadable records as items with `error` set instead of
    /// skipping them.
    pub include_broken: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListItem {
    pub id: String,
    pub filename: String,
    pub title: String,
    pub updated_at: String,
    pub message_count: usize,
    pub format: Option<DocumentFormat>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub message_uuid: String,
    pub role: Role,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub id: String,
    pub path: std::path::PathBuf,
    pub bytes_written: usize,
    /// Backup retained after the write, when the engine keeps backups.
    pub backup_path: Option<std::path::PathBuf>,
}

/// Storage engine over one collection of conversation records.
pub trait HistoryEngine {
    fn kind(&self) -> EngineKind;
    fn save(&mut self, record: &mut ConversationRecord) -> StoreResult<SaveOutcome>;
    fn load(&mut self, id: &str) -> StoreResult<ConversationRecord>;
    fn list(&self, opts: &ListOptions) -> StoreResult<Vec<ListItem>>;
    fn delete(&mut self, id: &str) -> StoreResult<()>;
    fn search(&mut self, query: &str, limit: usize) -> StoreResult<Vec<SearchHit>>;
}

pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Integrity checksum for backups: the sum of all byte values. Not
/// cryptographic.
pub fn byte_sum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, b| acc.wrapping_add(u64::from(*b)))
}

/// Order-sensitive rolling sum used for cache staleness checks. Not
/// cryptographic.
pub fn rolling_checksum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(*b)))
}
