use std::collections::HashMap;

use core_model::{ContentBlock, Message, ToolResult, normalize_path};
use serde_json::Value;

use crate::collab::LineRange;

pub const VIEW_TOOL: &str = "view";
pub const EDIT_TOOLS: &[&str] = &[
    "edit_file",
    "str_replace",
    "str_replace_editor",
    "create",
    "insert",
    "write_to_file",
    "replace_in_file",
    "undo_edit",
];
const PATH_KEYS: &[&str] = &["path", "file_path", "target_file"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    View,
    Edit,
    Other,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Self {
        if name == VIEW_TOOL {
            ToolKind::View
        } else if EDIT_TOOLS.contains(&name) {
            ToolKind::Edit
        } else {
            ToolKind::Other
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub id: String,
    pub name: String,
    pub kind: ToolKind,
    /// Normalized target path; always set for view and edit kinds.
    pub path: Option<String>,
    pub range: Option<LineRange>,
    pub use_message: usize,
    pub result: Option<ToolResult>,
    pub result_message: Option<usize>,
}

impl ToolInfo {
    pub fn succeeded(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| !r.is_error && !r.is_user_declined)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Last tool with a result that touched the file.
    pub last_tool_id: Option<String>,
    /// Last edit that actually succeeded.
    pub edit_tool_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolGraph {
    pub tools: HashMap<String, ToolInfo>,
    pub files: HashMap<String, FileInfo>,
    pub orphan_results: usize,
}

impl ToolGraph {
    /// Invocations that have a result.
    pub fn completed(&self) -> usize {
        self.tools.values().filter(|t| t.result.is_some()).count()
    }

    pub fn edits_with_success(&self) -> usize {
        self.files
            .values()
            .filter(|f| f.edit_tool_id.is_some())
            .count()
    }

    pub fn file(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }
}

pub fn target_path(input: &Value) -> Option<String> {
    PATH_KEYS
        .iter()
        .filter_map(|key| input.get(*key).and_then(Value::as_str))
        .map(normalize_path)
        .find(|p| !p.is_empty())
}

fn line_number(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64)
}

/// `view_range: [start, end]` or `start_line`/`end_line`. A negative end
/// means end of file.
pub fn line_range(input: &Value) -> Option<LineRange> {
    let (start, end) = match input.get("view_range").and_then(Value::as_array) {
        Some(range) => (line_number(range.first()), line_number(range.get(1))),
        None => (
            line_number(input.get("start_line")),
            line_number(input.get("end_line")),
        ),
    };
    let start = usize::try_from(start?).ok()?;
    let end = end.and_then(|e| usize::try_from(e).ok());
    Some(LineRange { start, end })
}

/// Indexes every tool use by id and attaches results in message order.
pub fn build_graph(messages: &[Message]) -> ToolGraph {
    let mut graph = ToolGraph::default();
    for (idx, msg) in messages.iter().enumerate() {
        for block in msg.content.blocks() {
            match block {
                ContentBlock::ToolUse(tool_use) => {
                    if graph.tools.contains_key(&tool_use.id) {
                        continue;
                    }
                    let mut kind = ToolKind::from_name(&tool_use.name);
                    let path = match kind {
                        ToolKind::Other => None,
                        _ => target_path(&tool_use.input),
                    };
                    if path.is_none() {
                        kind = ToolKind::Other;
                    }
                    let range = match kind {
                        ToolKind::View => line_range(&tool_use.input),
                        _ => None,
                    };
                    graph.tools.insert(
                        tool_use.id.clone(),
                        ToolInfo {
                            id: tool_use.id.clone(),
                            name: tool_use.name.clone(),
                            kind,
                            path,
                            range,
                            use_message: idx,
                            result: None,
                            result_message: None,
                        },
                    );
                }
                ContentBlock::ToolResult(result) => {
                    let Some(tool) = graph.tools.get_mut(&result.tool_use_id) else {
                        graph.orphan_results += 1;
                        continue;
                    };
                    if tool.result.is_some() {
                        continue;
                    }
                    tool.result = Some(result.clone());
                    tool.result_message = Some(idx);
                    if let Some(path) = &tool.path {
                        let file = graph.files.entry(path.clone()).or_default();
                        file.last_tool_id = Some(tool.id.clone());
                        if tool.kind == ToolKind::Edit && !result.is_error && !result.is_user_declined {
                            file.edit_tool_id = Some(tool.id.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }
    graph
}
