use std::collections::HashSet;

use core_model::{
    ContentBlock, Message, MessageContent, Role, ToolResult, ToolUse, deterministic_id,
};
use serde_json::{Value, json};
use tracing::debug;

mod collab;
mod graph;

pub use collab::{Diagnostic, DiagnosticsProvider, FileReader, FsFileReader, LineRange, NoDiagnostics};
pub use graph::{
    EDIT_TOOLS, FileInfo, ToolGraph, ToolInfo, ToolKind, VIEW_TOOL, build_graph, line_range,
    target_path,
};

pub const DIAGNOSTICS_TOOL: &str = "get_diagnostics";
pub const STALE_VIEW_NOTICE: &str =
    "This view is outdated: the file was changed or viewed again later in the conversation. Refer to the latest view of this file.";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Tool-count budget. `None` keeps every tool invocation structured.
    pub max_tools: Option<usize>,
    pub diagnostics: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub total_tools: usize,
    pub edits_with_success: usize,
    pub text_conversion_count: usize,
    pub converted: usize,
    pub dropped_incomplete: usize,
    pub orphan_results: usize,
    pub stale_views: usize,
    pub refreshed_views: usize,
    pub synthetic_messages: usize,
}

/// Number of the earliest completed invocations to flatten into text so the
/// structured tools plus the synthetic pairs they generate fit `max_tools`.
pub fn text_conversion_count(graph: &ToolGraph, opts: &ReconcileOptions) -> usize {
    let Some(max) = opts.max_tools else {
        return 0;
    };
    let per_edit = if opts.diagnostics { 2 } else { 1 };
    (graph.completed() + graph.edits_with_success() * per_edit).saturating_sub(max)
}

fn with_blocks(msg: &Message, uuid: String, blocks: Vec<ContentBlock>) -> Message {
    let mut out = msg.clone();
    out.uuid = uuid;
    out.content = MessageContent::Blocks(blocks);
    out
}

/// The message carrying only `block`; the original when it holds nothing else.
fn isolate(msg: &Message, id: &str, block: ContentBlock) -> Message {
    if msg.content.blocks().len() == 1 {
        let mut out = msg.clone();
        out.content = MessageContent::Blocks(vec![block]);
        return out;
    }
    with_blocks(msg, deterministic_id(&[&msg.uuid, id]), vec![block])
}

fn synthetic(anchor: &Message, uuid: String, role: Role, block: ContentBlock) -> Message {
    let mut msg = Message::new(
        uuid,
        role,
        MessageContent::Blocks(vec![block]),
        anchor.timestamp.clone(),
    );
    msg.turn_id = anchor.turn_id.clone();
    msg.is_dummy = true;
    msg.visible = false;
    msg
}

fn synthetic_pair(anchor: &Message, tool_use: ToolUse, result: ToolResult) -> [Message; 2] {
    let id = tool_use.id.clone();
    [
        synthetic(
            anchor,
            deterministic_id(&[&id, "use"]),
            Role::Assistant,
            ContentBlock::ToolUse(tool_use),
        ),
        synthetic(
            anchor,
            deterministic_id(&[&id, "result"]),
            Role::User,
            ContentBlock::ToolResult(result),
        ),
    ]
}

fn text_pair(use_msg: &Message, result_msg: &Message, tool: &ToolInfo, input: &Value) -> [Message; 2] {
    let outcome = match &tool.result {
        Some(r) if r.is_user_declined => "declined by user",
        Some(r) if r.is_error => "failed",
        _ => "succeeded",
    };
    let mut call = Message::text(
        deterministic_id(&[&tool.id, "text-use"]),
        Role::Assistant,
        format!("[{}]: {}", tool.name, input),
        use_msg.timestamp.clone(),
    );
    call.turn_id = use_msg.turn_id.clone();
    let mut done = Message::text(
        deterministic_id(&[&tool.id, "text-result"]),
        Role::User,
        format!("[{}]: {}", tool.name, outcome),
        result_msg.timestamp.clone(),
    );
    done.turn_id = result_msg.turn_id.clone();
    [call, done]
}

fn stale_or_live(
    tool_id: &str,
    path: &str,
    range: Option<LineRange>,
    graph: &ToolGraph,
    reader: &dyn FileReader,
    report: &mut ReconcileReport,
) -> (String, bool) {
    let is_last = graph
        .file(path)
        .and_then(|f| f.last_tool_id.as_deref())
        .is_some_and(|last| last == tool_id);
    if !is_last {
        report.stale_views += 1;
        return (STALE_VIEW_NOTICE.to_string(), false);
    }
    report.refreshed_views += 1;
    match reader.read(path, range) {
        Ok(content) => (content, false),
        Err(e) => (format!("failed to read {path}: {e:#}"), true),
    }
}

/// Rewrites `messages` so view results reflect current file content, every
/// successful edit is followed by a fresh view (and diagnostics when asked),
/// incomplete invocations are dropped, and the earliest invocations are
/// flattened to text when the tool budget is exceeded.
pub fn reconcile(
    messages: &[Message],
    opts: &ReconcileOptions,
    reader: &dyn FileReader,
    diagnostics: &dyn DiagnosticsProvider,
) -> (Vec<Message>, ReconcileReport) {
    let graph = build_graph(messages);
    let conversions = text_conversion_count(&graph, opts);
    let mut report = ReconcileReport {
        total_tools: graph.completed(),
        edits_with_success: graph.edits_with_success(),
        text_conversion_count: conversions,
        orphan_results: graph.orphan_results,
        ..Default::default()
    };

    let mut out = Vec::with_capacity(messages.len());
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut processed = 0usize;

    for msg in messages {
        let blocks = msg.content.blocks();
        let has_tools = blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse(_) | ContentBlock::ToolResult(_)));
        if !has_tools {
            out.push(msg.clone());
            continue;
        }

        let rest: Vec<ContentBlock> = blocks
            .iter()
            .filter(|b| !matches!(b, ContentBlock::ToolUse(_) | ContentBlock::ToolResult(_)))
            .cloned()
            .collect();
        if !rest.is_empty() {
            out.push(with_blocks(msg, msg.uuid.clone(), rest));
        }

        for block in blocks {
            let ContentBlock::ToolUse(tool_use) = block else {
                continue;
            };
            if !emitted.insert(tool_use.id.as_str()) {
                continue;
            }
            let Some(tool) = graph.tools.get(&tool_use.id) else {
                continue;
            };
            let (Some(result), Some(result_idx)) = (&tool.result, tool.result_message) else {
                report.dropped_incomplete += 1;
                continue;
            };
            let result_msg = &messages[result_idx];
            processed += 1;

            if processed <= conversions {
                out.extend(text_pair(msg, result_msg, tool, &tool_use.input));
                report.converted += 1;
                continue;
            }

            out.push(isolate(msg, &tool.id, block.clone()));
            let mut result = result.clone();
            if tool.kind == ToolKind::View
                && let Some(path) = &tool.path
            {
                let (content, is_error) =
                    stale_or_live(&tool.id, path, tool.range, &graph, reader, &mut report);
                result.content = content;
                result.is_error = is_error;
            }
            let succeeded = tool.succeeded();
            out.push(isolate(result_msg, &tool.id, ContentBlock::ToolResult(result)));

            if tool.kind != ToolKind::Edit || !succeeded {
                continue;
            }
            let Some(path) = &tool.path else {
                continue;
            };

            let view_id = deterministic_id(&["synthetic-view", &tool.id]);
            let (content, is_error) = stale_or_live(&tool.id, path, None, &graph, reader, &mut report);
            out.extend(synthetic_pair(
                result_msg,
                ToolUse {
                    id: view_id.clone(),
                    name: VIEW_TOOL.to_string(),
                    input: json!({ "path": path }),
                },
                ToolResult {
                    tool_use_id: view_id,
                    content,
                    is_error,
                    is_user_declined: false,
                },
            ));
            report.synthetic_messages += 2;

            let is_latest_edit = graph
                .file(path)
                .and_then(|f| f.edit_tool_id.as_deref())
                .is_some_and(|id| id == tool.id);
            if opts.diagnostics && is_latest_edit {
                let diag_id = deterministic_id(&["synthetic-diagnostics", &tool.id]);
                let (content, is_error) = match diagnostics.diagnostics(path) {
                    Ok(list) => match serde_json::to_string(&list) {
                        Ok(encoded) => (encoded, false),
                        Err(e) => (format!("failed to encode diagnostics: {e}"), true),
                    },
                    Err(e) => (format!("failed to get diagnostics for {path}: {e:#}"), true),
                };
                out.extend(synthetic_pair(
                    result_msg,
                    ToolUse {
                        id: diag_id.clone(),
                        name: DIAGNOSTICS_TOOL.to_string(),
                        input: json!({ "path": path }),
                    },
                    ToolResult {
                        tool_use_id: diag_id,
                        content,
                        is_error,
                        is_user_declined: false,
                    },
                ));
                report.synthetic_messages += 2;
            }
        }
    }

    debug!(
        total_tools = report.total_tools,
        converted = report.converted,
        dropped = report.dropped_incomplete,
        stale = report.stale_views,
        synthetic = report.synthetic_messages,
        "history reconciled"
    );
    (out, report)
}
