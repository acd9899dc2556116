use std::io::{self, IsTerminal};

use core_model::{ContentBlock, ListItem, Message, SearchHit};
use engine::CollectionHealth;
use migrate::MigrationSummary;
use owo_colors::OwoColorize;
use reconcile::ReconcileReport;
use store_fs::BackupInfo;

pub fn color_enabled() -> bool {
    io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

fn paint(text: String, use_color: bool, style: fn(&str) -> String) -> String {
    if use_color { style(&text) } else { text }
}

fn bold(s: &str) -> String {
    s.bold().to_string()
}

fn dimmed(s: &str) -> String {
    s.dimmed().to_string()
}

fn cyan(s: &str) -> String {
    s.cyan().to_string()
}

fn magenta(s: &str) -> String {
    s.magenta().to_string()
}

fn red(s: &str) -> String {
    s.red().to_string()
}

fn yellow(s: &str) -> String {
    s.yellow().to_string()
}

pub fn truncate_text(input: &str, max: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max {
            out.push_str("...");
            return out;
        }
        out.push(if ch == '\n' { ' ' } else { ch });
    }
    out
}

pub fn print_list(items: &[ListItem]) {
    let use_color = color_enabled();
    let separator = paint(" | ".to_string(), use_color, dimmed);
    for item in items {
        let id = paint(format!("{:>4}", item.id), use_color, cyan);
        if let Some(error) = &item.error {
            let error = paint(format!("broken: {error}"), use_color, red);
            println!("{id}{separator}{error}");
            continue;
        }
        let title = if item.title.trim().is_empty() {
            "Untitled".to_string()
        } else {
            truncate_text(&item.title, 60)
        };
        let title = paint(title, use_color, bold);
        let count = paint(format!("{} msgs", item.message_count), use_color, magenta);
        let date = paint(item.updated_at.clone(), use_color, dimmed);
        let format = match item.format {
            Some(f) if f.needs_migration() => paint(format!("{separator}{f}"), use_color, yellow),
            _ => String::new(),
        };
        println!("{id}{separator}{title}{separator}{count}{separator}{date}{format}");
    }
}

/// One line per block so tool traffic stays readable in a terminal.
pub fn message_lines(msg: &Message) -> Vec<String> {
    let mut lines = Vec::new();
    let text = msg.content.as_text();
    if !text.trim().is_empty() {
        lines.push(truncate_text(&text, 200));
    }
    for block in msg.content.blocks() {
        match block {
            ContentBlock::ToolUse(u) => {
                lines.push(format!("-> {} {}", u.name, truncate_text(&u.input.to_string(), 120)));
            }
            ContentBlock::ToolResult(r) => {
                let status = if r.is_user_declined {
                    "declined"
                } else if r.is_error {
                    "error"
                } else {
                    "ok"
                };
                lines.push(format!("<- {status} {}", truncate_text(&r.content, 120)));
            }
            _ => {}
        }
    }
    lines
}

pub fn print_messages(messages: &[Message]) {
    let use_color = color_enabled();
    for msg in messages {
        let mut role = format!("[{}]", msg.role);
        if msg.is_dummy {
            role.push_str(" (synthetic)");
        }
        let role = paint(role, use_color, bold);
        let ts = paint(msg.timestamp.to_string(), use_color, dimmed);
        println!("{role} {ts}");
        for line in message_lines(msg) {
            println!("    {line}");
        }
    }
}

pub fn print_hits(hits: &[SearchHit]) {
    let use_color = color_enabled();
    for hit in hits {
        let id = paint(format!("{:>4}", hit.id), use_color, cyan);
        let title = paint(truncate_text(&hit.title, 40), use_color, bold);
        println!("{id} {title} [{}] {}", hit.role, hit.snippet);
    }
}

pub fn print_backups(backups: &[BackupInfo]) {
    for b in backups {
        println!(
            "{} {} bytes {}",
            b.meta.created_at.to_rfc3339(),
            b.meta.size,
            b.path.display()
        );
    }
}

pub fn print_summary(summary: &MigrationSummary, dry_run: bool) {
    if dry_run {
        println!(
            "scanned={} would_migrate={} current={} failed={}",
            summary.scanned, summary.pending_count, summary.skipped_count, summary.failed_count
        );
    } else {
        println!(
            "scanned={} migrated={} current={} failed={}",
            summary.scanned, summary.migrated_count, summary.skipped_count, summary.failed_count
        );
    }
    for err in &summary.errors {
        println!("  {} [{}] {}", err.file.display(), err.kind, err.message);
    }
}

pub fn print_report(report: &ReconcileReport) {
    println!(
        "tools={} successful_edits={} flattened={} dropped={} stale_views={} refreshed_views={} synthetic={}",
        report.total_tools,
        report.edits_with_success,
        report.converted,
        report.dropped_incomplete,
        report.stale_views,
        report.refreshed_views,
        report.synthetic_messages
    );
}

pub fn print_health(health: &CollectionHealth) {
    let use_color = color_enabled();
    println!(
        "records={} unified={} legacy={} ambiguous={} broken={} backups={}",
        health.records,
        health.unified,
        health.legacy,
        health.ambiguous,
        health.broken.len(),
        health.backups
    );
    let sections = [
        ("broken record", &health.broken),
        ("stale lock", &health.stale_locks),
        ("live lock", &health.live_locks),
        ("temp file", &health.temp_files),
    ];
    for (label, paths) in sections {
        for path in paths {
            println!("  {} {}", paint(label.to_string(), use_color, yellow), path.display());
        }
    }
    let verdict = if health.is_clean() { "ok" } else { "attention needed" };
    println!("status={verdict}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{MessageContent, Role, Timestamp, ToolResult, ToolUse};
    use serde_json::json;

    #[test]
    fn truncate_text_respects_chars() {
        assert_eq!(truncate_text("héllo", 10), "héllo");
        assert_eq!(truncate_text("héllo", 2), "hé...");
        assert_eq!(truncate_text("a\nb", 10), "a b");
    }

    #[test]
    fn message_lines_show_tool_blocks() {
        let msg = Message::new(
            "m",
            Role::Assistant,
            MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "checking".to_string(),
                },
                ContentBlock::ToolUse(ToolUse {
                    id: "t".to_string(),
                    name: "view".to_string(),
                    input: json!({"path": "a.txt"}),
                }),
                ContentBlock::ToolResult(ToolResult {
                    tool_use_id: "t".to_string(),
                    content: "boom".to_string(),
                    is_error: true,
                    is_user_declined: false,
                }),
            ]),
            Timestamp::Unix(1),
        );
        assert_eq!(
            message_lines(&msg),
            vec![
                "checking".to_string(),
                r#"-> view {"path":"a.txt"}"#.to_string(),
                "<- error boom".to_string(),
            ]
        );
    }
}
