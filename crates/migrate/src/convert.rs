use chrono::Utc;
use core_model::{
    CURRENT_SCHEMA_VERSION, ConversationRecord, LegacyEntry, LegacyRecord, Message,
    MigrationMetadata, OriginalFormat, Role, Timestamp, deterministic_id,
};
use serde_json::Value;

/// Expands legacy entries into messages, in order: a user message for a
/// non-empty `request`, then an assistant message for a non-empty `response`.
/// Entries are never merged or reordered.
pub fn entries_to_messages(
    filename: &str,
    entries: &[LegacyEntry],
    fallback_ts: &Timestamp,
) -> Vec<Message> {
    let mut out = Vec::with_capacity(entries.len() * 2);
    for (idx, entry) in entries.iter().enumerate() {
        let idx = idx.to_string();
        let timestamp = entry.timestamp.clone().unwrap_or_else(|| fallback_ts.clone());
        let visible = entry.visible.unwrap_or(true);
        let turn_id = deterministic_id(&[filename, "turn", &idx]);

        if let Some(request) = entry.request.as_deref().filter(|s| !s.is_empty()) {
            let mut msg = Message::text(
                deterministic_id(&[filename, "entry", &idx, Role::User.as_str()]),
                Role::User,
                request,
                timestamp.clone(),
            );
            msg.turn_id = Some(turn_id.clone());
            msg.visible = visible;
            msg.is_user_submission = true;
            msg.selected_filepaths = entry.selected_filepaths.clone();
            msg.selected_code = entry.selected_code.clone();
            out.push(msg);
        }
        if let Some(response) = entry.response.as_deref().filter(|s| !s.is_empty()) {
            let mut msg = Message::text(
                deterministic_id(&[filename, "entry", &idx, Role::Assistant.as_str()]),
                Role::Assistant,
                response,
                timestamp,
            );
            msg.turn_id = Some(turn_id);
            msg.visible = visible;
            out.push(msg);
        }
    }
    out
}

/// Top-level keys the unified record serializes itself. A legacy document
/// may carry any of them as unknown fields; they must not reach `extra`.
const RECORD_KEYS: &[&str] = &[
    "version",
    "title",
    "timestamp",
    "created_at",
    "filename",
    "messages",
    "entries",
    "migration_metadata",
];

/// Converts a legacy record to the unified format and stamps migration
/// metadata. `backup_file` names the backup taken before the conversion.
pub fn upgrade_legacy(legacy: LegacyRecord, backup_file: Option<String>) -> ConversationRecord {
    let LegacyRecord {
        title,
        timestamp,
        filename,
        entries,
        mut extra,
        ..
    } = legacy;
    let source_version = extra
        .get("version")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let created_at = extra
        .get("created_at")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    extra.retain(|key, _| !RECORD_KEYS.contains(&key.as_str()));

    let updated = timestamp.unwrap_or_else(Timestamp::now);
    let messages = entries_to_messages(&filename, &entries, &updated);
    ConversationRecord {
        version: CURRENT_SCHEMA_VERSION.to_string(),
        title,
        timestamp: updated.to_string(),
        created_at,
        filename,
        messages,
        migration_metadata: Some(MigrationMetadata {
            version: CURRENT_SCHEMA_VERSION.to_string(),
            migrated_at: Utc::now(),
            original_format: OriginalFormat::Legacy,
            entry_count: entries.len(),
            backup_file,
            source_version,
        }),
        extra,
    }
}

/// Restamps a unified record that predates the current schema version.
/// Returns whether anything changed.
pub fn ensure_current_version(record: &mut ConversationRecord) -> bool {
    if record.version == CURRENT_SCHEMA_VERSION {
        return false;
    }
    record.version = CURRENT_SCHEMA_VERSION.to_string();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(request: Option<&str>, response: Option<&str>, ts: i64) -> LegacyEntry {
        LegacyEntry {
            request: request.map(str::to_string),
            response: response.map(str::to_string),
            timestamp: Some(Timestamp::Unix(ts)),
            visible: None,
            selected_filepaths: None,
            selected_code: None,
        }
    }

    #[test]
    fn fix_bug_scenario() {
        let legacy: LegacyRecord = serde_json::from_value(json!({
            "entries": [{"request": "fix bug", "response": "done", "timestamp": 1000}]
        }))
        .unwrap();
        let record = upgrade_legacy(legacy, None);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["version"], "2.0");
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "fix bug");
        assert_eq!(value["messages"][0]["timestamp"], 1000);
        assert_eq!(value["messages"][1]["role"], "assistant");
        assert_eq!(value["messages"][1]["content"], "done");
        assert_eq!(value["messages"][1]["timestamp"], 1000);
        assert_eq!(value["migration_metadata"]["original_format"], "legacy");
        assert_eq!(value["migration_metadata"]["entry_count"], 1);
        assert!(value.get("entries").is_none());
    }

    #[test]
    fn record_keys_in_legacy_doc_are_not_duplicated() {
        let legacy: LegacyRecord = serde_json::from_value(json!({
            "version": "1.0",
            "created_at": "2023-01-01T00:00:00+00:00",
            "migration_metadata": {"version": "2.0", "entry_count": 9},
            "project": "demo",
            "title": "old",
            "entries": [{"request": "fix bug", "response": "done", "timestamp": 1000}],
            "messages": [{"role": "user", "content": "half migrated", "timestamp": 1}]
        }))
        .unwrap();
        let record = upgrade_legacy(legacy, None);
        assert_eq!(record.extra.len(), 1);
        assert_eq!(record.extra["project"], "demo");
        assert_eq!(record.created_at.as_deref(), Some("2023-01-01T00:00:00+00:00"));
        let meta = record.migration_metadata.as_ref().unwrap();
        assert_eq!(meta.source_version.as_deref(), Some("1.0"));
        assert_eq!(meta.entry_count, 1);

        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text.matches("\"version\":").count(), 2);
        assert_eq!(text.matches("\"migration_metadata\":").count(), 1);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["version"], CURRENT_SCHEMA_VERSION);
        assert_eq!(value["migration_metadata"]["entry_count"], 1);
        assert_eq!(value["messages"][0]["content"], "fix bug");
    }

    #[test]
    fn empty_fields_are_skipped_and_order_kept() {
        let entries = vec![
            entry(Some("q1"), Some(""), 1),
            entry(None, Some("a2"), 2),
            entry(Some(""), None, 3),
            entry(Some("q4"), Some("a4"), 4),
        ];
        let msgs = entries_to_messages("1.json", &entries, &Timestamp::Unix(0));
        let shape: Vec<(Role, String)> = msgs
            .iter()
            .map(|m| (m.role, m.content.as_text()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (Role::User, "q1".to_string()),
                (Role::Assistant, "a2".to_string()),
                (Role::User, "q4".to_string()),
                (Role::Assistant, "a4".to_string()),
            ]
        );
        assert_eq!(msgs[2].timestamp, Timestamp::Unix(4));
    }

    #[test]
    fn user_message_carries_selection_and_flags() {
        let mut e = entry(Some("look"), Some("ok"), 5);
        e.visible = Some(false);
        e.selected_filepaths = Some(vec!["src/lib.rs".to_string()]);
        e.selected_code = Some(json!({"content": "fn x() {}"}));
        let msgs = entries_to_messages("1.json", &[e], &Timestamp::Unix(0));
        assert!(msgs[0].is_user_submission);
        assert!(!msgs[0].visible);
        assert_eq!(msgs[0].selected_filepaths.as_deref(), Some(&["src/lib.rs".to_string()][..]));
        assert!(msgs[0].selected_code.is_some());
        assert!(!msgs[1].is_user_submission);
        assert!(!msgs[1].visible);
        assert!(msgs[1].selected_code.is_none());
        assert_eq!(msgs[0].turn_id, msgs[1].turn_id);
    }

    #[test]
    fn missing_entry_timestamp_falls_back_to_record() {
        let mut e = entry(Some("q"), None, 0);
        e.timestamp = None;
        let msgs = entries_to_messages("1.json", &[e], &Timestamp::Text("2024-05-01".to_string()));
        assert_eq!(msgs[0].timestamp, Timestamp::Text("2024-05-01".to_string()));
    }

    #[test]
    fn message_ids_are_deterministic() {
        let entries = vec![entry(Some("q"), Some("a"), 1)];
        let a = entries_to_messages("1.json", &entries, &Timestamp::Unix(0));
        let b = entries_to_messages("1.json", &entries, &Timestamp::Unix(0));
        assert_eq!(a[0].uuid, b[0].uuid);
        assert_ne!(a[0].uuid, a[1].uuid);
        let other = entries_to_messages("2.json", &entries, &Timestamp::Unix(0));
        assert_ne!(a[0].uuid, other[0].uuid);
    }

    #[test]
    fn version_restamp() {
        let mut record = ConversationRecord::new("1.json", "t");
        assert!(!ensure_current_version(&mut record));
        record.version = "1.0".to_string();
        assert!(ensure_current_version(&mut record));
        assert_eq!(record.version, CURRENT_SCHEMA_VERSION);
    }
}
