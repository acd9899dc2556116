use core_model::{
    ConversationRecord, DocumentFormat, HistoryDocument, LegacyRecord, StoreResult,
};
use serde_json::Value;

fn non_empty_array(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty())
}

/// Classifies a raw record. Populated `messages` alone is unified, populated
/// `entries` alone is legacy, both is an interrupted migration, and an empty
/// history defaults to the current schema.
pub fn detect_format(value: &Value) -> DocumentFormat {
    match (
        non_empty_array(value, "entries"),
        non_empty_array(value, "messages"),
    ) {
        (true, true) => DocumentFormat::AmbiguousLegacy,
        (true, false) => DocumentFormat::Legacy,
        (false, _) => DocumentFormat::Unified,
    }
}

/// Deserializes `value` as the shape named by `format`.
pub fn parse_document(value: Value, format: DocumentFormat) -> StoreResult<HistoryDocument> {
    Ok(match format {
        DocumentFormat::Legacy | DocumentFormat::AmbiguousLegacy => {
            HistoryDocument::Legacy(serde_json::from_value::<LegacyRecord>(value)?)
        }
        DocumentFormat::Unified => {
            let mut value = value;
            if let Some(obj) = value.as_object_mut() {
                obj.remove("entries");
            }
            HistoryDocument::Unified(serde_json::from_value::<ConversationRecord>(value)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detection_table() {
        let cases = [
            (json!({"messages": [{}]}), DocumentFormat::Unified),
            (json!({"entries": [{}]}), DocumentFormat::Legacy),
            (json!({"entries": [{}], "messages": []}), DocumentFormat::Legacy),
            (json!({"entries": [], "messages": [{}]}), DocumentFormat::Unified),
            (json!({"entries": [{}], "messages": [{}]}), DocumentFormat::AmbiguousLegacy),
            (json!({"entries": [], "messages": []}), DocumentFormat::Unified),
            (json!({"title": "empty"}), DocumentFormat::Unified),
            (json!({"entries": "not an array"}), DocumentFormat::Unified),
        ];
        for (value, expected) in cases {
            assert_eq!(detect_format(&value), expected, "{value}");
        }
    }

    #[test]
    fn unified_parse_drops_empty_entries() {
        let doc = parse_document(
            json!({"version": "2.0", "entries": [], "messages": [], "filename": "1.json"}),
            DocumentFormat::Unified,
        )
        .unwrap();
        match doc {
            HistoryDocument::Unified(record) => assert!(!record.extra.contains_key("entries")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn legacy_parse_keeps_entries() {
        let doc = parse_document(
            json!({"title": "t", "entries": [{"request": "hi", "timestamp": 1}]}),
            DocumentFormat::Legacy,
        )
        .unwrap();
        match doc {
            HistoryDocument::Legacy(record) => assert_eq!(record.entries.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
