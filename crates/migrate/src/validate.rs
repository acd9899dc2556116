use core_model::{CURRENT_SCHEMA_VERSION, ConversationRecord, StoreError, StoreResult};
use serde_json::Value;

/// Checks a unified record before it is considered durable: current schema
/// version, a `messages` array, and for every message a known role, non-null
/// content and a timestamp.
pub fn validate_unified(value: &Value) -> StoreResult<()> {
    match value.get("version").and_then(Value::as_str) {
        Some(CURRENT_SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(StoreError::validation(format!(
                "schema version {other} is not current ({CURRENT_SCHEMA_VERSION})"
            )));
        }
        None => return Err(StoreError::validation("schema version missing")),
    }
    let Some(messages) = value.get("messages").and_then(Value::as_array) else {
        return Err(StoreError::validation("messages is not an array"));
    };
    for (idx, msg) in messages.iter().enumerate() {
        match msg.get("role").and_then(Value::as_str) {
            Some("user" | "assistant") => {}
            Some(role) => {
                return Err(StoreError::validation(format!(
                    "message {idx}: unknown role {role}"
                )));
            }
            None => return Err(StoreError::validation(format!("message {idx}: missing role"))),
        }
        if msg.get("content").is_none_or(Value::is_null) {
            return Err(StoreError::validation(format!("message {idx}: missing content")));
        }
        if msg.get("timestamp").is_none_or(Value::is_null) {
            return Err(StoreError::validation(format!("message {idx}: missing timestamp")));
        }
    }
    Ok(())
}

pub fn validate_record(record: &ConversationRecord) -> StoreResult<()> {
    validate_unified(&serde_json::to_value(record)?)
}
