use std::{cmp::Reverse, fs, path::Path};

use chrono::{DateTime, NaiveDateTime};
use core_model::{DocumentFormat, ListItem, ListOptions, ListSort, StoreError, StoreResult};
use migrate::detect_format;
use rayon::prelude::*;
use serde_json::Value;
use store_fs::layout;
use tracing::warn;

const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Unix seconds for a record-level timestamp in any of the shapes found on
/// disk; 0 when it cannot be read.
pub(crate) fn timestamp_key(raw: Option<&Value>) -> i64 {
    match raw {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) if v > 100_000_000_000 => v / 1000,
            Some(v) => v,
            None => 0,
        },
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.timestamp())
            .or_else(|_| NaiveDateTime::parse_from_str(s, LEGACY_TIME_FORMAT).map(|n| n.and_utc().timestamp()))
            .unwrap_or(0),
        _ => 0,
    }
}

fn display_timestamp(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

struct Listed {
    updated: i64,
    item: ListItem,
}

fn read_item(path: &Path) -> StoreResult<Listed> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let value: Value = serde_json::from_slice(&bytes)?;
    if !value.is_object() {
        return Err(StoreError::validation("record must be a json object"));
    }
    let format = detect_format(&value);
    let history_key = match format {
        DocumentFormat::Legacy => "entries",
        _ => "messages",
    };
    let raw_ts = value.get("timestamp");
    Ok(Listed {
        updated: timestamp_key(raw_ts),
        item: ListItem {
            id: layout::record_id(path).unwrap_or_default(),
            filename: file_name(path),
            title: value
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            updated_at: display_timestamp(raw_ts),
            message_count: value
                .get(history_key)
                .and_then(Value::as_array)
                .map_or(0, Vec::len),
            format: Some(format),
            error: None,
        },
    })
}

fn broken_item(path: &Path, err: &StoreError) -> Listed {
    Listed {
        updated: 0,
        item: ListItem {
            id: layout::record_id(path).unwrap_or_default(),
            filename: file_name(path),
            title: String::new(),
            updated_at: String::new(),
            message_count: 0,
            format: None,
            error: Some(err.to_string()),
        },
    }
}

/// Numeric ids sort numerically, everything else after them by name.
fn id_key(id: &str) -> (u64, String) {
    (id.parse().unwrap_or(u64::MAX), id.to_string())
}

/// Lists the records in `dir`. A file that cannot be read never fails the
/// listing; it is reported as a broken item or skipped.
pub(crate) fn list_dir(dir: &Path, opts: &ListOptions) -> StoreResult<Vec<ListItem>> {
    let files = layout::collect_record_files(dir)?;
    let mut listed: Vec<Listed> = files
        .par_iter()
        .filter_map(|path| match read_item(path) {
            Ok(listed) => Some(listed),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable record");
                opts.include_broken.then(|| broken_item(path, &e))
            }
        })
        .collect();

    match opts.sort {
        ListSort::UpdatedDesc => {
            listed.sort_by_key(|l| (Reverse(l.updated), Reverse(id_key(&l.item.id))))
        }
        ListSort::UpdatedAsc => listed.sort_by_key(|l| (l.updated, id_key(&l.item.id))),
        ListSort::Filename => listed.sort_by_key(|l| id_key(&l.item.id)),
    }
    let mut items: Vec<ListItem> = listed.into_iter().map(|l| l.item).collect();
    if let Some(limit) = opts.limit {
        items.truncate(limit);
    }
    Ok(items)
}
