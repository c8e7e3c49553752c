//! Purpose: Shared queue-report JSON serializers for the CLI.
//! Exports: `queue_info_json`, `record_json`.
//! Role: Keep the report and record envelope shape consistent across commands.
//! Invariants: Stable key names/order for queue info payloads.
//! Invariants: Arguments are strings when valid UTF-8, otherwise `{"hex": ...}`.

use backstore::api::{QueueIssue, QueueRecord, QueueReport, QueueStatus};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn queue_info_json(report: &QueueReport) -> Value {
    let mut map = Map::new();
    map.insert("path".to_string(), json!(report.path.display().to_string()));
    map.insert("file_size".to_string(), json!(report.file_size));
    map.insert("capacity".to_string(), json!(report.capacity));
    map.insert("in_use".to_string(), json!(report.in_use));
    map.insert(
        "header".to_string(),
        json!({
            "write_count": report.header.write_count,
            "read_count": report.header.read_count,
            "dirty_size": report.header.dirty_size,
        }),
    );
    map.insert("outstanding".to_string(), json!(report.header.outstanding()));
    map.insert("record_count".to_string(), json!(report.record_count));
    map.insert("status".to_string(), json!(status_label(report.status)));
    if !report.issues.is_empty() {
        map.insert(
            "issues".to_string(),
            Value::Array(report.issues.iter().map(issue_json).collect()),
        );
    }
    if !report.remediation_hints.is_empty() {
        map.insert("remediation_hints".to_string(), json!(report.remediation_hints));
    }
    Value::Object(map)
}

pub(crate) fn record_json(record: &QueueRecord) -> Value {
    let mut map = Map::new();
    map.insert("counter".to_string(), json!(record.counter));
    map.insert("timestamp".to_string(), json!(record.timestamp));
    if let Some(time) = rfc3339(record.timestamp) {
        map.insert("time".to_string(), json!(time));
    }
    map.insert("command".to_string(), json!(record.command.name()));
    map.insert(
        "args".to_string(),
        Value::Array(record.args.iter().map(|arg| arg_json(arg)).collect()),
    );
    Value::Object(map)
}

fn issue_json(issue: &QueueIssue) -> Value {
    let mut map = Map::new();
    map.insert("code".to_string(), json!(issue.code));
    map.insert("message".to_string(), json!(issue.message));
    if let Some(offset) = issue.offset {
        map.insert("offset".to_string(), json!(offset));
    }
    Value::Object(map)
}

fn status_label(status: QueueStatus) -> &'static str {
    match status {
        QueueStatus::Ok => "ok",
        QueueStatus::Corrupt => "corrupt",
    }
}

fn arg_json(arg: &[u8]) -> Value {
    match std::str::from_utf8(arg) {
        Ok(text) => json!(text),
        Err(_) => {
            let hex: String = arg.iter().map(|byte| format!("{byte:02x}")).collect();
            json!({ "hex": hex })
        }
    }
}

fn rfc3339(timestamp: u32) -> Option<String> {
    let ts = OffsetDateTime::from_unix_timestamp(i64::from(timestamp)).ok()?;
    ts.format(&Rfc3339).ok()
}
