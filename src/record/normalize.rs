use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::date_util::{ms_to_utc, parse_iso_utc};
use crate::record::types::{DetailFields, NormalizedRecord, RawRecord};

/// Follow a dotted path (`assignment.reason`) through nested objects.
fn lookup<'a>(raw: &'a RawRecord, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = raw.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numbers are millisecond epochs; strings are ISO-8601 or numeric epochs.
fn to_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(ms_to_utc),
        Value::String(s) => parse_iso_utc(s).or_else(|| s.trim().parse::<i64>().ok().and_then(ms_to_utc)),
        _ => None,
    }
}

/// First path that holds a usable string.
fn first_string(raw: &RawRecord, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| lookup(raw, p).and_then(to_string))
}

/// First path that holds a parseable timestamp.
fn first_timestamp(raw: &RawRecord, paths: &[&str]) -> Option<DateTime<Utc>> {
    paths.iter().find_map(|p| lookup(raw, p).and_then(to_timestamp))
}

/// The `createdAt`-style value of a raw record, parsed.
pub fn created_at(raw: &RawRecord) -> Option<DateTime<Utc>> {
    first_timestamp(raw, &["createdAt", "created_at"])
}

/// Normalize a bulk export row (snake_case keys, millisecond timestamps).
/// The export has no separate answer timestamp, so `assigned_at` doubles as one.
pub fn from_export(raw: &RawRecord) -> Option<NormalizedRecord> {
    let id = first_string(raw, &["id", "conversation_id"])?;
    Some(NormalizedRecord {
        id,
        created_at: first_timestamp(raw, &["created_at"]),
        queued_at: first_timestamp(raw, &["queued_at"]),
        answered_at: first_timestamp(raw, &["answered_at", "assigned_at"]),
        assigned_at: first_timestamp(raw, &["assigned_at"]),
        offered_at: first_timestamp(raw, &["offered_at"]),
        closed_at: first_timestamp(raw, &["closed_at"]),
        state: first_string(raw, &["status", "state"]),
        direction: first_string(raw, &["direction"]),
        channel: first_string(raw, &["initial_channel", "channel"]),
        assignee_id: first_string(raw, &["assignee_id"]),
        assignee_name: first_string(raw, &["assignee_name"]),
        queue_id: first_string(raw, &["queue_id"]),
        queue_name: first_string(raw, &["queue_name"]),
        assignment_reason: first_string(raw, &["assignment_reason"]),
    })
}

/// Normalize a search hit (camelCase keys, ISO-8601 timestamps). Flat fields
/// win over their nested `assignment`/`queue` counterparts. `default_channel`
/// fills the channel when the hit omits it, since the search was already
/// filtered on it.
pub fn from_search(raw: &RawRecord, default_channel: Option<&str>) -> Option<NormalizedRecord> {
    let id = first_string(raw, &["id"])?;
    Some(NormalizedRecord {
        id,
        created_at: created_at(raw),
        queued_at: first_timestamp(raw, &["queuedAt"]),
        answered_at: first_timestamp(raw, &["answeredAt"]),
        assigned_at: first_timestamp(raw, &["assignedAt", "assignment.assignedAt"]),
        offered_at: first_timestamp(raw, &["offeredAt", "assignment.offeredAt"]),
        closed_at: first_timestamp(raw, &["closedAt"]),
        state: first_string(raw, &["state"]),
        direction: first_string(raw, &["direction"]),
        channel: first_string(raw, &["channel", "initialChannel"])
            .or_else(|| default_channel.map(str::to_string)),
        assignee_id: first_string(raw, &["assigneeId", "assignment.assignee.id"]),
        assignee_name: first_string(raw, &["assigneeName", "assignment.assignee.name"]),
        queue_id: first_string(raw, &["queueId", "queue.id"]),
        queue_name: first_string(raw, &["queueName", "queue.name"]),
        assignment_reason: first_string(raw, &["assignmentReason", "assignment.reason"]),
    })
}

/// Extract the overriding fields from a detail payload (the `data` object).
pub fn detail_fields(data: &RawRecord) -> DetailFields {
    DetailFields {
        answered_at: first_timestamp(data, &["answeredAt"]),
        assignment_reason: first_string(data, &["assignment.reason"]),
        assigned_at: first_timestamp(data, &["assignment.assignedAt"]),
        offered_at: first_timestamp(data, &["assignment.offeredAt"]),
        queue_id: first_string(data, &["queue.id"]),
        queue_name: first_string(data, &["queue.name"]),
        state: first_string(data, &["state"]),
    }
}
