use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::date_util::format_iso_z;
use crate::error::Result;
use crate::record::MetricRecord;
use crate::ExportMode;

/// Output columns, in order.
pub const COLUMNS: &[&str] = &[
    "id",
    "createdAt",
    "queuedAt",
    "answeredAt",
    "assignedAt",
    "offeredAt",
    "closedAt",
    "state",
    "direction",
    "channel",
    "assigneeId",
    "assigneeName",
    "queueId",
    "queueName",
    "assignmentReason",
    "callType",
    "AnsweredWithin1Min",
    "TakenFromQueue",
    "TakenFromForward",
    "RejectedOrForwarded",
    "TimeToAnswerSeconds",
    "CallDurationSeconds",
    "DetailEnriched",
];

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn text(value: &Option<String>) -> String {
    csv_escape(value.as_deref().unwrap_or(""))
}

fn timestamp(value: &Option<DateTime<Utc>>) -> String {
    value.as_ref().map_or(String::new(), format_iso_z)
}

fn number(value: Option<i64>) -> String {
    value.map_or(String::new(), |n| n.to_string())
}

fn row(r: &MetricRecord) -> Vec<String> {
    let rec = &r.record;
    let m = &r.metrics;
    vec![
        csv_escape(&rec.id),
        timestamp(&rec.created_at),
        timestamp(&rec.queued_at),
        timestamp(&rec.answered_at),
        timestamp(&rec.assigned_at),
        timestamp(&rec.offered_at),
        timestamp(&rec.closed_at),
        text(&rec.state),
        text(&rec.direction),
        text(&rec.channel),
        text(&rec.assignee_id),
        text(&rec.assignee_name),
        text(&rec.queue_id),
        text(&rec.queue_name),
        text(&rec.assignment_reason),
        m.call_type.as_str().to_string(),
        m.answered_within_threshold.to_string(),
        m.taken_from_queue.to_string(),
        m.taken_from_forward.to_string(),
        m.rejected_or_forwarded.to_string(),
        number(m.time_to_answer_secs),
        number(m.call_duration_secs),
        r.enriched.to_string(),
    ]
}

/// Render records as CSV. The header is always present.
pub fn to_csv(records: &[MetricRecord]) -> String {
    let mut out = String::new();
    out.push_str(&COLUMNS.join(","));
    out.push('\n');
    for r in records {
        out.push_str(&row(r).join(","));
        out.push('\n');
    }
    out
}

/// Write records to `path` as CSV, replacing any existing file.
pub fn write_csv(path: &Path, records: &[MetricRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, to_csv(records))?;
    log::info!("Wrote {} rows to {}", records.len(), path.display());
    Ok(())
}

/// Headline numbers for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub mode: ExportMode,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total: usize,
    pub answered_within_1min: usize,
    pub rejected_or_forwarded: usize,
    pub via_queue: usize,
    pub via_forward: usize,
    pub duplicates_removed: usize,
    /// Raw records dropped because they had no usable id.
    pub skipped: usize,
    pub details_ok: usize,
    pub details_failed: usize,
}

impl ExportSummary {
    /// Count the metric flags over `records`. Lookup and dedup counts start at
    /// zero for the caller to fill in.
    pub fn tally(mode: ExportMode, start: NaiveDate, end: NaiveDate, records: &[MetricRecord]) -> Self {
        let count = |f: fn(&MetricRecord) -> bool| records.iter().filter(|r| f(r)).count();
        Self {
            mode,
            start,
            end,
            total: records.len(),
            answered_within_1min: count(|r| r.metrics.answered_within_threshold),
            rejected_or_forwarded: count(|r| r.metrics.rejected_or_forwarded),
            via_queue: count(|r| r.metrics.taken_from_queue),
            via_forward: count(|r| r.metrics.taken_from_forward),
            duplicates_removed: 0,
            skipped: 0,
            details_ok: 0,
            details_failed: 0,
        }
    }
}
