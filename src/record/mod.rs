pub mod normalize;
pub mod types;

use std::collections::HashSet;

use chrono::{DateTime, Utc};

pub use types::*;

/// Calls answered within this many milliseconds of creation count as fast.
pub const ANSWER_THRESHOLD_MS: i64 = 60_000;

/// Result of the reconciliation pass.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub records: Vec<MetricRecord>,
    pub duplicates_removed: usize,
}

/// Keep the first record seen for each id, preserving input order.
/// Returns the survivors and how many were dropped.
pub fn deduplicate<T, F>(records: Vec<T>, id_of: F) -> (Vec<T>, usize)
where
    F: Fn(&T) -> &str,
{
    let before = records.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(before);
    let kept: Vec<T> = records
        .into_iter()
        .filter(|r| seen.insert(id_of(r).to_string()))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Deduplicate, then derive metrics for every surviving record.
pub fn reconcile(records: Vec<EnrichedRecord>) -> Reconciled {
    let (records, duplicates_removed) = deduplicate(records, |r| r.record.id.as_str());
    if duplicates_removed > 0 {
        log::info!("Removed {duplicates_removed} duplicate ids");
    }
    let records = records
        .into_iter()
        .map(|e| {
            let metrics = derive_metrics(&e.record);
            MetricRecord {
                record: e.record,
                enriched: e.enriched,
                metrics,
            }
        })
        .collect();
    Reconciled {
        records,
        duplicates_removed,
    }
}

fn seconds_between(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<i64> {
    Some((to? - from?).num_seconds())
}

/// An explicit `forward` or `rejected` assignment reason.
fn reason_is_rejection(reason: Option<&str>) -> bool {
    reason.is_some_and(|r| r.eq_ignore_ascii_case("forward") || r.eq_ignore_ascii_case("rejected"))
}

/// Classify by assignment reason. With no reason at all, fall back to what
/// the timestamps say: queued-and-answered is a queue call, answered without
/// queueing is a forward.
pub fn call_type(reason: Option<&str>, taken_from_queue: bool, taken_from_forward: bool) -> CallType {
    match reason {
        Some(r) if r.eq_ignore_ascii_case("queue") => CallType::Queue,
        Some(r) if r.eq_ignore_ascii_case("forward") => CallType::Forward,
        Some(_) => CallType::Direct,
        None if taken_from_queue => CallType::Queue,
        None if taken_from_forward => CallType::Forward,
        None => CallType::Direct,
    }
}

/// Derive all metrics from a merged record.
pub fn derive_metrics(record: &NormalizedRecord) -> CallMetrics {
    let answered = record.answered_at.is_some();
    let queued = record.queued_at.is_some();

    let answered_within_threshold = match (record.created_at, record.answered_at) {
        (Some(created), Some(answered_at)) => {
            (answered_at - created).num_milliseconds() <= ANSWER_THRESHOLD_MS
        }
        _ => false,
    };

    let taken_from_queue = queued && answered;
    let taken_from_forward = !queued && answered;
    let rejected_or_forwarded = !answered || reason_is_rejection(record.assignment_reason.as_deref());

    let answer_point = record.answered_at.or(record.assigned_at);
    let wait_start = record.queued_at.or(record.created_at);

    CallMetrics {
        answered_within_threshold,
        taken_from_queue,
        taken_from_forward,
        rejected_or_forwarded,
        time_to_answer_secs: seconds_between(wait_start, answer_point),
        call_duration_secs: seconds_between(answer_point, record.closed_at),
        call_type: call_type(
            record.assignment_reason.as_deref(),
            taken_from_queue,
            taken_from_forward,
        ),
    }
}
