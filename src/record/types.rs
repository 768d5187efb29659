use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// A conversation exactly as one endpoint returned it.
pub type RawRecord = Map<String, Value>;

/// Canonical conversation shape, independent of which endpoint produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Secondary answer timestamp: when the call was assigned to an agent.
    pub assigned_at: Option<DateTime<Utc>>,
    pub offered_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub direction: Option<String>,
    pub channel: Option<String>,
    pub assignee_id: Option<String>,
    pub assignee_name: Option<String>,
    pub queue_id: Option<String>,
    pub queue_name: Option<String>,
    pub assignment_reason: Option<String>,
}

/// Fields from the single-conversation endpoint that take priority over the
/// coarse values of a [`NormalizedRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetailFields {
    pub answered_at: Option<DateTime<Utc>>,
    pub assignment_reason: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub offered_at: Option<DateTime<Utc>>,
    pub queue_id: Option<String>,
    pub queue_name: Option<String>,
    pub state: Option<String>,
}

/// A [`NormalizedRecord`] after the (optional) detail lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    pub record: NormalizedRecord,
    /// Whether detail fields were applied.
    pub enriched: bool,
}

impl EnrichedRecord {
    /// Wrap a record that was never looked up in detail.
    pub fn coarse(record: NormalizedRecord) -> Self {
        Self {
            record,
            enriched: false,
        }
    }

    /// Overlay `detail` on `base`. A detail field that is present wins; an
    /// absent one leaves the coarse value alone.
    pub fn merge(base: NormalizedRecord, detail: Option<DetailFields>) -> Self {
        let Some(detail) = detail else {
            return Self::coarse(base);
        };
        let record = NormalizedRecord {
            answered_at: detail.answered_at.or(base.answered_at),
            assignment_reason: detail.assignment_reason.or(base.assignment_reason),
            assigned_at: detail.assigned_at.or(base.assigned_at),
            offered_at: detail.offered_at.or(base.offered_at),
            queue_id: detail.queue_id.or(base.queue_id),
            queue_name: detail.queue_name.or(base.queue_name),
            state: detail.state.or(base.state),
            ..base
        };
        Self {
            record,
            enriched: true,
        }
    }
}

/// How a call reached the agent who took it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Queue,
    Forward,
    Direct,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Queue => "queue",
            CallType::Forward => "forward",
            CallType::Direct => "direct",
        }
    }
}

/// Metrics derived from the final merged timestamps and assignment reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallMetrics {
    pub answered_within_threshold: bool,
    pub taken_from_queue: bool,
    pub taken_from_forward: bool,
    pub rejected_or_forwarded: bool,
    pub time_to_answer_secs: Option<i64>,
    pub call_duration_secs: Option<i64>,
    pub call_type: CallType,
}

/// One row of the final export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub record: NormalizedRecord,
    pub enriched: bool,
    pub metrics: CallMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::parse_iso_utc;

    fn base() -> NormalizedRecord {
        NormalizedRecord {
            id: "c1".into(),
            created_at: parse_iso_utc("2025-01-01T00:00:00Z"),
            answered_at: parse_iso_utc("2025-01-01T00:00:40Z"),
            assigned_at: parse_iso_utc("2025-01-01T00:00:40Z"),
            assignment_reason: Some("queue".into()),
            queue_name: Some("Support".into()),
            direction: Some("inbound".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_without_detail_keeps_record() {
        let merged = EnrichedRecord::merge(base(), None);
        assert!(!merged.enriched);
        assert_eq!(merged.record, base());
    }

    #[test]
    fn test_merge_detail_takes_priority() {
        let detail = DetailFields {
            answered_at: parse_iso_utc("2025-01-01T00:00:20Z"),
            assignment_reason: Some("forward".into()),
            state: Some("closed".into()),
            ..Default::default()
        };
        let merged = EnrichedRecord::merge(base(), Some(detail));
        assert!(merged.enriched);
        assert_eq!(merged.record.answered_at, parse_iso_utc("2025-01-01T00:00:20Z"));
        assert_eq!(merged.record.assignment_reason.as_deref(), Some("forward"));
        assert_eq!(merged.record.state.as_deref(), Some("closed"));
        // Absent detail fields leave coarse values untouched
        assert_eq!(merged.record.assigned_at, base().assigned_at);
        assert_eq!(merged.record.queue_name.as_deref(), Some("Support"));
        assert_eq!(merged.record.direction.as_deref(), Some("inbound"));
    }

    #[test]
    fn test_call_type_labels() {
        assert_eq!(CallType::Queue.as_str(), "queue");
        assert_eq!(CallType::Forward.as_str(), "forward");
        assert_eq!(CallType::Direct.as_str(), "direct");
        assert_eq!(serde_json::to_string(&CallType::Forward).unwrap(), "\"forward\"");
    }
}
