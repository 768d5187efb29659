use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};

use crate::error::{Error, Result};

/// The previous calendar month relative to `today`, as an inclusive range.
pub fn previous_month_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let last_prev = today.with_day(1).unwrap_or(today) - Duration::days(1);
    let first_prev = last_prev.with_day(1).unwrap_or(last_prev);
    (first_prev, last_prev)
}

/// January 1st of `today`'s year through `today`.
pub fn year_to_date_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
    (start, today)
}

/// Parse a `YYYY-MM-DD` date or a full ISO-8601 timestamp into a UTC date.
pub fn parse_date_arg(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| Error::DateParse(format!("expected YYYY-MM-DD or ISO-8601, got {s}")))
}

pub fn start_of_day_utc(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap_or_default())
}

pub fn end_of_day_utc(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_hms_opt(23, 59, 59).unwrap_or_default())
}

/// Render a timestamp as `2025-01-01T00:00:00Z` (second precision).
pub fn format_iso_z(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Convert a millisecond epoch value into a UTC timestamp.
pub fn ms_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Parse an ISO-8601 timestamp, truncated to millisecond precision.
pub fn parse_iso_utc(s: &str) -> Option<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s.trim()).ok()?;
    ms_to_utc(dt.timestamp_millis())
}
