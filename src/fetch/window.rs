use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::error::{Error, Result};

/// Window size used against the bulk export endpoint.
pub const EXPORT_WINDOW_DAYS: u32 = 7;

/// Window size used against the search endpoint (one request series per day).
pub const SEARCH_WINDOW_DAYS: u32 = 1;

/// A date range [start, end] inclusive, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Lazily yields consecutive windows tiling a date range.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    cursor: NaiveDate,
    end: NaiveDate,
    size_days: i64,
    exhausted: bool,
}

/// Split `[start, end]` into windows of `window_size_days`. The last window is
/// clipped to `end`.
pub fn plan_windows(start: NaiveDate, end: NaiveDate, window_size_days: u32) -> Result<WindowPlan> {
    if end < start {
        return Err(Error::InvalidRange { start, end });
    }
    if window_size_days == 0 {
        return Err(Error::InvalidWindowSize(window_size_days));
    }
    Ok(WindowPlan {
        cursor: start,
        end,
        size_days: i64::from(window_size_days),
        exhausted: false,
    })
}

impl Iterator for WindowPlan {
    type Item = DateWindow;

    fn next(&mut self) -> Option<DateWindow> {
        if self.exhausted {
            return None;
        }
        // A window reaching past the representable date range just ends at `end`
        let window_end = self
            .cursor
            .checked_add_signed(Duration::days(self.size_days - 1))
            .map_or(self.end, |d| d.min(self.end));
        let window = DateWindow {
            start: self.cursor,
            end: window_end,
        };
        if window_end >= self.end {
            self.exhausted = true;
        } else {
            self.cursor = window_end + Duration::days(1);
        }
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.exhausted {
            return (0, Some(0));
        }
        let remaining_days = (self.end - self.cursor).num_days() + 1;
        let n = ((remaining_days + self.size_days - 1) / self.size_days) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for WindowPlan {}
