pub mod client;
pub mod enrich;
pub mod paginator;
pub mod retry;
pub mod window;

use std::time::Duration;

use serde::Serialize;

use window::DateWindow;

/// Callbacks for reporting export progress to the caller. Every method has a
/// no-op default so implementations only override what they display.
pub trait ExportProgress: Send + Sync {
    fn on_window_start(&self, _window: &DateWindow, _index: usize, _total: usize) {}

    fn on_attempt(&self, _target: &str, _attempt: u32) {}

    fn on_retry(&self, _target: &str, _attempt: u32, _delay: Duration) {}

    fn on_page_fetched(&self, _window: &DateWindow, _page: u32, _count: usize) {}

    fn on_window_complete(&self, _report: &WindowReport) {}

    fn on_enrich_progress(&self, _current: usize, _total: usize, _ok: usize, _failed: usize) {}
}

/// Progress reporter that discards everything.
pub struct NoopProgress;

impl ExportProgress for NoopProgress {}

/// Outcome of fetching one window (bulk mode) or one day (search mode).
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub window: DateWindow,
    pub status: WindowStatus,
    pub records: usize,
    pub pages: u32,
    pub error: Option<String>,
}

impl WindowReport {
    /// Build a report whose status follows from whether a request was
    /// abandoned and whether anything was collected before that.
    pub fn from_outcome(
        window: DateWindow,
        records: usize,
        pages: u32,
        abandoned: Option<String>,
    ) -> Self {
        let status = match (&abandoned, pages) {
            (None, _) => WindowStatus::Complete,
            (Some(_), 0) => WindowStatus::Abandoned,
            (Some(_), _) => WindowStatus::Partial,
        };
        Self {
            window,
            status,
            records,
            pages,
            error: abandoned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowStatus {
    Complete,
    Partial,
    Abandoned,
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn window() -> DateWindow {
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        DateWindow { start: d, end: d }
    }

    #[test]
    fn test_report_status_from_outcome() {
        assert_eq!(WindowReport::from_outcome(window(), 3, 1, None).status, WindowStatus::Complete);
        assert_eq!(WindowReport::from_outcome(window(), 0, 0, None).status, WindowStatus::Complete);

        let abandoned = WindowReport::from_outcome(window(), 0, 0, Some("HTTP 403".into()));
        assert_eq!(abandoned.status, WindowStatus::Abandoned);
        assert_eq!(abandoned.error.as_deref(), Some("HTTP 403"));

        let partial = WindowReport::from_outcome(window(), 200, 1, Some("HTTP 503 after 6 attempts".into()));
        assert_eq!(partial.status, WindowStatus::Partial);
    }
}
