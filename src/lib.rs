pub mod date_util;
pub mod error;
pub mod export;
pub mod fetch;
pub mod record;

use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

pub use error::{Error, Result};
pub use export::{to_csv, write_csv, ExportSummary};
pub use fetch::client::{AuthScheme, ClientConfig, DixaClient};
pub use fetch::retry::{RetryPolicy, TransportFailure};
pub use fetch::window::DateWindow;
pub use fetch::{ExportProgress, NoopProgress, WindowReport, WindowStatus};
pub use record::{CallMetrics, CallType, EnrichedRecord, MetricRecord, NormalizedRecord};

use fetch::client::RawPage;
use fetch::enrich::Enricher;
use fetch::paginator::{Paginator, PAGE_SIZE};
use fetch::window::{plan_windows, EXPORT_WINDOW_DAYS, SEARCH_WINDOW_DAYS};
use record::normalize;
use record::RawRecord;

/// Channel exported when none is given.
pub const DEFAULT_CHANNEL: &str = "pstnPhone";

/// Which acquisition path to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Weekly windows from the bulk export endpoint.
    Bulk,
    /// Daily windows from the paginated search endpoint.
    Search,
}

impl ExportMode {
    pub fn window_days(&self) -> u32 {
        match self {
            ExportMode::Bulk => EXPORT_WINDOW_DAYS,
            ExportMode::Search => SEARCH_WINDOW_DAYS,
        }
    }

    pub fn default_output(&self) -> &'static str {
        match self {
            ExportMode::Bulk => "conversations_prev_month.csv",
            ExportMode::Search => "conversations_ytd.csv",
        }
    }

    /// Previous month for bulk, year to date for search.
    pub fn default_range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            ExportMode::Bulk => date_util::previous_month_range(today),
            ExportMode::Search => date_util::year_to_date_range(today),
        }
    }
}

/// Options for a single export run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub mode: ExportMode,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Keep only this channel. `None` exports every channel.
    pub channel: Option<String>,
    /// Look up every record on the detail endpoint.
    pub enrich: bool,
    pub page_size: usize,
    pub page_delay: Duration,
    pub day_delay: Duration,
    pub enrich_delay: Duration,
}

impl ExportOptions {
    pub fn new(mode: ExportMode, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            mode,
            start,
            end,
            channel: Some(DEFAULT_CHANNEL.to_string()),
            enrich: false,
            page_size: PAGE_SIZE,
            page_delay: Duration::from_millis(150),
            day_delay: Duration::from_millis(50),
            enrich_delay: Duration::from_millis(100),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub records: Vec<MetricRecord>,
    pub summary: ExportSummary,
    pub windows: Vec<WindowReport>,
}

/// Normalize a batch, counting rows without an id.
fn normalize_all<F>(raw: Vec<RawRecord>, f: F) -> (Vec<NormalizedRecord>, usize)
where
    F: Fn(&RawRecord) -> Option<NormalizedRecord>,
{
    let total = raw.len();
    let records: Vec<NormalizedRecord> = raw
        .iter()
        .filter_map(|r| {
            let rec = f(r);
            if rec.is_none() {
                log::debug!("Skipping record without id: {}", serde_json::Value::Object(r.clone()));
            }
            rec
        })
        .collect();
    let skipped = total - records.len();
    (records, skipped)
}

fn channel_matches(record: &NormalizedRecord, channel: &str) -> bool {
    record
        .channel
        .as_deref()
        .is_some_and(|c| c.eq_ignore_ascii_case(channel))
}

/// Main entry point for the conversation export.
pub struct DixaExport {
    client: DixaClient,
}

impl DixaExport {
    pub fn new(client: DixaClient) -> Self {
        Self { client }
    }

    async fn bulk_window(
        &self,
        window: &DateWindow,
        options: &ExportOptions,
        progress: &dyn ExportProgress,
    ) -> Result<(Vec<NormalizedRecord>, usize, WindowReport)> {
        match self.client.fetch_export(window, progress).await? {
            RawPage::Records(raw) => {
                progress.on_page_fetched(window, 1, raw.len());
                let (mut records, skipped) = normalize_all(raw, normalize::from_export);
                if let Some(channel) = &options.channel {
                    records.retain(|r| channel_matches(r, channel));
                }
                let report = WindowReport::from_outcome(*window, records.len(), 1, None);
                Ok((records, skipped, report))
            }
            RawPage::Abandoned(reason) => {
                log::warn!("export {window}: abandoned ({reason})");
                let report = WindowReport::from_outcome(*window, 0, 0, Some(reason.to_string()));
                Ok((Vec::new(), 0, report))
            }
        }
    }

    async fn search_day(
        &self,
        window: &DateWindow,
        options: &ExportOptions,
        progress: &dyn ExportProgress,
    ) -> Result<(Vec<NormalizedRecord>, usize, WindowReport)> {
        let drained = Paginator::new(&self.client, options.channel.clone())
            .page_size(options.page_size)
            .page_delay(options.page_delay)
            .drain(window, progress)
            .await?;
        let channel = options.channel.as_deref();
        let (records, skipped) = normalize_all(drained.records, |r| normalize::from_search(r, channel));
        let report = WindowReport {
            records: records.len(),
            ..drained.report
        };
        Ok((records, skipped, report))
    }

    /// Fetch every window of the range, optionally enrich, then deduplicate
    /// and derive metrics.
    pub async fn run(&self, options: &ExportOptions, progress: &dyn ExportProgress) -> Result<ExportReport> {
        let plan = plan_windows(options.start, options.end, options.mode.window_days())?;
        let total = plan.len();
        log::info!(
            "Exporting {} to {} in {total} window(s) ({:?} mode)",
            options.start,
            options.end,
            options.mode
        );

        let mut normalized: Vec<NormalizedRecord> = Vec::new();
        let mut windows: Vec<WindowReport> = Vec::with_capacity(total);
        let mut skipped = 0;

        for (index, window) in plan.enumerate() {
            if index > 0 && options.mode == ExportMode::Search {
                tokio::time::sleep(options.day_delay).await;
            }
            progress.on_window_start(&window, index, total);

            let (records, window_skipped, report) = match options.mode {
                ExportMode::Bulk => self.bulk_window(&window, options, progress).await?,
                ExportMode::Search => self.search_day(&window, options, progress).await?,
            };
            log::info!("{window}: {} records ({:?})", report.records, report.status);

            skipped += window_skipped;
            normalized.extend(records);
            progress.on_window_complete(&report);
            windows.push(report);
        }

        let (enriched, details_ok, details_failed) = if options.enrich {
            let out = Enricher::new(&self.client)
                .delay(options.enrich_delay)
                .enrich_all(normalized, progress)
                .await;
            (out.records, out.ok, out.failed)
        } else {
            let coarse = normalized.into_iter().map(EnrichedRecord::coarse).collect();
            (coarse, 0, 0)
        };

        let reconciled = record::reconcile(enriched);
        let summary = ExportSummary {
            duplicates_removed: reconciled.duplicates_removed,
            skipped,
            details_ok,
            details_failed,
            ..ExportSummary::tally(options.mode, options.start, options.end, &reconciled.records)
        };

        Ok(ExportReport {
            records: reconciled.records,
            summary,
            windows,
        })
    }
}
