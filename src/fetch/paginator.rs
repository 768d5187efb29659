use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::date_util::{end_of_day_utc, format_iso_z, start_of_day_utc};
use crate::error::Result;
use crate::fetch::client::{DixaClient, RawPage, SearchRequest};
use crate::fetch::window::DateWindow;
use crate::fetch::{ExportProgress, WindowReport};
use crate::record::normalize;
use crate::record::RawRecord;

/// Records requested per search page.
pub const PAGE_SIZE: usize = 200;

const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(150);

/// One way of expressing "channel equals X" to the search endpoint.
#[derive(Debug)]
pub struct ChannelFilter {
    pub label: &'static str,
    build: fn(&str) -> Value,
}

impl ChannelFilter {
    pub fn condition(&self, channel: &str) -> Value {
        (self.build)(channel)
    }
}

fn typed_channel(channel: &str) -> Value {
    json!({"field": {"_type": "ChannelTypeField"}, "operator": "eq", "value": channel})
}

fn typed_initial_channel(channel: &str) -> Value {
    json!({"field": {"_type": "InitialChannelField"}, "operator": "eq", "value": channel})
}

fn plain_channel(channel: &str) -> Value {
    json!({"field": "channel", "operator": "eq", "value": channel})
}

fn plain_initial_channel(channel: &str) -> Value {
    json!({"field": "initialChannel", "operator": "eq", "value": channel})
}

/// Channel filter encodings, tried in order until one is accepted.
pub const CHANNEL_FILTERS: &[ChannelFilter] = &[
    ChannelFilter { label: "ChannelTypeField", build: typed_channel },
    ChannelFilter { label: "InitialChannelField", build: typed_initial_channel },
    ChannelFilter { label: "channel", build: plain_channel },
    ChannelFilter { label: "initialChannel", build: plain_initial_channel },
];

fn created_between(window: &DateWindow) -> Value {
    json!({
        "field": {"_type": "CreatedAtField"},
        "operator": "between",
        "value": [
            format_iso_z(&start_of_day_utc(window.start)),
            format_iso_z(&end_of_day_utc(window.end)),
        ],
    })
}

fn created_after(cursor: &Value) -> Value {
    json!({"field": {"_type": "CreatedAtField"}, "operator": "gt", "value": cursor})
}

/// Largest creation timestamp on a page, with the value as the API sent it.
fn page_cursor(page: &[RawRecord]) -> Option<(DateTime<Utc>, Value)> {
    page.iter()
        .filter_map(|r| {
            let ts = normalize::created_at(r)?;
            let raw = r.get("createdAt").or_else(|| r.get("created_at"))?.clone();
            Some((ts, raw))
        })
        .max_by_key(|(ts, _)| *ts)
}

/// Everything collected for one window.
#[derive(Debug, Clone)]
pub struct DrainedWindow {
    pub records: Vec<RawRecord>,
    pub report: WindowReport,
    /// Label of the channel filter encoding that was adopted, if any.
    pub channel_filter: Option<&'static str>,
}

/// Cursor pagination over `POST /search/conversations`.
pub struct Paginator<'a> {
    client: &'a DixaClient,
    channel: Option<String>,
    page_size: usize,
    page_delay: Duration,
}

impl<'a> Paginator<'a> {
    pub fn new(client: &'a DixaClient, channel: Option<String>) -> Self {
        Self {
            client,
            channel,
            page_size: PAGE_SIZE,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    fn request(&self, window: &DateWindow, channel: Option<Value>, cursor: Option<&Value>) -> SearchRequest {
        let mut conditions = vec![created_between(window)];
        conditions.extend(channel);
        conditions.extend(cursor.map(created_after));
        SearchRequest::ascending(self.page_size, conditions)
    }

    /// Try each channel encoding for the first page of a window. Returns the
    /// first one whose response was well-formed, with that page.
    async fn probe(
        &self,
        window: &DateWindow,
        channel: &str,
        progress: &dyn ExportProgress,
    ) -> Result<Option<(&'static ChannelFilter, Vec<RawRecord>)>> {
        for filter in CHANNEL_FILTERS {
            let body = self.request(window, Some(filter.condition(channel)), None);
            let label = format!("search {window} [{}]", filter.label);
            match self.client.search(&label, &body, progress).await? {
                RawPage::Records(records) => {
                    log::info!("{window}: adopted channel filter {}", filter.label);
                    return Ok(Some((filter, records)));
                }
                RawPage::Abandoned(reason) => {
                    log::info!("{window}: channel filter {} rejected ({reason})", filter.label);
                }
            }
        }
        Ok(None)
    }

    /// Fetch every page of `window`, advancing the `createdAt` cursor until a
    /// short or empty page comes back.
    pub async fn drain(&self, window: &DateWindow, progress: &dyn ExportProgress) -> Result<DrainedWindow> {
        let mut records: Vec<RawRecord> = Vec::new();
        let mut adopted: Option<&'static ChannelFilter> = None;
        let mut cursor: Option<(DateTime<Utc>, Value)> = None;
        let mut pages: u32 = 0;
        let mut abandoned: Option<String> = None;

        loop {
            let page = match (&self.channel, adopted) {
                (Some(channel), None) => match self.probe(window, channel, progress).await? {
                    Some((filter, page)) => {
                        adopted = Some(filter);
                        page
                    }
                    None => {
                        log::warn!("{window}: no channel filter encoding was accepted");
                        abandoned = Some("no channel filter encoding was accepted".into());
                        break;
                    }
                },
                (channel, filter) => {
                    let condition = channel
                        .as_deref()
                        .zip(filter)
                        .map(|(ch, f)| f.condition(ch));
                    let body = self.request(window, condition, cursor.as_ref().map(|(_, raw)| raw));
                    let label = format!("search {window} page {}", pages + 1);
                    match self.client.search(&label, &body, progress).await? {
                        RawPage::Records(page) => page,
                        RawPage::Abandoned(reason) => {
                            log::warn!("{label}: abandoned ({reason})");
                            abandoned = Some(reason.to_string());
                            break;
                        }
                    }
                }
            };

            pages += 1;
            progress.on_page_fetched(window, pages, page.len());
            if page.is_empty() {
                break;
            }

            let count = page.len();
            let next = page_cursor(&page);
            records.extend(page);
            if count < self.page_size {
                break;
            }

            match next {
                None => {
                    log::warn!("{window}: full page without createdAt values, stopping");
                    break;
                }
                Some((ts, _)) if cursor.as_ref().is_some_and(|(prev, _)| ts <= *prev) => {
                    log::warn!("{window}: cursor did not advance past {ts}, stopping");
                    break;
                }
                Some(next) => cursor = Some(next),
            }

            tokio::time::sleep(self.page_delay).await;
        }

        let report = WindowReport::from_outcome(*window, records.len(), pages, abandoned);
        Ok(DrainedWindow {
            records,
            report,
            channel_filter: adopted.map(|f| f.label),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::NaiveDate;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;
    use crate::date_util::parse_iso_utc;
    use crate::fetch::client::{parse_base, ClientConfig};
    use crate::fetch::{NoopProgress, WindowStatus};

    fn day() -> DateWindow {
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        DateWindow { start: d, end: d }
    }

    fn test_client(server: &MockServer) -> DixaClient {
        let mut config = ClientConfig::new("secret").unwrap();
        config.api_base = parse_base(&server.uri()).unwrap();
        config.retry.base_delay = Duration::from_millis(1);
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        DixaClient::with_http_client(config, http)
    }

    fn conversations(n: usize) -> Vec<Value> {
        let start = parse_iso_utc("2025-01-01T00:00:00Z").unwrap();
        (0..n)
            .map(|i| {
                let created = start + chrono::Duration::seconds(i as i64);
                json!({"id": format!("c{i}"), "createdAt": format_iso_z(&created)})
            })
            .collect()
    }

    /// A finite search backend that honors `limit` and the `gt` cursor, and
    /// records every request body it sees.
    struct SyntheticSearch {
        data: Vec<Value>,
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    impl Respond for SyntheticSearch {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            self.bodies.lock().unwrap().push(body.clone());
            let limit = body["limit"].as_u64().unwrap() as usize;
            let cursor = body["filters"]["conditions"]
                .as_array()
                .unwrap()
                .iter()
                .find(|c| c["operator"] == "gt")
                .and_then(|c| parse_iso_utc(c["value"].as_str().unwrap()));
            let page: Vec<Value> = self
                .data
                .iter()
                .filter(|r| match cursor {
                    Some(cur) => parse_iso_utc(r["createdAt"].as_str().unwrap()).unwrap() > cur,
                    None => true,
                })
                .take(limit)
                .cloned()
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({"data": page}))
        }
    }

    /// Mount a backend over `data` and return the log of request bodies.
    async fn mount(server: &MockServer, data: Vec<Value>) -> Arc<Mutex<Vec<Value>>> {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        Mock::given(method("POST"))
            .and(path("/search/conversations"))
            .respond_with(SyntheticSearch {
                data,
                bodies: bodies.clone(),
            })
            .mount(server)
            .await;
        bodies
    }

    #[tokio::test]
    async fn test_drains_until_short_page() {
        let server = MockServer::start().await;
        let bodies = mount(&server, conversations(450)).await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, None)
            .page_delay(Duration::ZERO)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(drained.records.len(), 450);
        assert_eq!(drained.report.pages, 3);
        assert_eq!(drained.report.status, WindowStatus::Complete);
        assert_eq!(drained.records[0]["id"], "c0");
        assert_eq!(drained.records[449]["id"], "c449");
        assert_eq!(bodies.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exact_multiple_stops_on_empty_page() {
        let server = MockServer::start().await;
        let bodies = mount(&server, conversations(400)).await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, None)
            .page_delay(Duration::ZERO)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(drained.records.len(), 400);
        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 3);
        // Cursor is strictly the last createdAt of the previous page
        let gt = |b: &Value| {
            b["filters"]["conditions"]
                .as_array()
                .unwrap()
                .iter()
                .find(|c| c["operator"] == "gt")
                .map(|c| c["value"].clone())
        };
        assert_eq!(gt(&bodies[0]), None);
        assert_eq!(gt(&bodies[1]), Some(json!("2025-01-01T00:03:19Z")));
        assert_eq!(gt(&bodies[2]), Some(json!("2025-01-01T00:06:39Z")));
    }

    #[tokio::test]
    async fn test_first_short_page_ends_pagination() {
        let server = MockServer::start().await;
        let bodies = mount(&server, conversations(5)).await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, None)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(drained.records.len(), 5);
        assert_eq!(bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_page_without_timestamps_stops() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "a"}, {"id": "b"}]})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, None)
            .page_size(2)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(drained.records.len(), 2);
    }

    #[tokio::test]
    async fn test_stuck_cursor_stops() {
        let server = MockServer::start().await;
        // Ignores the cursor and always returns the same full page
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": conversations(2)})))
            .expect(2)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, None)
            .page_size(2)
            .page_delay(Duration::ZERO)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(drained.records.len(), 4);
        assert_eq!(drained.report.pages, 2);
    }

    #[tokio::test]
    async fn test_abandoned_page_keeps_earlier_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("\"gt\""))
            .respond_with(ResponseTemplate::new(400))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": conversations(2)})))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, None)
            .page_size(2)
            .page_delay(Duration::ZERO)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(drained.records.len(), 2);
        assert_eq!(drained.report.status, WindowStatus::Partial);
        assert_eq!(drained.report.error.as_deref(), Some("HTTP 400"));
    }

    #[tokio::test]
    async fn test_channel_probe_adopts_first_accepted_variant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("ChannelTypeField"))
            .respond_with(ResponseTemplate::new(400))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        let bodies = mount(&server, conversations(250)).await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, Some("pstnPhone".into()))
            .page_delay(Duration::ZERO)
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(drained.channel_filter, Some("InitialChannelField"));
        assert_eq!(drained.records.len(), 250);
        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        for body in bodies.iter() {
            let conditions = body["filters"]["conditions"].as_array().unwrap();
            assert!(conditions.contains(&json!({
                "field": {"_type": "InitialChannelField"}, "operator": "eq", "value": "pstnPhone"
            })));
        }
    }

    #[tokio::test]
    async fn test_empty_but_well_formed_response_is_adopted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"items": []}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, Some("pstnPhone".into()))
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(drained.channel_filter, Some("ChannelTypeField"));
        assert!(drained.records.is_empty());
        assert_eq!(drained.report.status, WindowStatus::Complete);
    }

    #[tokio::test]
    async fn test_all_channel_variants_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .expect(CHANNEL_FILTERS.len() as u64)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let drained = Paginator::new(&client, Some("pstnPhone".into()))
            .drain(&day(), &NoopProgress)
            .await
            .unwrap();
        assert!(drained.records.is_empty());
        assert_eq!(drained.channel_filter, None);
        assert_eq!(drained.report.status, WindowStatus::Abandoned);
    }

    #[test]
    fn test_request_conditions() {
        let config = ClientConfig::new("t").unwrap();
        let client = DixaClient::with_http_client(config, reqwest::Client::new());
        let paginator = Paginator::new(&client, None);
        let cursor = json!("2025-01-01T10:00:00Z");
        let body = paginator.request(&day(), Some(plain_channel("pstnPhone")), Some(&cursor));
        assert_eq!(body.limit, PAGE_SIZE);
        assert_eq!(
            body.filters.conditions,
            vec![
                json!({
                    "field": {"_type": "CreatedAtField"},
                    "operator": "between",
                    "value": ["2025-01-01T00:00:00Z", "2025-01-01T23:59:59Z"]
                }),
                json!({"field": "channel", "operator": "eq", "value": "pstnPhone"}),
                json!({"field": {"_type": "CreatedAtField"}, "operator": "gt", "value": "2025-01-01T10:00:00Z"}),
            ]
        );
    }
}
