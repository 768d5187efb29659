use std::time::Duration;

use crate::fetch::client::DixaClient;
use crate::fetch::ExportProgress;
use crate::record::normalize;
use crate::record::{DetailFields, EnrichedRecord, NormalizedRecord};

const DEFAULT_ENRICH_DELAY: Duration = Duration::from_millis(100);

/// Records between progress reports.
pub const PROGRESS_EVERY: usize = 50;

/// Enriched records plus lookup counts.
#[derive(Debug, Clone)]
pub struct Enriched {
    pub records: Vec<EnrichedRecord>,
    pub ok: usize,
    pub failed: usize,
}

/// Best-effort per-record lookups against the single-conversation endpoint.
pub struct Enricher<'a> {
    client: &'a DixaClient,
    delay: Duration,
}

impl<'a> Enricher<'a> {
    pub fn new(client: &'a DixaClient) -> Self {
        Self {
            client,
            delay: DEFAULT_ENRICH_DELAY,
        }
    }

    /// Fixed pause after every lookup.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn enrich(&self, id: &str, progress: &dyn ExportProgress) -> Option<DetailFields> {
        let data = self.client.conversation(id, progress).await?;
        Some(normalize::detail_fields(&data))
    }

    /// Look up every record in order and merge what comes back.
    pub async fn enrich_all(
        &self,
        records: Vec<NormalizedRecord>,
        progress: &dyn ExportProgress,
    ) -> Enriched {
        let total = records.len();
        let mut out = Vec::with_capacity(total);
        let mut ok = 0;
        let mut failed = 0;

        for (i, record) in records.into_iter().enumerate() {
            let detail = self.enrich(&record.id, progress).await;
            if detail.is_some() {
                ok += 1;
            } else {
                log::debug!("detail {}: using coarse fields", record.id);
                failed += 1;
            }
            out.push(EnrichedRecord::merge(record, detail));

            let current = i + 1;
            if current % PROGRESS_EVERY == 0 || current == total {
                progress.on_enrich_progress(current, total, ok, failed);
            }
            tokio::time::sleep(self.delay).await;
        }

        log::info!("Enrichment finished: {ok} ok, {failed} failed");
        Enriched {
            records: out,
            ok,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::date_util::parse_iso_utc;
    use crate::fetch::client::{parse_base, ClientConfig};
    use crate::fetch::NoopProgress;

    fn test_client(server: &MockServer) -> DixaClient {
        let mut config = ClientConfig::new("secret").unwrap();
        config.api_base = parse_base(&server.uri()).unwrap();
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        DixaClient::with_http_client(config, http)
    }

    fn record(id: &str) -> NormalizedRecord {
        NormalizedRecord {
            id: id.into(),
            created_at: parse_iso_utc("2025-01-01T00:00:00Z"),
            answered_at: parse_iso_utc("2025-01-01T00:02:00Z"),
            assignment_reason: Some("queue".into()),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Reports(Mutex<Vec<(usize, usize, usize, usize)>>);

    impl ExportProgress for Reports {
        fn on_enrich_progress(&self, current: usize, total: usize, ok: usize, failed: usize) {
            self.0.lock().unwrap().push((current, total, ok, failed));
        }
    }

    #[tokio::test]
    async fn test_enrich_overrides_coarse_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "a",
                    "answeredAt": "2025-01-01T00:00:30Z",
                    "assignment": {"reason": "forward"}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations/b"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let enriched = Enricher::new(&client)
            .delay(Duration::ZERO)
            .enrich_all(vec![record("a"), record("b")], &NoopProgress)
            .await;

        assert_eq!(enriched.ok, 1);
        assert_eq!(enriched.failed, 1);
        let a = &enriched.records[0];
        assert!(a.enriched);
        assert_eq!(a.record.answered_at, parse_iso_utc("2025-01-01T00:00:30Z"));
        assert_eq!(a.record.assignment_reason.as_deref(), Some("forward"));
        let b = &enriched.records[1];
        assert!(!b.enriched);
        assert_eq!(b.record, record("b"));
    }

    #[tokio::test]
    async fn test_detail_without_data_object_is_a_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "nope"})))
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert!(Enricher::new(&client).enrich("x", &NoopProgress).await.is_none());
    }

    #[tokio::test]
    async fn test_progress_every_fifty_and_at_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(120)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let records: Vec<NormalizedRecord> = (0..120).map(|i| record(&i.to_string())).collect();
        let reports = Reports::default();
        let enriched = Enricher::new(&client)
            .delay(Duration::ZERO)
            .enrich_all(records, &reports)
            .await;

        assert_eq!(enriched.failed, 120);
        assert_eq!(
            *reports.0.lock().unwrap(),
            vec![(50, 120, 0, 50), (100, 120, 0, 100), (120, 120, 0, 120)]
        );
        // Order is preserved
        assert_eq!(enriched.records[119].record.id, "119");
    }
}
