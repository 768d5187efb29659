use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::RequestBuilder;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::fetch::retry::{Abandon, Fetched, RetryPolicy};
use crate::fetch::window::DateWindow;
use crate::fetch::ExportProgress;
use crate::record::RawRecord;

pub const DEFAULT_API_BASE: &str = "https://dev.dixa.io/v1";
pub const DEFAULT_EXPORTS_BASE: &str = "https://exports.dixa.io/v1";

/// Fields requested from the bulk export endpoint.
pub const EXPORT_FIELDS: &str = "id,created_at,queued_at,assigned_at,offered_at,closed_at,status,direction,initial_channel,assignee_id,assignee_name,queue_id,queue_name,assignment_reason";

/// Keys that may hold the record list in a response body, tried in order.
const LIST_KEYS: &[&str] = &["items", "matches", "results", "conversations"];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How the API token is presented in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: <token>`
    Raw,
    /// `Authorization: Bearer <token>`
    Bearer,
}

impl AuthScheme {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Ok(AuthScheme::Raw),
            "bearer" => Ok(AuthScheme::Bearer),
            other => Err(Error::Config(format!(
                "unknown auth scheme '{other}' (expected 'raw' or 'bearer')"
            ))),
        }
    }

    fn header_value(&self, token: &str) -> String {
        match self {
            AuthScheme::Raw => token.to_string(),
            AuthScheme::Bearer => format!("Bearer {token}"),
        }
    }
}

/// Connection settings for both endpoint families.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub token: String,
    pub api_base: Url,
    pub exports_base: Url,
    pub api_auth: AuthScheme,
    pub exports_auth: AuthScheme,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            token: token.into(),
            api_base: parse_base(DEFAULT_API_BASE)?,
            exports_base: parse_base(DEFAULT_EXPORTS_BASE)?,
            api_auth: AuthScheme::Raw,
            exports_auth: AuthScheme::Bearer,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        })
    }

    /// Build from `DIXA_API_TOKEN` plus the optional `DIXA_API_BASE`,
    /// `DIXA_EXPORTS_BASE`, `DIXA_API_AUTH` and `DIXA_EXPORTS_AUTH`.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("DIXA_API_TOKEN")
            .map_err(|_| Error::Config("DIXA_API_TOKEN is not set".into()))?;
        if token.trim().is_empty() {
            return Err(Error::Config("DIXA_API_TOKEN is empty".into()));
        }
        let mut config = Self::new(token.trim())?;
        if let Ok(base) = std::env::var("DIXA_API_BASE") {
            config.api_base = parse_base(&base)?;
        }
        if let Ok(base) = std::env::var("DIXA_EXPORTS_BASE") {
            config.exports_base = parse_base(&base)?;
        }
        if let Ok(scheme) = std::env::var("DIXA_API_AUTH") {
            config.api_auth = AuthScheme::parse(&scheme)?;
        }
        if let Ok(scheme) = std::env::var("DIXA_EXPORTS_AUTH") {
            config.exports_auth = AuthScheme::parse(&scheme)?;
        }
        Ok(config)
    }
}

/// Parse a base URL, making sure it ends in `/` so joins append to its path.
pub fn parse_base(s: &str) -> Result<Url> {
    let trimmed = s.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::UrlParse(format!("unsupported scheme in {trimmed}")));
    }
    Ok(url)
}

/// One response from a listing endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPage {
    /// A well-formed body; the list may be empty.
    Records(Vec<RawRecord>),
    /// The request produced nothing usable.
    Abandoned(Abandon),
}

impl RawPage {
    fn from_fetched(target: &str, fetched: Fetched) -> Self {
        match fetched {
            Fetched::Body(body) => match extract_records(&body) {
                Some(records) => RawPage::Records(records),
                None => {
                    log::warn!("{target}: response has no recognizable record list");
                    RawPage::Abandoned(Abandon::Malformed("no record list in body".into()))
                }
            },
            Fetched::Abandoned(reason) => RawPage::Abandoned(reason),
        }
    }

    /// The records, or nothing if the request was abandoned.
    pub fn into_records(self) -> Vec<RawRecord> {
        match self {
            RawPage::Records(records) => records,
            RawPage::Abandoned(_) => Vec::new(),
        }
    }
}

fn objects(list: &[Value]) -> Vec<RawRecord> {
    list.iter().filter_map(|v| v.as_object().cloned()).collect()
}

/// Find the record list in a response body. Accepts a top-level list,
/// `data` as a list, `data.{items,matches,results,conversations}`, or those
/// keys at top level. Non-object entries are dropped.
pub fn extract_records(body: &Value) -> Option<Vec<RawRecord>> {
    if let Some(list) = body.as_array() {
        return Some(objects(list));
    }
    let obj = body.as_object()?;
    match obj.get("data") {
        Some(Value::Array(list)) => return Some(objects(list)),
        Some(Value::Object(data)) => {
            if let Some(list) = LIST_KEYS.iter().find_map(|k| data.get(*k).and_then(Value::as_array)) {
                return Some(objects(list));
            }
        }
        _ => {}
    }
    LIST_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(|list| objects(list))
}

/// Body of a `POST /search/conversations` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub limit: usize,
    pub sort: SearchSort,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSort {
    pub field: String,
    pub order: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFilters {
    pub strategy: String,
    pub conditions: Vec<Value>,
}

impl SearchRequest {
    /// Ascending by `createdAt`, all conditions combined with `and`.
    pub fn ascending(limit: usize, conditions: Vec<Value>) -> Self {
        Self {
            limit,
            sort: SearchSort {
                field: "createdAt".into(),
                order: "asc".into(),
            },
            filters: SearchFilters {
                strategy: "and".into(),
                conditions,
            },
        }
    }
}

/// HTTP client for the Dixa export, search and conversation endpoints.
pub struct DixaClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl DixaClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self::with_http_client(config, http))
    }

    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn api_request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder> {
        let url = self.config.api_base.join(path)?;
        Ok(self
            .http
            .request(method, url)
            .header(AUTHORIZATION, self.config.api_auth.header_value(&self.config.token))
            .header(ACCEPT, "application/json"))
    }

    /// Fetch one window from the bulk export endpoint.
    pub async fn fetch_export(
        &self,
        window: &DateWindow,
        progress: &dyn ExportProgress,
    ) -> Result<RawPage> {
        let url = self.config.exports_base.join("conversation_export")?;
        let created_after = window.start.format("%Y-%m-%d").to_string();
        let created_before = window.end.format("%Y-%m-%d").to_string();
        let request = self
            .http
            .get(url)
            .header(
                AUTHORIZATION,
                self.config.exports_auth.header_value(&self.config.token),
            )
            .header(ACCEPT, "application/json")
            .query(&[
                ("created_after", created_after.as_str()),
                ("created_before", created_before.as_str()),
                ("fields", EXPORT_FIELDS),
            ]);
        let target = format!("export {window}");
        let fetched = self.config.retry.execute(&target, request, progress).await?;
        Ok(RawPage::from_fetched(&target, fetched))
    }

    /// Run one search request.
    pub async fn search(
        &self,
        label: &str,
        body: &SearchRequest,
        progress: &dyn ExportProgress,
    ) -> Result<RawPage> {
        let request = self
            .api_request(reqwest::Method::POST, "search/conversations")?
            .json(body);
        let fetched = self.config.retry.execute(label, request, progress).await?;
        Ok(RawPage::from_fetched(label, fetched))
    }

    /// Look up a single conversation. Returns its `data` object, or `None` on
    /// any failure: the lookup is a single attempt and never errors.
    pub async fn conversation(&self, id: &str, progress: &dyn ExportProgress) -> Option<RawRecord> {
        let request = match self.api_request(reqwest::Method::GET, &format!("conversations/{id}")) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("detail {id}: cannot build request: {e}");
                return None;
            }
        };
        let target = format!("detail {id}");
        match self.config.retry.without_retries().execute(&target, request, progress).await {
            Ok(Fetched::Body(body)) => body.get("data").and_then(Value::as_object).cloned(),
            Ok(Fetched::Abandoned(reason)) => {
                log::debug!("{target}: no detail ({reason})");
                None
            }
            Err(e) => {
                log::debug!("{target}: no detail ({e})");
                None
            }
        }
    }
}
