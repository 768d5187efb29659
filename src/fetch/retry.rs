use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::fetch::ExportProgress;

const DEFAULT_MAX_ATTEMPTS: u32 = 6;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// What happens once a request has failed at the transport level
/// `connect_attempts` times in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Stop the whole run.
    Fatal,
    /// Give up on this request only.
    Abandon,
}

/// Bounded retry with exponential backoff, shared by every remote call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed for a request that keeps answering 429 or 5xx.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Attempts allowed for a request that keeps failing to connect or timing out.
    pub connect_attempts: u32,
    pub transport: TransportFailure,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            transport: TransportFailure::Fatal,
        }
    }
}

/// Classification of one HTTP response. The attempt counter in
/// [`RetryPolicy::execute`] plays the role of `Attempting(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Success,
    RateLimited(Duration),
    ServerError(u16),
    ClientError(u16),
}

/// Why a request produced no body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandon {
    RateLimited { attempts: u32 },
    ServerError { status: u16, attempts: u32 },
    ClientError { status: u16 },
    Malformed(String),
    Unreachable(String),
}

impl std::fmt::Display for Abandon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Abandon::RateLimited { attempts } => write!(f, "rate limited after {attempts} attempts"),
            Abandon::ServerError { status, attempts } => {
                write!(f, "HTTP {status} after {attempts} attempts")
            }
            Abandon::ClientError { status } => write!(f, "HTTP {status}"),
            Abandon::Malformed(msg) => write!(f, "malformed response: {msg}"),
            Abandon::Unreachable(msg) => write!(f, "unreachable: {msg}"),
        }
    }
}

/// Result of running a request under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Body(Value),
    Abandoned(Abandon),
}

impl RetryPolicy {
    /// The same delays, but a single attempt and silent transport failures.
    /// Used for best-effort lookups.
    pub fn without_retries(&self) -> Self {
        Self {
            max_attempts: 1,
            connect_attempts: 1,
            transport: TransportFailure::Abandon,
            ..self.clone()
        }
    }

    /// Delay before retry number `retry` (0-based) when the server gave no hint:
    /// `base * multiplier^retry`, never below `base_delay`, never above `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .max(self.base_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying a 429: `Retry-After` when given, otherwise backoff.
    pub fn rate_limit_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.backoff_delay(retry))
            .min(self.max_delay)
    }

    fn classify(&self, status: StatusCode, headers: &HeaderMap, retry: u32) -> AttemptState {
        if status == StatusCode::OK {
            AttemptState::Success
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            AttemptState::RateLimited(self.rate_limit_delay(retry, parse_retry_after(headers)))
        } else if status.is_server_error() {
            AttemptState::ServerError(status.as_u16())
        } else {
            AttemptState::ClientError(status.as_u16())
        }
    }

    /// Send `request` until it succeeds, is abandoned, or transport failures
    /// exhaust `connect_attempts`.
    ///
    /// Only a fatal transport failure returns `Err`; every HTTP-level failure
    /// comes back as [`Fetched::Abandoned`].
    pub async fn execute(
        &self,
        target: &str,
        request: RequestBuilder,
        progress: &dyn ExportProgress,
    ) -> Result<Fetched> {
        let mut attempt: u32 = 0;
        let mut retries: u32 = 0;
        let mut transport_failures: u32 = 0;

        loop {
            attempt += 1;
            log::info!("{target}: attempt {attempt}");
            progress.on_attempt(target, attempt);

            let pending = request
                .try_clone()
                .ok_or_else(|| Error::Other(format!("{target}: request body cannot be replayed")))?;

            let failure = match pending.send().await {
                Ok(response) => {
                    let status = response.status();
                    match self.classify(status, response.headers(), retries) {
                        AttemptState::Success => match read_json(target, response).await {
                            Ok(fetched) => return Ok(fetched),
                            Err(e) => e,
                        },
                        AttemptState::ClientError(code) => {
                            log::warn!("{target}: HTTP {code}, not retrying");
                            return Ok(Fetched::Abandoned(Abandon::ClientError { status: code }));
                        }
                        AttemptState::RateLimited(wait) => {
                            if attempt_budget_spent(retries, self.max_attempts) {
                                log::warn!("{target}: still rate limited after {} attempts, abandoning", retries + 1);
                                return Ok(Fetched::Abandoned(Abandon::RateLimited { attempts: retries + 1 }));
                            }
                            log::warn!("{target}: rate limited (429). Waiting {wait:?} before retry {}", retries + 1);
                            pause(target, attempt, wait, progress).await;
                            retries += 1;
                            continue;
                        }
                        AttemptState::ServerError(code) => {
                            if attempt_budget_spent(retries, self.max_attempts) {
                                log::warn!("{target}: HTTP {code} after {} attempts, abandoning", retries + 1);
                                return Ok(Fetched::Abandoned(Abandon::ServerError {
                                    status: code,
                                    attempts: retries + 1,
                                }));
                            }
                            log::warn!("{target}: HTTP {code}. Waiting {:?} before retry {}", self.base_delay, retries + 1);
                            pause(target, attempt, self.base_delay, progress).await;
                            retries += 1;
                            continue;
                        }
                    }
                }
                Err(e) => e,
            };

            transport_failures += 1;
            if transport_failures >= self.connect_attempts {
                return match self.transport {
                    TransportFailure::Fatal => Err(Error::Connection {
                        target: target.to_string(),
                        attempts: transport_failures,
                        message: failure.to_string(),
                    }),
                    TransportFailure::Abandon => {
                        log::debug!("{target}: giving up after transport error: {failure}");
                        Ok(Fetched::Abandoned(Abandon::Unreachable(failure.to_string())))
                    }
                };
            }
            log::warn!(
                "{target}: transport error ({failure}). Waiting {:?} before retry {transport_failures}/{}",
                self.base_delay,
                self.connect_attempts - 1
            );
            pause(target, attempt, self.base_delay, progress).await;
        }
    }
}

async fn pause(target: &str, attempt: u32, wait: Duration, progress: &dyn ExportProgress) {
    progress.on_retry(target, attempt, wait);
    tokio::time::sleep(wait).await;
}

fn attempt_budget_spent(retries: u32, max_attempts: u32) -> bool {
    retries + 1 >= max_attempts
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Read and parse a 200 body. Timeouts and dropped connections while reading
/// come back as `Err` so they count as transport failures; anything else that
/// goes wrong with the body is malformed.
async fn read_json(target: &str, response: reqwest::Response) -> std::result::Result<Fetched, reqwest::Error> {
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) if e.is_timeout() || e.is_connect() => return Err(e),
        Err(e) => {
            log::warn!("{target}: failed to read response body: {e}");
            return Ok(Fetched::Abandoned(Abandon::Malformed(e.to_string())));
        }
    };
    match serde_json::from_str::<Value>(&body) {
        Ok(value) => Ok(Fetched::Body(value)),
        Err(e) => {
            log::warn!("{target}: response is not JSON: {e}");
            Ok(Fetched::Abandoned(Abandon::Malformed(e.to_string())))
        }
    }
}
