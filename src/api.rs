//! Collaborators of the pipeline: the spending API and the clock.
//!
//! Stages only talk to `SpendingApi` and `Clock`, so tests drive them with
//! scripted fakes and virtual time. `HttpApi` is the reqwest implementation
//! against api.usaspending.gov.

use crate::data::{AwardTypeGroup, Error, YearActivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Rows per search page; the API caps `limit` at 100.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub filters: SearchFilters,
    pub fields: Vec<String>,
    pub limit: usize,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFilters {
    pub tas_codes: TasFilter,
    pub award_type_codes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub award_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TasFilter {
    pub require: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchPage {
    pub results: Vec<Map<String, Value>>,
    pub page_metadata: PageMetadata,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageMetadata {
    #[serde(rename = "hasNext")]
    pub has_next: bool,
}

/// Answer to a bulk download request. Persisted as the pending-job marker so
/// an interrupted run can resume polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub status_url: String,
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    /// The archive is ready; the status answer may name its URL.
    Ready { file_url: Option<String> },
    /// The provider gave up on the job.
    Failed(String),
}

#[async_trait]
pub trait SpendingApi: Send + Sync {
    async fn search_awards(&self, request: &SearchRequest) -> Result<SearchPage, Error>;
    async fn program_activity(&self, tas: &str, fiscal_year: i32) -> Result<YearActivity, Error>;
    async fn submit_download(
        &self,
        award_id: &str,
        group: AwardTypeGroup,
    ) -> Result<Submission, Error>;
    async fn job_status(&self, status_url: &str) -> Result<JobStatus, Error>;
    async fn fetch_archive(&self, file_url: &str) -> Result<Vec<u8>, Error>;
}

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Exponential backoff for transport errors; any other error is returned
/// right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, what: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(what = %what, attempt, ?delay, error = %e, "Request failed, retrying");
                    clock.sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

pub struct HttpApi {
    http: Client,
    base: Url,
}

impl HttpApi {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, Error> {
        let base = Url::parse(base).map_err(|e| Error::Format(format!("api base {base:?}: {e}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("usaspending-tas/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        Ok(Self { http, base })
    }

    /// `base` + segments, each one percent-encoded (TAS symbols contain `/`),
    /// with the trailing slash the API expects.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Format(format!("api base {} cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(segments)
            .push("");
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, Error> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if status.is_server_error() {
            return Err(Error::Transport(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Schema(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value, Error> {
        let bytes = self.send(request).await?.bytes().await.map_err(transport)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Schema(format!("invalid JSON body: {e}")))
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

#[async_trait]
impl SpendingApi for HttpApi {
    async fn search_awards(&self, request: &SearchRequest) -> Result<SearchPage, Error> {
        let url = self.endpoint(&["api", "v2", "search", "spending_by_award"])?;
        debug!(page = request.page, "POST {url}");
        let body = self.send_json(self.http.post(url).json(request)).await?;
        serde_json::from_value(body).map_err(|e| Error::Schema(format!("search page: {e}")))
    }

    async fn program_activity(&self, tas: &str, fiscal_year: i32) -> Result<YearActivity, Error> {
        let mut url =
            self.endpoint(&["api", "v2", "agency", "treasury_account", tas, "object_class"])?;
        url.query_pairs_mut()
            .append_pair("fiscal_year", &fiscal_year.to_string());
        debug!(fiscal_year, "GET {url}");
        parse_activity(self.send_json(self.http.get(url)).await?)
    }

    async fn submit_download(
        &self,
        award_id: &str,
        group: AwardTypeGroup,
    ) -> Result<Submission, Error> {
        let url = self.endpoint(&["api", "v2", "download", group.download_kind()])?;
        debug!(award_id = %award_id, "POST {url}");
        let body = serde_json::json!({ "award_id": award_id });
        parse_submission(self.send_json(self.http.post(url).json(&body)).await?)
    }

    async fn job_status(&self, status_url: &str) -> Result<JobStatus, Error> {
        parse_status(self.send_json(self.http.get(status_url)).await?)
    }

    async fn fetch_archive(&self, file_url: &str) -> Result<Vec<u8>, Error> {
        let response = self.send(self.http.get(file_url)).await?;
        Ok(response.bytes().await.map_err(transport)?.to_vec())
    }
}

/// The summary endpoint answers with a list, with `{}` for years without
/// data, or with the list wrapped in `{"results": [...]}`.
pub fn parse_activity(body: Value) -> Result<YearActivity, Error> {
    let body = match body {
        Value::Object(mut map) if map.contains_key("results") => map
            .remove("results")
            .unwrap_or(Value::Null),
        other => other,
    };
    serde_json::from_value(body).map_err(|e| Error::Schema(format!("program activity: {e}")))
}

pub fn parse_submission(body: Value) -> Result<Submission, Error> {
    let url = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
    match (url("status_url"), url("file_url")) {
        (Some(status_url), Some(file_url)) => Ok(Submission {
            status_url,
            file_url,
        }),
        _ => Err(Error::Schema(match body.get("detail") {
            Some(detail) => format!("download refused: {detail}"),
            None => format!("download answer without status_url/file_url: {body}"),
        })),
    }
}

pub fn parse_status(body: Value) -> Result<JobStatus, Error> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Schema(format!("status answer without status: {body}")))?;
    match status {
        "finished" => Ok(JobStatus::Ready {
            file_url: body
                .get("file_url")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "ready" | "running" => Ok(JobStatus::Pending),
        "failed" => Ok(JobStatus::Failed(
            body.get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider reported failure")
                .to_string(),
        )),
        other => Err(Error::Schema(format!("unknown job status {other:?}"))),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::Clock;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Virtual time: `sleep` returns at once and moves `now` forward.
    pub struct FakeClock {
        now: Mutex<DateTime<Utc>>,
        slept: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self::at(Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap())
        }

        pub fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
                slept: Mutex::new(Vec::new()),
            }
        }

        pub fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            *self.now.lock().unwrap() += chrono::Duration::from_std(duration).unwrap();
            self.slept.lock().unwrap().push(duration);
        }
    }
}
