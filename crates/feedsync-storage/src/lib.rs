//! Conditional HTTP fetch utilities and the persistent store for feedsync.

mod store;

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
pub use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub use store::{PostFilter, SqliteStore, Store, StoreError};

pub const CRATE_NAME: &str = "feedsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts are never retried: the caller's deadline covers the whole fetch.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A GET carrying the validators from the previous successful fetch.
#[derive(Debug, Clone)]
pub struct ConditionalRequest<'a> {
    pub url: &'a str,
    pub etag: Option<&'a str>,
    pub last_modified: Option<DateTime<Utc>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fetch of {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetch `request.url`, retrying retryable failures, with every attempt
    /// and backoff sleep bounded by `request.timeout`.
    ///
    /// Non-success statuses (304, 404, ...) are returned as responses, not
    /// errors; classifying them is the caller's concern.
    pub async fn fetch_conditional(
        &self,
        request: &ConditionalRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = request.url);
        match tokio::time::timeout(request.timeout, self.fetch_with_retries(request).instrument(span))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: request.url.to_string(),
                after: request.timeout,
            }),
        }
    }

    async fn fetch_with_retries(
        &self,
        request: &ConditionalRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        let validators = conditional_headers(request);

        loop {
            let builder = self
                .client
                .get(request.url)
                .timeout(request.timeout)
                .headers(validators.clone());

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let final_url = resp.url().to_string();
                    let etag = resp
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let last_modified = resp
                        .headers()
                        .get(LAST_MODIFIED)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_http_date);
                    let body = resp.bytes().await?.to_vec();

                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                        etag,
                        last_modified,
                    });
                }
                Err(err) => {
                    if err.is_timeout() {
                        return Err(FetchError::Timeout {
                            url: request.url.to_string(),
                            after: request.timeout,
                        });
                    }
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// `If-None-Match` / `If-Modified-Since` for a conditional GET. An etag that
/// is not a legal header value is left out.
pub fn conditional_headers(request: &ConditionalRequest<'_>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(etag) = request.etag.and_then(|etag| HeaderValue::from_str(etag).ok()) {
        headers.insert(IF_NONE_MATCH, etag);
    }
    if let Some(modified) = request
        .last_modified
        .and_then(|at| HeaderValue::from_str(&format_http_date(at)).ok())
    {
        headers.insert(IF_MODIFIED_SINCE, modified);
    }
    headers
}

/// Format a timestamp as an IMF-fixdate for `If-Modified-Since`.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
