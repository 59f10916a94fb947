//! Shared HTTP client for producers that fetch many URLs concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

/// Whether a failed request is worth sending again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are retried; any other status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Timeouts and connection failures are retried; decode and redirect
/// errors are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    match (err.is_timeout(), err.is_connect(), err.is_request()) {
        (false, false, false) => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// How long to wait before sending `attempt` again, or `None` when the
    /// failure is final.
    pub fn retry_after(&self, disposition: RetryDisposition, attempt: usize) -> Option<Duration> {
        (disposition == RetryDisposition::Retryable && attempt < self.max_retries)
            .then(|| self.delay_for_attempt(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across every resource sharing the fetcher.
    pub max_in_flight: usize,
    /// Requests in flight for a single resource.
    pub max_in_flight_per_resource: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            user_agent: Some(format!("rowsmith/{}", env!("CARGO_PKG_VERSION"))),
            max_in_flight: 16,
            max_in_flight_per_resource: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    HttpStatus { status: u16, url: String },
    #[error("{url} did not return valid json: {message}")]
    Json { url: String, message: String },
    #[error("fetcher is shut down")]
    Closed,
}

/// Client with a global request limit plus a limit per resource, so one
/// producer fanning out cannot starve the others sharing the fetcher.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_resource_limit: usize,
    per_resource: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http fetch client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_resource_limit: config.max_in_flight_per_resource.max(1),
            per_resource: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn resource_limit(&self, resource: &str) -> Arc<Semaphore> {
        let mut limits = self.per_resource.lock().await;
        Arc::clone(
            limits
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_resource_limit))),
        )
    }

    /// GET `url` on behalf of `resource`, waiting for both permits first.
    pub async fn fetch_bytes(&self, resource: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let limit = self.resource_limit(resource).await;
        let _resource_permit = limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        self.get_with_retry(url)
            .instrument(info_span!("http_fetch", resource, url))
            .await
    }

    pub async fn fetch_json(&self, resource: &str, url: &str) -> Result<JsonValue, FetchError> {
        let body = self.fetch_bytes(resource, url).await?;
        serde_json::from_slice(&body).map_err(|err| FetchError::Json {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    async fn get_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let failure = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await.map_err(|source| FetchError::Request {
                        url: url.to_string(),
                        source,
                    })?;
                    debug!(bytes = body.len(), attempt, "fetched");
                    return Ok(body.to_vec());
                }
                Ok(resp) => (
                    classify_status(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: url.to_string(),
                    },
                ),
                Err(source) => (
                    classify_reqwest_error(&source),
                    FetchError::Request {
                        url: url.to_string(),
                        source,
                    },
                ),
            };

            let (disposition, err) = failure;
            match self.backoff.retry_after(disposition, attempt) {
                Some(delay) => {
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            }
        }
    }
}
