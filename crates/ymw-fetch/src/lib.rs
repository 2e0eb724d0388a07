//! Rate-limited HTTP fetch utilities with retry/backoff for catalog lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ymw-fetch";

/// Query parameters whose values never reach logs or error messages.
const SECRET_QUERY_PARAMS: &[&str] = &["key", "access_token", "api_key"];

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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub global_concurrency: usize,
    pub per_endpoint_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_endpoint_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Request pacing: at most `capacity` requests back to back, then one more every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// `None` for a zero rate, which means unpaced.
    pub fn per_minute(requests: u32, burst: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            capacity: burst.max(1),
            refill_every: Duration::from_secs(60) / requests,
        })
    }
}

#[derive(Debug)]
pub struct RequestPacer {
    config: TokenBucketConfig,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    tokens: u32,
    refilled_at: Instant,
}

impl PacerState {
    /// Take a token at `now`, or return how long until one is available.
    /// Partial refill intervals carry over to the next call.
    fn try_take(&mut self, config: &TokenBucketConfig, now: Instant) -> Result<(), Duration> {
        let step = config.refill_every;
        if step.is_zero() {
            return Ok(());
        }
        let elapsed = now.saturating_duration_since(self.refilled_at);
        let refills = u32::try_from(elapsed.as_nanos() / step.as_nanos()).unwrap_or(u32::MAX);
        if refills > 0 {
            self.tokens = self.tokens.saturating_add(refills).min(config.capacity);
            self.refilled_at = if self.tokens == config.capacity {
                now
            } else {
                self.refilled_at + step * refills
            };
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            Err(step.saturating_sub(now.saturating_duration_since(self.refilled_at)))
        }
    }
}

impl RequestPacer {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PacerState {
                tokens: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait for a request slot; returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = match self.state.lock().await.try_take(&self.config, Instant::now()) {
                Ok(()) => return waited,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_endpoint_limit: usize,
    per_endpoint: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after retries: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// Non-success status; `body` is kept so callers can read API error reasons.
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("fetcher shut down")]
    Closed,
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
        let pacer = config.token_bucket.map(RequestPacer::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_endpoint_limit: config.per_endpoint_concurrency.max(1),
            per_endpoint: Mutex::new(HashMap::new()),
            pacer,
            backoff: config.backoff,
        })
    }

    async fn per_endpoint_semaphore(&self, endpoint: &str) -> Arc<Semaphore> {
        let mut map = self.per_endpoint.lock().await;
        map.entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_endpoint_limit)))
            .clone()
    }

    /// GET `url`, retrying transient failures. `endpoint` names the concurrency pool.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        endpoint: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_endpoint = self.per_endpoint_semaphore(endpoint).await;
        let _endpoint = per_endpoint.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(pacer) = &self.pacer {
            let waited = pacer.acquire().await;
            if !waited.is_zero() {
                debug!(endpoint, waited_ms = waited.as_millis() as u64, "paced outbound request");
            }
        }

        let safe_url = redact_url(url);
        let span = info_span!("http_fetch", %run_id, endpoint, url = %safe_url);
        self.fetch_with_retries(url, &safe_url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str, safe_url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|source| FetchError::Request {
                            url: safe_url.to_string(),
                            source: source.without_url(),
                        })?;
                        return Ok(FetchedResponse {
                            status,
                            body: body.to_vec(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = retry_after(resp.headers())
                            .map(|d| d.min(self.backoff.max_delay))
                            .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
                        debug!(status = status.as_u16(), attempt, ?delay, "retrying after status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: safe_url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: safe_url.to_string(),
                        source: err.without_url(),
                    });
                }
            }
        }
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Replace secret query values (`key=...`) with `REDACTED`.
pub fn redact_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if SECRET_QUERY_PARAMS.contains(&name) => format!("{name}=REDACTED"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}
