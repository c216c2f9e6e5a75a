//! Shared HTTP transport: retries with jittered exponential backoff, global and
//! per-source concurrency limits, optional token-bucket pacing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use harvest_core::ErrorKind;
use rand::Rng;
use reqwest::header::{HeaderMap, LAST_MODIFIED, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx is retried. 429 is deliberately surfaced to the caller so it can defer
/// the remaining work to the next scheduled run.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
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
    /// Extra random delay as a fraction of the base delay, clamped to `0.0..=0.5`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay for `attempt_index` with `sample` in `[0, 1)` scaling the jitter.
    ///
    /// Because the jitter is at most half the un-jittered delay and delays
    /// double per attempt, the sequence stays non-decreasing up to `max_delay`
    /// whatever the samples are.
    pub fn jittered_delay(&self, attempt_index: usize, sample: f64) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 0.5) * sample.clamp(0.0, 1.0);
        base.saturating_add(base.mul_f64(jitter)).min(self.max_delay)
    }

    fn next_delay(&self, attempt_index: usize) -> Duration {
        let sample: f64 = rand::rng().random();
        self.jittered_delay(attempt_index, sample)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: TokenBucketConfig) -> Self {
        Self::new(config.capacity.max(1), config.refill_every)
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Per-source overrides applied on top of the shared client.
#[derive(Debug, Clone, Default)]
pub struct HttpProfile {
    pub user_agent: Option<String>,
    pub timeout: Option<Duration>,
    pub token_bucket: Option<TokenBucketConfig>,
}

/// Query parameters whose values never reach logs or stored error records.
const CREDENTIAL_PARAMS: &[&str] = &[
    "api_key",
    "apikey",
    "key",
    "token",
    "access_token",
    "client_secret",
    "secret",
    "password",
];

const REDACTED: &str = "REDACTED";

/// `url` with credential query values and any userinfo password masked.
/// Unparseable input and URLs without credentials come back unchanged.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let mut redacted = false;
    let mut pairs = Vec::new();
    for (name, value) in parsed.query_pairs() {
        if CREDENTIAL_PARAMS.iter().any(|c| name.eq_ignore_ascii_case(c)) {
            redacted = true;
            pairs.push((name.into_owned(), REDACTED.to_string()));
        } else {
            pairs.push((name.into_owned(), value.into_owned()));
        }
    }
    if redacted {
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }
    if parsed.password().is_some() && parsed.set_password(Some(REDACTED)).is_ok() {
        redacted = true;
    }
    if redacted {
        parsed.to_string()
    } else {
        url.to_string()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url} after {attempts} attempts")]
    RetriesExhausted {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("http client is shutting down")]
    Shutdown,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransientNetwork
    }
}

/// Response with an unread body.
///
/// The pooled connection and the concurrency permits stay checked out until the
/// body is consumed with [`HttpResponse::text`] / [`HttpResponse::bytes`] or the
/// value is closed or dropped. Keeping unread responses around exhausts the
/// pool; that is a caller bug, not something the client guards against.
#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    final_url: String,
    inner: reqwest::Response,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl HttpResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn final_url(&self) -> &str {
        &self.final_url
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers().get(name).and_then(|v| v.to_str().ok())
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let raw = self.inner.headers().get(LAST_MODIFIED)?.to_str().ok()?;
        DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// `Retry-After` in its delta-seconds form.
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.inner.headers().get(RETRY_AFTER)?.to_str().ok()?;
        raw.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    pub async fn text(self) -> Result<String, FetchError> {
        self.inner
            .text()
            .await
            .map_err(|err| FetchError::Request(err.without_url()))
    }

    pub async fn bytes(self) -> Result<Vec<u8>, FetchError> {
        self.inner
            .bytes()
            .await
            .map(|body| body.to_vec())
            .map_err(|err| FetchError::Request(err.without_url()))
    }

    /// Releases the connection without reading the body.
    pub fn close(self) {}
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::from_config(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
            timeout: config.timeout,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Binds the shared client to one source's User-Agent, timeout and pacing.
    pub fn for_source(self: &Arc<Self>, source_id: &str, profile: &HttpProfile) -> SourceHttp {
        SourceHttp {
            fetcher: Arc::clone(self),
            source_id: source_id.to_string(),
            user_agent: profile.user_agent.clone(),
            timeout: profile.timeout.unwrap_or(self.timeout),
            token_bucket: profile
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::from_config(c))),
        }
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn send(&self, source: &SourceHttp, method: Method, url: &str) -> Result<HttpResponse, FetchError> {
        let global = Arc::clone(&self.global_limit)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_source = self
            .per_source_semaphore(&source.source_id)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let permits = vec![global, per_source];

        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            if let Some(bucket) = &source.token_bucket {
                bucket.take().await;
            }

            let mut request = self
                .client
                .request(method.clone(), url)
                .timeout(source.timeout);
            if let Some(user_agent) = &source.user_agent {
                request = request.header(USER_AGENT, user_agent.as_str());
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = redact_url(resp.url().as_str());
                    let retryable = classify_status(status) == RetryDisposition::Retryable;

                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.next_delay(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying after server error");
                        drop(resp);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    if retryable {
                        return Err(FetchError::RetriesExhausted {
                            status: status.as_u16(),
                            url: final_url,
                            attempts: attempt + 1,
                        });
                    }

                    debug!(status = status.as_u16(), "response received");
                    return Ok(HttpResponse {
                        status,
                        final_url,
                        inner: resp,
                        _permits: permits,
                    });
                }
                Err(err) => {
                    let err = err.without_url();
                    let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.next_delay(attempt);
                        warn!(%err, attempt, ?delay, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Source-scoped view of the shared [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct SourceHttp {
    fetcher: Arc<HttpFetcher>,
    source_id: String,
    user_agent: Option<String>,
    timeout: Duration,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl SourceHttp {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let span = info_span!("http_fetch", source_id = %self.source_id, method = "GET", url = %redact_url(url));
        self.fetcher.send(self, Method::GET, url).instrument(span).await
    }

    pub async fn head(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let span = info_span!("http_fetch", source_id = %self.source_id, method = "HEAD", url = %redact_url(url));
        self.fetcher.send(self, Method::HEAD, url).instrument(span).await
    }
}
