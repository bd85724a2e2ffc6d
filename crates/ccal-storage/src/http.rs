//! HTTP fetch collaborator with failure classification for importers.

use std::error::Error as StdError;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// Imports surface transport failures to the user instead of retrying.
    fn default() -> Self {
        Self {
            max_retries: 0,
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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-request knobs: extra headers and a timeout overriding the client default.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn accept(mut self, value: &str) -> Self {
        self.headers.push(("Accept".to_string(), value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("nothing found at {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}: authentication required")]
    AuthenticationRequired { status: u16, url: String },
    /// Any other non-success status. `body` keeps the response text for APIs that explain
    /// their errors in it.
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("could not resolve host for {url}: {message}")]
    Dns { url: String, message: String },
    #[error("could not connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request failed for {url}: {message}")]
    Request { url: String, message: String },
}

impl FetchError {
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        let url = url.to_string();
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound { url },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::AuthenticationRequired {
                status: status.as_u16(),
                url,
            },
            _ => FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body: String::new(),
            },
        }
    }

    /// Attaches a response body; only `HttpStatus` carries one.
    pub fn with_body(self, text: String) -> Self {
        match self {
            FetchError::HttpStatus { status, url, .. } => FetchError::HttpStatus {
                status,
                url,
                body: text,
            },
            other => other,
        }
    }

    pub fn from_reqwest(err: &reqwest::Error, url: &str) -> Self {
        let url = url.to_string();
        let message = error_chain_text(err);
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_connect() && looks_like_dns_failure(&message) {
            FetchError::Dns { url, message }
        } else if err.is_connect() {
            FetchError::Connect { url, message }
        } else {
            FetchError::Request { url, message }
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout { .. } | FetchError::Connect { .. } => RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

fn looks_like_dns_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["dns error", "failed to lookup address", "name or service not known", "no such host"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// GET-only fetch seam; parsers depend on this rather than on reqwest directly.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str, options: &FetchOptions) -> Result<FetchedResponse, FetchError>;
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

    async fn get_once(&self, url: &str, options: &FetchOptions) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let resp = request
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(&err, url))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let err = FetchError::from_status(status, &final_url);
            let text = resp.text().await.unwrap_or_default();
            return Err(err.with_body(text));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::from_reqwest(&err, url))?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str, options: &FetchOptions) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0;
            loop {
                match self.get_once(url, options).await {
                    Ok(resp) => return Ok(resp),
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        debug!(attempt, error = %err, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}
