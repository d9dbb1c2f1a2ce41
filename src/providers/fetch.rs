use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: {status}")]
    Http { status: u16, body: Option<String> },
    #[error("Request cancelled")]
    Cancelled,
}

/// Raw HTTP response handed back to the ingestion layer, which owns parsing.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Seam between the retry machinery and the actual HTTP stack so tests can
/// script responses without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError>;
}

/// Production transport over reqwest. Every request carries no-cache headers:
/// live positions must always hit the network, never a transport-level cache.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(RawResponse { status, body })
    }
}

/// Retry configuration for [`RetryingFetcher`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so `max_retries = 3` means at most
    /// four attempts in total.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy for periodic polls: a missed cycle is cheap, the next tick will
    /// try again anyway.
    pub fn poll() -> Self {
        Self {
            max_retries: 2,
            ..Self::default()
        }
    }
}

/// Decides whether a failed attempt is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&FetchError) -> bool + Send + Sync>;

/// Invoked before each retry with (attempt, error, delay before next attempt).
pub type RetryHook = Arc<dyn Fn(u32, &FetchError, Duration) + Send + Sync>;

/// Default policy: retry network failures, 5xx and 429. Other 4xx responses
/// are the caller's fault and will not improve on retry.
pub fn default_retry_predicate(error: &FetchError) -> bool {
    match error {
        FetchError::Network(_) => true,
        FetchError::Http { status, .. } => *status >= 500 || *status == 429,
        FetchError::Cancelled => false,
    }
}

/// HTTP GET with exponential-backoff retry and cooperative cancellation.
pub struct RetryingFetcher<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    retry_predicate: RetryPredicate,
    on_retry: Option<RetryHook>,
}

impl RetryingFetcher<ReqwestTransport> {
    pub fn new(policy: RetryPolicy) -> Result<Self, FetchError> {
        Ok(Self::with_transport(ReqwestTransport::new()?, policy))
    }
}

impl<T: Transport> RetryingFetcher<T> {
    pub fn with_transport(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            retry_predicate: Arc::new(default_retry_predicate),
            on_retry: None,
        }
    }

    pub fn with_retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry_predicate = predicate;
        self
    }

    pub fn with_retry_hook(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// Issue the request, retrying per policy. Explicit cancellation aborts
    /// immediately regardless of the retry predicate. Returns the successful
    /// (2xx) response, or the terminal error with status/body attached when
    /// the server answered at all.
    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, FetchError> {
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let request_id = Uuid::new_v4();
            let start = Instant::now();

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                response = self.transport.get(url) => response.and_then(|r| {
                    if (200..300).contains(&r.status) {
                        Ok(r)
                    } else {
                        Err(FetchError::Http {
                            status: r.status,
                            body: Some(r.body),
                        })
                    }
                }),
            };

            match result {
                Ok(response) => {
                    debug!(
                        %request_id,
                        attempt,
                        status = response.status,
                        duration_ms = start.elapsed().as_millis() as u64,
                        response_size = response.body.len(),
                        "Fetch succeeded"
                    );
                    return Ok(response);
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(error) => {
                    debug!(
                        %request_id,
                        attempt,
                        error = %error,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Fetch attempt failed"
                    );

                    if attempt > self.policy.max_retries || !(self.retry_predicate)(&error) {
                        return Err(error);
                    }

                    let wait = delay.min(self.policy.max_delay);
                    if let Some(hook) = &self.on_retry {
                        hook(attempt, &error, wait);
                    }
                    warn!(attempt, error = %error, wait_ms = wait.as_millis() as u64, "Fetch failed, retrying");

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay = delay.mul_f64(self.policy.backoff_factor);
                }
            }
        }
    }
}
