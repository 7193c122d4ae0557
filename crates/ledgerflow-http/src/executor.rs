//! Grouped HTTP batch executor backed by `reqwest`.
//!
//! Features:
//! - One POST per group of sub-requests to `<base_url>/batch`
//! - Retry with backoff for connection failures and 5xx answers
//! - Oversized sets split into chunks and sent through the worker pool
//! - Optional circuit breaker supplied by the caller
//! - Per-chunk deadline from the options or the caller

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use ledgerflow_core::policy::{CircuitBreaker, RetryPolicy};
use ledgerflow_core::{worker_pool, PoolOptions, WorkError};

use crate::error::BatchError;
use crate::options::HttpBatchOptions;
use crate::request::{HttpBatchRequest, HttpBatchResponse, HttpBatchResult};

/// Executes grouped requests against a batch endpoint.
///
/// Cheap to clone; clones share the underlying connection pool and breaker.
#[derive(Clone)]
pub struct HttpBatchExecutor {
    http: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
    options: HttpBatchOptions,
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
}

impl HttpBatchExecutor {
    /// Create an executor for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, options: HttpBatchOptions) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, options)
    }

    /// Create an executor that reuses an existing `reqwest` client.
    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        options: HttpBatchOptions,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            headers: Vec::new(),
            retry: options.retry_policy(),
            options,
            breaker: None,
        }
    }

    /// Add a header sent with every grouped POST.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send `Authorization: Bearer <token>` with every grouped POST.
    pub fn with_auth_token(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.with_header("Authorization", value)
    }

    /// Gate every grouped POST through `breaker`.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn options(&self) -> &HttpBatchOptions {
        &self.options
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// URL the grouped requests are POSTed to.
    pub fn endpoint(&self) -> String {
        format!("{}/batch", self.base_url)
    }

    /// Execute `requests`, each chunk bounded by the configured timeout.
    ///
    /// Returns `Err` when a single-chunk batch fails outright (network,
    /// status, decoding, cancellation, open circuit). Once the set is split
    /// into chunks, responses from chunks merged before a failure are kept
    /// and the failure is reported through [`HttpBatchResult::error`], as
    /// are failed sub-requests.
    pub async fn execute_batch(
        &self,
        cancel: &CancellationToken,
        requests: Vec<HttpBatchRequest>,
    ) -> Result<HttpBatchResult, BatchError> {
        self.execute(cancel, requests, None).await
    }

    /// Like [`execute_batch`](Self::execute_batch), but every chunk must
    /// finish by `deadline` instead of the configured timeout.
    pub async fn execute_batch_with_deadline(
        &self,
        cancel: &CancellationToken,
        requests: Vec<HttpBatchRequest>,
        deadline: Instant,
    ) -> Result<HttpBatchResult, BatchError> {
        self.execute(cancel, requests, Some(deadline)).await
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        requests: Vec<HttpBatchRequest>,
        deadline: Option<Instant>,
    ) -> Result<HttpBatchResult, BatchError> {
        if requests.is_empty() {
            return Ok(HttpBatchResult::default());
        }

        let requests = assign_ids(requests);
        let max = self.options.max_batch_size.max(1);
        if requests.len() <= max {
            return self.execute_chunk(cancel, requests, deadline).await;
        }

        let total = requests.len();
        let chunks = split_chunks(requests, max);
        tracing::debug!(
            requests = total,
            chunks = chunks.len(),
            workers = self.options.workers,
            "splitting oversized batch"
        );

        let executor = self.clone();
        let outcomes = worker_pool(
            cancel,
            chunks,
            move |cancel, chunk| {
                let executor = executor.clone();
                async move { executor.execute_chunk(&cancel, chunk, deadline).await }
            },
            PoolOptions::default()
                .with_workers(self.options.workers)
                .with_ordered(true),
        )
        .await;

        let mut merged = HttpBatchResult {
            responses: Vec::with_capacity(total),
            error: None,
        };
        for chunk in outcomes {
            match chunk.outcome {
                Ok(result) => {
                    merged.responses.extend(result.responses);
                    if let Some(err) = result.error {
                        // Only set when not continuing on error.
                        merged.error = Some(err);
                        break;
                    }
                }
                Err(WorkError::Failed(err)) if self.options.continue_on_error => {
                    tracing::warn!(chunk = chunk.index, error = %err, "skipping failed chunk");
                    merged.error.get_or_insert(err);
                }
                Err(WorkError::Failed(err)) => {
                    tracing::warn!(
                        chunk = chunk.index,
                        kept = merged.responses.len(),
                        error = %err,
                        "chunk failed, stopping merge"
                    );
                    merged.error = Some(err);
                    break;
                }
                Err(_) => {
                    merged.error = Some(BatchError::Cancelled);
                    break;
                }
            }
        }
        Ok(merged)
    }

    async fn execute_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: Vec<HttpBatchRequest>,
        deadline: Option<Instant>,
    ) -> Result<HttpBatchResult, BatchError> {
        let body = serde_json::to_vec(&chunk)?;
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.options.timeout);

        let responses = match &self.breaker {
            Some(breaker) => {
                if !breaker.allow_request() {
                    return Err(BatchError::CircuitOpen);
                }
                match self.send_until(cancel, &body, deadline).await {
                    Ok(responses) => {
                        breaker.record_success();
                        responses
                    }
                    Err(e) => {
                        // A 4xx still proves the service is up.
                        if e.is_retryable() {
                            breaker.record_failure();
                        } else if matches!(e, BatchError::Status { .. }) {
                            breaker.record_success();
                        }
                        return Err(e);
                    }
                }
            }
            None => self.send_until(cancel, &body, deadline).await?,
        };

        let failed: Vec<&HttpBatchResponse> = responses.iter().filter(|r| !r.is_success()).collect();
        let error = match failed.first() {
            Some(first) if !self.options.continue_on_error => Some(BatchError::SubRequests {
                failed: failed.len(),
                total: responses.len(),
                first: first.to_error().map(|e| e.to_string()).unwrap_or_default(),
            }),
            _ => None,
        };
        if !failed.is_empty() {
            tracing::warn!(
                failed = failed.len(),
                total = responses.len(),
                "batch contained failed requests"
            );
        }

        Ok(HttpBatchResult { responses, error })
    }

    async fn send_until(
        &self,
        cancel: &CancellationToken,
        body: &[u8],
        deadline: Instant,
    ) -> Result<Vec<HttpBatchResponse>, BatchError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        time::timeout_at(deadline, self.send_with_retry(cancel, body))
            .await
            .map_err(|_| BatchError::Timeout {
                ms: budget.as_millis() as u64,
            })?
    }

    async fn send_with_retry(
        &self,
        cancel: &CancellationToken,
        body: &[u8],
    ) -> Result<Vec<HttpBatchResponse>, BatchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.send_once(cancel, body).await {
                Ok(responses) => return Ok(responses),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            match self.retry.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        url = %self.base_url,
                        "retrying batch request"
                    );
                    backoff(cancel, delay).await?;
                }
                None => {
                    tracing::error!(
                        attempt,
                        error = %err,
                        url = %self.base_url,
                        "max retries exceeded"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        cancel: &CancellationToken,
        body: &[u8],
    ) -> Result<Vec<HttpBatchResponse>, BatchError> {
        let mut req = self
            .http
            .post(self.endpoint())
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let exchange = async {
            let resp = req
                .body(body.to_vec())
                .send()
                .await
                .map_err(BatchError::from_reqwest)?;
            let status = resp.status();
            let bytes = resp.bytes().await.map_err(BatchError::from_reqwest)?;
            Ok::<_, BatchError>((status, bytes))
        };

        let (status, bytes) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BatchError::Cancelled),
            exchanged = exchange => exchanged?,
        };

        if !status.is_success() {
            return Err(BatchError::from_status(status.as_u16(), &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl std::fmt::Debug for HttpBatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBatchExecutor")
            .field("base_url", &self.base_url)
            .field("options", &self.options)
            .field("breaker", &self.breaker)
            .finish()
    }
}

async fn backoff(cancel: &CancellationToken, delay: Duration) -> Result<(), BatchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BatchError::Cancelled),
        _ = time::sleep(delay) => Ok(()),
    }
}

/// Give every request without an id the id `req_<index>`.
fn assign_ids(mut requests: Vec<HttpBatchRequest>) -> Vec<HttpBatchRequest> {
    for (index, req) in requests.iter_mut().enumerate() {
        if req.id.is_empty() {
            req.id = format!("req_{index}");
        }
    }
    requests
}

fn split_chunks(requests: Vec<HttpBatchRequest>, size: usize) -> Vec<Vec<HttpBatchRequest>> {
    let mut chunks = Vec::with_capacity(requests.len().div_ceil(size));
    let mut requests = requests.into_iter().peekable();
    while requests.peek().is_some() {
        chunks.push(requests.by_ref().take(size).collect());
    }
    chunks
}
