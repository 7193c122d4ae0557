//! Executor configuration and presets.

use std::time::Duration;

use ledgerflow_core::policy::{RetryConfig, RetryPolicy};

/// Configuration for [`HttpBatchExecutor`](crate::HttpBatchExecutor).
#[derive(Debug, Clone)]
pub struct HttpBatchOptions {
    /// Deadline for one grouped POST including its retries, unless the
    /// caller supplies its own.
    pub timeout: Duration,
    /// Maximum sub-requests per POST; larger sets are split into chunks.
    pub max_batch_size: usize,
    /// Retries after the first attempt for connection failures and 5xx.
    pub retry_count: u32,
    /// Delay before the first retry.
    pub retry_backoff: Duration,
    /// Growth factor for later retry delays. `1.0` keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Cap on any single retry delay.
    pub max_backoff: Duration,
    /// Keep going when sub-requests or chunks fail.
    pub continue_on_error: bool,
    /// Chunks in flight at once.
    pub workers: usize,
}

impl Default for HttpBatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_batch_size: 100,
            retry_count: 3,
            retry_backoff: Duration::from_millis(500),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(30),
            continue_on_error: false,
            workers: 5,
        }
    }
}

impl HttpBatchOptions {
    /// Bigger batches, more retries and workers, 120s timeout.
    pub fn high_throughput() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_batch_size: 500,
            retry_count: 5,
            workers: 10,
            ..Default::default()
        }
    }

    /// Smaller batches, more workers, 30s timeout, 100ms backoff.
    pub fn low_latency() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_batch_size: 20,
            retry_backoff: Duration::from_millis(100),
            workers: 10,
            ..Default::default()
        }
    }

    /// More retries, continue on error, 180s timeout.
    pub fn high_reliability() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            retry_count: 10,
            retry_backoff: Duration::from_secs(1),
            continue_on_error: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.max_batch_size = size;
        }
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers > 0 {
            self.workers = workers;
        }
        self
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: self.retry_count,
            backoff: self.retry_backoff,
            multiplier: self.backoff_multiplier,
            max_backoff: self.max_backoff,
        })
    }
}
