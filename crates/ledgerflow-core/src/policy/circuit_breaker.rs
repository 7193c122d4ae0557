//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      consecutive failures reach `failure_threshold`
//! - `Open` → `Half-Open`:   first call attempt after `open_timeout` has elapsed
//!   since the last failure; that call goes through as a probe
//! - `Half-Open` → `Closed`: consecutive successes reach `success_threshold`
//! - `Half-Open` → `Open`:   any failure
//!
//! Admission and outcome recording are separate critical sections, so under
//! concurrency more than `success_threshold` probes may be admitted while the
//! breaker is half-open.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::BreakerError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `open_timeout` has elapsed.
    Open,
    /// Probe requests allowed to test whether the dependency recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening.
    pub failure_threshold: u32,
    /// Number of consecutive half-open successes before closing.
    pub success_threshold: u32,
    /// How long to stay open after the last failure before probing.
    pub open_timeout: Duration,
    /// Name used in transition log messages. Unnamed breakers log nothing.
    pub name: Option<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
            name: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_timeout,
            name: None,
        }
    }

    /// Attach a name; enables transition logging.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Thread-safe circuit breaker.
///
/// Cloning yields a handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        config.success_threshold = config.success_threshold.max(1);
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            })),
        }
    }

    /// Create a named breaker.
    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::new(config.with_name(name))
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Does not move `Open` to `HalfOpen`; only a call attempt does.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded so far.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Decide whether a call may proceed, transitioning `Open` → `HalfOpen`
    /// when the open timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.open_timeout);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    if let Some(name) = self.name() {
                        tracing::info!(circuit = name, "circuit '{name}' half-open, probing");
                    }
                }
                elapsed
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    if let Some(name) = self.name() {
                        tracing::info!(circuit = name, "circuit '{name}' closed after recovery");
                    }
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    if let Some(name) = self.name() {
                        tracing::warn!(
                            circuit = name,
                            failures = inner.failure_count,
                            "circuit '{name}' opened after {} failures",
                            inner.failure_count
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                if let Some(name) = self.name() {
                    tracing::warn!(circuit = name, "circuit '{name}' probe failed, reopened");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }

    /// Run `f` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] without invoking `f` while the circuit
    /// is open, and [`BreakerError::Cancelled`] if `cancel` already fired.
    /// Any `Err` from `f` counts as a failure.
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(BreakerError::Cancelled);
        }
        if !self.allow_request() {
            return Err(BreakerError::Open);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}
