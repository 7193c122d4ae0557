//! Token bucket rate limiter.
//!
//! A background ticker deposits one token every `1s / ops_per_second` into a
//! store holding at most `max_burst` tokens. Tokens produced while the store
//! is full are dropped, never queued. Each [`RateLimiter::wait`] consumes one
//! token. The store starts full, so an idle limiter admits up to
//! `max_burst` calls immediately and then settles at the steady rate.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Steady-state rate. `0` is treated as `1`.
    pub ops_per_second: u32,
    /// Maximum stored tokens. `0` means "same as `ops_per_second`".
    pub max_burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            ops_per_second: 1,
            max_burst: 0,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(ops_per_second: u32, max_burst: u32) -> Self {
        Self {
            ops_per_second,
            max_burst,
        }
    }

    fn rate(&self) -> u32 {
        self.ops_per_second.max(1)
    }

    fn burst(&self) -> usize {
        match self.max_burst {
            0 => self.rate() as usize,
            n => n as usize,
        }
    }

    /// Interval between two token deposits.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate()
    }
}

/// Thread-safe ticker-driven token bucket.
///
/// Must be created inside a Tokio runtime: construction spawns the ticker
/// task. Call [`stop`](Self::stop) to shut the ticker down and wait for it;
/// dropping the limiter signals the ticker to exit without waiting.
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    capacity: usize,
    interval: Duration,
    shutdown: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let capacity = config.burst();
        let interval = config.tick_interval();
        let tokens = Arc::new(Semaphore::new(capacity));
        let shutdown = CancellationToken::new();

        let ticker = tokio::spawn(refill_loop(
            tokens.clone(),
            capacity,
            interval,
            shutdown.clone(),
        ));

        tracing::debug!(
            capacity,
            interval_ms = interval.as_millis() as u64,
            "rate limiter started"
        );

        Self {
            tokens,
            capacity,
            interval,
            shutdown,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Shorthand for `RateLimiter::new(RateLimiterConfig::new(ops, burst))`.
    pub fn per_second(ops_per_second: u32, max_burst: u32) -> Self {
        Self::new(RateLimiterConfig::new(ops_per_second, max_burst))
    }

    /// Block until a token is available or `cancel` fires.
    ///
    /// Also returns [`Cancelled`] once the limiter has been stopped.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            permit = self.tokens.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(Cancelled),
            },
        }
    }

    /// Take a token without waiting. Returns `false` if none is stored.
    pub fn try_acquire(&self) -> bool {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns currently stored tokens.
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Maximum number of stored tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Interval between token deposits.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the ticker and wait until it has exited.
    ///
    /// Pending and future [`wait`](Self::wait) calls return [`Cancelled`].
    /// Calling `stop` more than once is harmless.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tokens.close();
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "rate limiter ticker exited abnormally");
            }
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("interval", &self.interval)
            .field("available", &self.available())
            .finish()
    }
}

async fn refill_loop(
    tokens: Arc<Semaphore>,
    capacity: usize,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                // Only this task adds tokens, so the check cannot overshoot.
                if tokens.available_permits() < capacity {
                    tokens.add_permits(1);
                }
            }
        }
    }
}
