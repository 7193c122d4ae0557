//! ledgerflow-core: concurrency and resilience primitives for bulk ledger work.
//!
//! # Overview
//!
//! Bulk SDK operations (creating accounts, posting transactions, fetching
//! balances) fan out through these building blocks:
//!
//! - [`pool`] module: [`worker_pool`] and [`for_each`], bounded fan-out/fan-in
//! - [`batch`] module: [`batch`](batch::batch), fixed-size groups over the pool
//! - [`policy`] module: rate limiter, circuit breaker, retry policy
//! - [`error`] module: [`WorkError`], [`BreakerError`], [`Cancelled`]
//!
//! Cancellation is cooperative and signalled with a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).

pub mod batch;
pub mod error;
pub mod policy;
pub mod pool;

pub use batch::DEFAULT_BATCH_SIZE;
pub use error::{BreakerError, Cancelled, WorkError};
pub use policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, RateLimiterConfig};
pub use pool::{for_each, worker_pool, PoolOptions, WorkResult};
