//! Policy engine: reliability guards for bulk calls.
//!
//! ```text
//! Item → [RateLimiter] → [CircuitBreaker] → [RetryPolicy] → work
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy};
