//! Resilience layers around the shared analysis dependency.
//!
//! - [`retry`]: exponential backoff with jitter and server wait hints
//! - [`circuit_breaker`]: sliding-window failure-rate breaker
//! - [`rate_limiter`]: token buckets per resource dimension
//! - [`budget`]: per-review unit budget with per-task attribution
//! - [`caller`]: all of the above composed around one client

pub mod budget;
pub mod caller;
pub mod circuit_breaker;
pub mod error;
pub mod rate_limiter;
pub mod retry;

pub use budget::{BudgetConfig, BudgetSnapshot, BudgetTracker, UsageReport};
pub use caller::ResilientCaller;
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use error::{CallError, ConfigError, ErrorClass};
pub use rate_limiter::{RateLimitConfig, RateLimiter, TokenBucket};
pub use retry::{NoopRetryObserver, RetryConfig, RetryObserver, RetryPolicy, TracingRetryObserver};
