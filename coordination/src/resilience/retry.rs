//! Retry with exponential backoff, symmetric jitter, and server wait hints.
//!
//! ```text
//! attempt 0 ──fail──▶ classify ──retryable──▶ on_retry ──sleep(delay)──▶ attempt 1 ...
//!                        │
//!                        └─non-retryable──▶ return error unchanged
//! ```
//!
//! The delay before retry `n` (0-based) is
//! `min(initial_delay * multiplier^n, max_delay)` scaled by a random factor
//! in `[1 - jitter, 1 + jitter]`. A `retry_after` hint on the error replaces
//! the computed delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{CallError, ConfigError};

/// Retry tuning. Durations are stored in milliseconds for TOML friendliness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. Negative values are rejected.
    pub max_retries: i32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay.
    pub max_delay_ms: u64,
    /// Exponential growth factor (>= 1.0).
    pub backoff_multiplier: f64,
    /// Symmetric jitter fraction in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    /// Default: 3 retries, 1s initial, 30s max, 2x multiplier, ±10% jitter.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 0 {
            return Err(ConfigError::new(
                "retry.max_retries",
                format!("must be >= 0, got {}", self.max_retries),
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::new(
                "retry.backoff_multiplier",
                format!("must be >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::new(
                "retry.jitter_factor",
                format!("must be within [0, 1], got {}", self.jitter_factor),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::new(
                "retry.initial_delay_ms",
                format!(
                    "initial delay {}ms exceeds max delay {}ms",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

/// Observer notified before each retry wait. Must not influence control flow.
pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, error: &CallError, attempt: u32, delay: Duration);
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRetryObserver;

impl RetryObserver for NoopRetryObserver {
    fn on_retry(&self, _error: &CallError, _attempt: u32, _delay: Duration) {}
}

/// Observer that logs each retry through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingRetryObserver {
    label: String,
}

impl TracingRetryObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl RetryObserver for TracingRetryObserver {
    fn on_retry(&self, error: &CallError, attempt: u32, delay: Duration) {
        warn!(
            call = %self.label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            code = error.code(),
            error = %error,
            "Retrying after transient failure"
        );
    }
}

/// Predicate deciding whether an error is worth another attempt.
pub type RetryClassifier = Arc<dyn Fn(&CallError) -> bool + Send + Sync>;

/// Retry policy bound to a validated configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter_factor: f64,
    should_retry: RetryClassifier,
    observer: Arc<dyn RetryObserver>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .finish()
    }
}

impl RetryPolicy {
    /// Build a policy, rejecting invalid configuration synchronously.
    pub fn new(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            max_retries: config.max_retries as u32,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            should_retry: Arc::new(CallError::is_retryable),
            observer: Arc::new(NoopRetryObserver),
        })
    }

    /// Replace the retry classifier.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&CallError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(classifier);
        self
    }

    /// Attach a retry observer.
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Maximum retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff for retry `attempt` (0-based) before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay for retry `attempt`, honoring a server hint first.
    pub fn delay_for(&self, attempt: u32, error: &CallError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint;
        }
        let base = self.base_delay(attempt);
        if self.jitter_factor == 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Run `operation` until it succeeds, fails non-retryably, or retries
    /// are exhausted. The last error is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_retries || !(self.should_retry)(&error) {
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt, &error);
                    attempt += 1;
                    self.observer.on_retry(&error, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
