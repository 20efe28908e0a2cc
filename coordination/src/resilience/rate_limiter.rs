//! Token-bucket throttling against the shared dependency's capacity.
//!
//! Each bucket refills continuously at `refill_per_sec`. `acquire(n)` takes
//! `n` tokens immediately when available, otherwise sleeps exactly long
//! enough for the deficit to refill. The lock is never held across a sleep.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::error::{CallError, ConfigError};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(
        name: impl Into<String>,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if !(capacity > 0.0) {
            return Err(ConfigError::new(
                format!("rate_limit.{name}"),
                format!("capacity must be > 0, got {capacity}"),
            ));
        }
        if !(refill_per_sec > 0.0) {
            return Err(ConfigError::new(
                format!("rate_limit.{name}"),
                format!("refill rate must be > 0, got {refill_per_sec}"),
            ));
        }
        Ok(Self {
            name,
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Bucket sized for `per_minute` tokens, refilling evenly over a minute.
    pub fn per_minute(name: impl Into<String>, per_minute: f64) -> Result<Self, ConfigError> {
        Self::new(name, per_minute, per_minute / 60.0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Tokens available right now, after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn check_capacity(&self, n: f64) -> Result<(), CallError> {
        if n > self.capacity {
            return Err(CallError::CapacityExceeded {
                bucket: self.name.clone(),
                requested: n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Take `n` tokens if available without waiting.
    pub fn try_acquire(&self, n: f64) -> Result<bool, CallError> {
        self.check_capacity(n)?;
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Take `n` tokens, sleeping for the deficit if necessary.
    pub async fn acquire(&self, n: f64) -> Result<(), CallError> {
        if n <= 0.0 {
            return Ok(());
        }
        self.check_capacity(n)?;
        loop {
            let wait = {
                let mut state = self.lock();
                self.refill(&mut state);
                if state.tokens >= n {
                    state.tokens -= n;
                    return Ok(());
                }
                Duration::from_secs_f64((n - state.tokens) / self.refill_per_sec)
            };
            debug!(bucket = %self.name, wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
            // Another waiter may win the refill; loop and re-check.
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-minute limits for each resource dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub input_units_per_minute: f64,
    pub output_units_per_minute: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60.0,
            input_units_per_minute: 200_000.0,
            output_units_per_minute: 40_000.0,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("rate_limit.requests_per_minute", self.requests_per_minute),
            ("rate_limit.input_units_per_minute", self.input_units_per_minute),
            ("rate_limit.output_units_per_minute", self.output_units_per_minute),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::new(field, format!("must be > 0, got {value}")));
            }
        }
        Ok(())
    }
}

/// One bucket per dimension; a call must acquire from all of them.
#[derive(Debug)]
pub struct RateLimiter {
    requests: TokenBucket,
    input_units: TokenBucket,
    output_units: TokenBucket,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            requests: TokenBucket::per_minute("requests", config.requests_per_minute)?,
            input_units: TokenBucket::per_minute("input_units", config.input_units_per_minute)?,
            output_units: TokenBucket::per_minute("output_units", config.output_units_per_minute)?,
        })
    }

    /// Reject a call that no bucket refill could ever satisfy.
    pub fn check_capacity(&self, input_units: f64, output_units: f64) -> Result<(), CallError> {
        self.input_units.check_capacity(input_units)?;
        self.output_units.check_capacity(output_units)
    }

    /// Acquire one request plus the estimated input and output units.
    pub async fn acquire(&self, input_units: f64, output_units: f64) -> Result<(), CallError> {
        // Fail fast on impossible requests before consuming anything.
        self.check_capacity(input_units, output_units)?;
        self.requests.acquire(1.0).await?;
        self.input_units.acquire(input_units).await?;
        self.output_units.acquire(output_units).await
    }

    pub fn requests(&self) -> &TokenBucket {
        &self.requests
    }

    pub fn input_units(&self) -> &TokenBucket {
        &self.input_units
    }

    pub fn output_units(&self) -> &TokenBucket {
        &self.output_units
    }
}
