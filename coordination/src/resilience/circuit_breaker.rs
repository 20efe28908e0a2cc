//! Failure-rate circuit breaker around the shared analysis dependency.
//!
//! The breaker keeps a bounded FIFO window of recent call outcomes. When the
//! failure fraction in the window exceeds the threshold (and the window holds
//! at least `minimum_calls` entries) the circuit *opens* and calls are
//! rejected without running. After the cooldown since the last failure the
//! circuit goes *half-open* and admits a single probe call; other callers are
//! rejected until the probe's outcome decides between closed and open.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::{CallError, ConfigError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, calls allowed.
    Closed,
    /// Tripped, calls rejected until cooldown expires.
    Open,
    /// Cooldown expired, one probe call decides.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Outcomes kept in the sliding window.
    pub window_size: usize,
    /// Failure fraction that must be exceeded to open, in `(0, 1)`.
    pub failure_threshold: f64,
    /// Outcomes required in the window before the breaker may open.
    pub minimum_calls: usize,
    /// Milliseconds after the last failure before Open → HalfOpen.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            minimum_calls: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::new("breaker.window_size", "must be > 0"));
        }
        if !(self.failure_threshold > 0.0 && self.failure_threshold < 1.0) {
            return Err(ConfigError::new(
                "breaker.failure_threshold",
                format!("must be within (0, 1), got {}", self.failure_threshold),
            ));
        }
        if self.minimum_calls == 0 || self.minimum_calls > self.window_size {
            return Err(ConfigError::new(
                "breaker.minimum_calls",
                format!(
                    "must be within [1, window_size={}], got {}",
                    self.window_size, self.minimum_calls
                ),
            ));
        }
        Ok(())
    }
}

/// Read-only view of the breaker for logs and status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub window_len: usize,
    pub failures_in_window: usize,
    pub failure_rate: f64,
    /// Time left before a probe is allowed; only set while open.
    #[serde(skip)]
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: VecDeque<bool>,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.window.len() as f64
        }
    }

    fn push(&mut self, ok: bool, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }
}

/// Sliding-window circuit breaker. Shared by reference across tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            cooldown: Duration::from_millis(config.cooldown_ms),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                last_failure: None,
                probe_in_flight: false,
            }),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Critical sections never panic; recover the guard if one ever did.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remaining cooldown if open, promoting to half-open once it has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) -> Option<Duration> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(self.cooldown);
        if elapsed >= self.cooldown {
            inner.state = CircuitState::HalfOpen;
            info!(breaker = %self.name, "Circuit half-open, probing");
            None
        } else {
            Some(self.cooldown - elapsed)
        }
    }

    /// Current state, applying any pending cooldown transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Snapshot for observability.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        let retry_in = self.refresh(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            window_len: inner.window.len(),
            failures_in_window: inner.failures(),
            failure_rate: inner.failure_rate(),
            retry_in,
        }
    }

    /// Reject immediately if the circuit is open and still cooling down.
    ///
    /// In half-open only the first caller is admitted. Its outcome must be
    /// reported through [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) to release the probe slot.
    pub fn check(&self) -> Result<(), CallError> {
        self.admit().map(|_| ())
    }

    /// Admit a call; `Ok(true)` when it is the half-open probe.
    fn admit(&self) -> Result<bool, CallError> {
        let mut inner = self.lock();
        if let Some(retry_in) = self.refresh(&mut inner) {
            return Err(CallError::CircuitOpen {
                name: self.name.clone(),
                retry_in,
            });
        }
        if inner.state != CircuitState::HalfOpen {
            return Ok(false);
        }
        if inner.probe_in_flight {
            return Err(CallError::CircuitOpen {
                name: self.name.clone(),
                retry_in: Duration::ZERO,
            });
        }
        inner.probe_in_flight = true;
        Ok(true)
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.last_failure = None;
                inner.probe_in_flight = false;
                info!(breaker = %self.name, "Circuit closed after successful probe");
            }
            CircuitState::Closed => inner.push(true, self.config.window_size),
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(now);
                inner.probe_in_flight = false;
                warn!(breaker = %self.name, "Probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                inner.push(false, self.config.window_size);
                inner.last_failure = Some(now);
                let rate = inner.failure_rate();
                if inner.window.len() >= self.config.minimum_calls
                    && rate > self.config.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failure_rate = rate,
                        window = inner.window.len(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => inner.last_failure = Some(now),
        }
    }

    /// Run `operation` unless the circuit is open. Any error from the
    /// operation counts as a failure. A dropped (cancelled) call records
    /// nothing but gives back the probe slot if it held it.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut probe = ProbeSlot {
            breaker: self,
            held: self.admit()?,
        };
        let result = operation().await;
        probe.held = false;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }
}

/// Frees the half-open probe slot if the probe is dropped unfinished.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}
