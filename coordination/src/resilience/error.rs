//! Error taxonomy for calls that cross the shared external dependency.
//!
//! Every failure on the analysis call path is a [`CallError`]. The resilience
//! layers branch on its variant instead of string matching:
//!
//! | Class          | Variants                                   | Retried |
//! |----------------|--------------------------------------------|---------|
//! | Transient      | `Network`, `Http` (408/429/5xx), `Timeout` | yes     |
//! | Transient      | `Provider` matching a transient pattern    | yes     |
//! | Budget         | `BudgetExceeded`                           | no      |
//! | Circuit        | `CircuitOpen`                              | no      |
//! | Configuration  | `CapacityExceeded`, `Config`               | no      |
//! | Cancellation   | `Cancelled`                                | no      |

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Network error codes that indicate a transient connection problem.
pub const TRANSIENT_NETWORK_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "ETIMEDOUT",
    "EPIPE",
    "ENOTFOUND",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "EAI_AGAIN",
];

/// HTTP status codes worth retrying: request timeout, rate limit, 5xx and the
/// proxy/overload codes some gateways emit.
pub const RETRYABLE_HTTP_STATUSES: &[u16] = &[
    408, 429, 500, 502, 503, 504, 520, 521, 522, 523, 524, 529,
];

static TRANSIENT_MESSAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timeout|timed out|rate.?limit|overloaded|too many requests|temporarily unavailable|service unavailable|try again|socket hang up|connection reset)",
    )
    .expect("TRANSIENT_MESSAGE_RE regex should compile")
});

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blips, 429/5xx, overload signals.
    Transient,
    /// Pre-flight budget rejection.
    Budget,
    /// Circuit breaker short-circuit.
    CircuitOpen,
    /// Invalid request or configuration.
    Configuration,
    /// Permanent provider-side rejection (4xx other than 408/429).
    Permanent,
    /// Caller-side cancellation.
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Budget => write!(f, "budget"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Configuration => write!(f, "configuration"),
            Self::Permanent => write!(f, "permanent"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of a call through the resilience stack.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Connection-level failure carrying an OS/network error code.
    #[error("network error [{code}]: {message}")]
    Network { code: String, message: String },

    /// Non-success HTTP response.
    #[error("http {status}: {message}")]
    Http {
        status: u16,
        message: String,
        /// Server-provided wait hint (e.g. `Retry-After`).
        retry_after: Option<Duration>,
    },

    /// The call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Free-form provider failure; classified by message pattern.
    #[error("provider error: {0}")]
    Provider(String),

    /// Pre-flight budget check rejected the call.
    #[error("budget exceeded for task '{task}': used {used:.1} + estimated {estimated:.1} > max {max:.1}")]
    BudgetExceeded {
        task: String,
        used: f64,
        estimated: f64,
        max: f64,
    },

    /// Circuit breaker is open; the operation was not invoked.
    #[error("circuit '{name}' is open; retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },

    /// More tokens requested than a bucket can ever hold.
    #[error("rate limiter '{bucket}': requested {requested} exceeds capacity {capacity}")]
    CapacityExceeded {
        bucket: String,
        requested: f64,
        capacity: f64,
    },

    /// Invalid call configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The caller abandoned the call.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CallError {
    /// Convenience constructor for an HTTP failure without a wait hint.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Convenience constructor for a network failure.
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { code, message } => {
                if TRANSIENT_NETWORK_CODES.contains(&code.as_str())
                    || TRANSIENT_MESSAGE_RE.is_match(message)
                {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Self::Http {
                status, message, ..
            } => {
                if RETRYABLE_HTTP_STATUSES.contains(status)
                    || (500..600).contains(status)
                    || TRANSIENT_MESSAGE_RE.is_match(message)
                {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Self::Timeout(_) => ErrorClass::Transient,
            Self::Provider(message) => {
                if TRANSIENT_MESSAGE_RE.is_match(message) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Self::BudgetExceeded { .. } => ErrorClass::Budget,
            Self::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            Self::CapacityExceeded { .. } | Self::Config(_) => ErrorClass::Configuration,
            Self::Cancelled(_) => ErrorClass::Cancelled,
        }
    }

    /// Default retry classifier.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Server-specified wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short code for structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Http { .. } => "http",
            Self::Timeout(_) => "timeout",
            Self::Provider(_) => "provider",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Config(_) => "config",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Invalid configuration, raised synchronously at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration for {field}: {reason}")]
pub struct ConfigError {
    pub field: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
