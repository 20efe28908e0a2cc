//! Resolved coordination configuration.
//!
//! One immutable struct handed to constructors. Every section has defaults,
//! so a partial TOML document is enough:
//!
//! ```toml
//! [retry]
//! max_retries = 2
//!
//! [decision]
//! major = 5
//! ```

use serde::{Deserialize, Serialize};

use crate::orchestrator::OrchestratorConfig;
use crate::output::OutputConfig;
use crate::resilience::budget::BudgetConfig;
use crate::resilience::circuit_breaker::BreakerConfig;
use crate::resilience::error::ConfigError;
use crate::resilience::rate_limiter::RateLimitConfig;
use crate::resilience::retry::RetryConfig;
use crate::synthesis::decision::DecisionThresholds;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub budget: BudgetConfig,
    pub decision: DecisionThresholds,
    pub orchestrator: OrchestratorConfig,
    pub output: OutputConfig,
}

impl CoordinationConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::new("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section, reporting the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.breaker.validate()?;
        self.rate_limit.validate()?;
        self.budget.validate()?;
        self.decision.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }
}
