//! The composed call path to the analysis dependency.
//!
//! ```text
//! BudgetTracker::track_call
//!   └─ RetryPolicy::execute
//!        └─ CircuitBreaker::execute
//!             └─ RateLimiter::acquire (requests, input, output)
//!                  └─ AnalysisClient::complete
//! ```
//!
//! The breaker and limiter guard a process-wide resource and are shared
//! between reviews; the budget is per review and swapped in with
//! [`ResilientCaller::with_budget`].

use std::sync::Arc;

use tracing::debug;

use super::budget::{BudgetConfig, BudgetTracker, CharCountEstimator, UnitEstimator};
use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use super::error::{CallError, ConfigError};
use super::rate_limiter::RateLimiter;
use super::retry::{RetryPolicy, TracingRetryObserver};
use crate::analysis::{AnalysisClient, CompletionRequest, CompletionResponse};
use crate::config::CoordinationConfig;

/// Analysis client wrapped in budget, retry, breaker and rate limiting.
#[derive(Clone)]
pub struct ResilientCaller {
    client: Arc<dyn AnalysisClient>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    budget: Arc<BudgetTracker>,
    budget_config: BudgetConfig,
    estimator: Arc<dyn UnitEstimator>,
}

impl ResilientCaller {
    /// Build every layer from configuration.
    pub fn from_config(
        client: Arc<dyn AnalysisClient>,
        config: &CoordinationConfig,
    ) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::new(&config.retry)?
            .with_observer(Arc::new(TracingRetryObserver::new(client.name().to_string())));
        let breaker = Arc::new(CircuitBreaker::new(client.name(), config.breaker.clone())?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit)?);
        let budget = Arc::new(BudgetTracker::new(config.budget.clone())?);
        Ok(Self {
            client,
            retry,
            breaker,
            limiter,
            budget,
            budget_config: config.budget.clone(),
            estimator: Arc::new(CharCountEstimator::default()),
        })
    }

    /// Same client and shared guards, new budget.
    pub fn with_budget(&self, budget: Arc<BudgetTracker>) -> Self {
        Self {
            budget,
            ..self.clone()
        }
    }

    /// Same client and shared guards, fresh budget from the original config.
    pub fn with_fresh_budget(&self) -> Result<Self, ConfigError> {
        let budget = BudgetTracker::new(self.budget_config.clone())?;
        Ok(self.with_budget(Arc::new(budget)))
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn UnitEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Estimated input units for a request.
    pub fn estimate_input(&self, request: &CompletionRequest) -> f64 {
        (self.estimator.estimate(&request.system_context)
            + self.estimator.estimate(&request.user_prompt)) as f64
    }

    /// Send `request` through the full stack.
    pub async fn call(&self, request: &CompletionRequest) -> Result<CompletionResponse, CallError> {
        let input_units = self.estimate_input(request);
        let output_units = f64::from(request.max_output_units);
        // Impossible requests are configuration errors; keep them out of the
        // breaker window.
        self.limiter.check_capacity(input_units, output_units)?;

        debug!(
            task = %request.task,
            input_units,
            output_units,
            "Dispatching analysis call"
        );

        self.budget
            .track_call(&request.task, input_units + output_units, move || {
                self.retry.execute(move || {
                    self.breaker.execute(move || async move {
                        self.limiter.acquire(input_units, output_units).await?;
                        self.client.complete(request).await
                    })
                })
            })
            .await
    }
}
