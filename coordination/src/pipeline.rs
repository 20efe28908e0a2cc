//! Review pipeline: drives one review through every phase.
//!
//! ```text
//! initializing ─▶ context_gathering ─▶ review ─▶ parallel_analysis
//!      ─▶ synthesis ─▶ output ─▶ completed
//! ```
//!
//! The state is saved after every step, so a crashed run can be resumed from
//! the last recorded phase. Each phase is idempotent: resuming in
//! `parallel_analysis` re-dispatches every task, resuming in `output`
//! re-posts (posters upsert).
//!
//! Failed analysis tasks never fail the review. Context gathering, synthesis
//! and persistence failures do: the review is marked `failed` and a final
//! save is attempted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::analysis::AnalysisClient;
use crate::config::CoordinationConfig;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::output::{build_output, ReviewPoster};
use crate::resilience::caller::ResilientCaller;
use crate::resilience::error::{CallError, ConfigError};
use crate::resilience::retry::{RetryPolicy, TracingRetryObserver};
use crate::review::persistence::{PersistenceError, StatePersistence};
use crate::review::state::{ReviewContext, ReviewKey, ReviewPhase, ReviewState, TransitionError};
use crate::synthesis::{synthesize, DecisionMatrix, FindingAggregator};

/// Supplies the change under review.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn fetch(&self, key: &ReviewKey) -> Result<ReviewContext, CallError>;
}

/// Error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("review {0} not found")]
    NotFound(String),

    #[error("context gathering failed: {0}")]
    Context(CallError),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for pipeline operations
pub type ReviewResult<T> = Result<T, ReviewError>;

/// Coordinates context, analysis, synthesis, output and persistence.
pub struct ReviewPipeline {
    config: CoordinationConfig,
    caller: ResilientCaller,
    context_provider: Arc<dyn ContextProvider>,
    poster: Arc<dyn ReviewPoster>,
    persistence: Arc<dyn StatePersistence>,
    collaborator_retry: RetryPolicy,
    aggregator: FindingAggregator,
    matrix: DecisionMatrix,
}

impl ReviewPipeline {
    /// Validate `config` and wire every component.
    pub fn new(
        config: CoordinationConfig,
        client: Arc<dyn AnalysisClient>,
        context_provider: Arc<dyn ContextProvider>,
        poster: Arc<dyn ReviewPoster>,
        persistence: Arc<dyn StatePersistence>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let caller = ResilientCaller::from_config(client, &config)?;
        let collaborator_retry = RetryPolicy::new(&config.retry)?
            .with_observer(Arc::new(TracingRetryObserver::new("collaborator")));
        Ok(Self {
            matrix: DecisionMatrix::new(config.decision.clone()),
            aggregator: FindingAggregator::default(),
            caller,
            context_provider,
            poster,
            persistence,
            collaborator_retry,
            config,
        })
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn caller(&self) -> &ResilientCaller {
        &self.caller
    }

    /// Start a fresh review for `key`, replacing any stored state.
    pub async fn run(&self, key: ReviewKey) -> ReviewResult<ReviewState> {
        let state = ReviewState::new(key);
        info!(review = %state.key, run_id = %state.run_id, "Review started");
        self.persistence.save(&state.key, &state).await?;
        self.drive(state).await
    }

    /// Continue a stored review from its recorded phase.
    pub async fn resume(&self, key: &ReviewKey) -> ReviewResult<ReviewState> {
        let state = self
            .persistence
            .load(key)
            .await?
            .ok_or_else(|| ReviewError::NotFound(key.to_string()))?;
        info!(review = %state.key, run_id = %state.run_id, phase = %state.phase, "Review resumed");
        self.drive(state).await
    }

    /// Delete stored reviews not updated within `age`.
    pub async fn purge(&self, age: Duration) -> ReviewResult<usize> {
        let removed = self.persistence.delete_older_than(age).await?;
        info!(removed, max_age_secs = age.as_secs(), "Purged stored reviews");
        Ok(removed)
    }

    async fn drive(&self, mut state: ReviewState) -> ReviewResult<ReviewState> {
        let orchestrator = Orchestrator::new(
            Arc::new(self.caller.with_fresh_budget()?),
            self.config.orchestrator.clone(),
        )?;

        while !state.is_terminal() {
            if let Err(e) = self.step(&mut state, &orchestrator).await {
                error!(review = %state.key, phase = %state.phase, error = %e, "Review failed");
                state.fail(e.to_string());
                self.save_best_effort(&state).await;
                return Ok(state);
            }
            if let Err(e) = self.persistence.save(&state.key, &state).await {
                error!(review = %state.key, phase = %state.phase, error = %e, "Checkpoint save failed");
                state.fail(format!("persistence: {e}"));
                self.save_best_effort(&state).await;
                return Ok(state);
            }
        }

        let budget = orchestrator.caller().budget().snapshot();
        info!(
            review = %state.key,
            phase = %state.phase,
            decision = ?state.synthesis.as_ref().map(|s| s.decision.decision),
            errors = state.errors.len(),
            units_used = budget.used_units,
            "Review finished"
        );
        Ok(state)
    }

    async fn save_best_effort(&self, state: &ReviewState) {
        if let Err(e) = self.persistence.save(&state.key, state).await {
            warn!(review = %state.key, error = %e, "Could not save failed review");
        }
    }

    /// Do the work of the current phase and advance.
    async fn step(&self, state: &mut ReviewState, orchestrator: &Orchestrator) -> ReviewResult<()> {
        match state.phase {
            ReviewPhase::Initializing => {
                state.transition_to(ReviewPhase::ContextGathering, "review initialized")?;
            }
            ReviewPhase::ContextGathering => {
                let key = &state.key;
                let context = self
                    .collaborator_retry
                    .execute(move || self.context_provider.fetch(key))
                    .await
                    .map_err(ReviewError::Context)?;
                let reason = format!(
                    "{} file(s) changed (+{} -{})",
                    context.stats.files_changed, context.stats.additions, context.stats.deletions
                );
                state.context = Some(context);
                state.transition_to(ReviewPhase::Review, &reason)?;
            }
            ReviewPhase::Review => {
                state.planned_tasks = self.config.orchestrator.tasks.clone();
                let planned: Vec<&str> = state.planned_tasks.iter().map(|t| t.name()).collect();
                let reason = format!("planned tasks: {}", planned.join(", "));
                state.transition_to(ReviewPhase::ParallelAnalysis, &reason)?;
            }
            ReviewPhase::ParallelAnalysis => {
                let tasks = if state.planned_tasks.is_empty() {
                    self.config.orchestrator.tasks.clone()
                } else {
                    state.planned_tasks.clone()
                };
                orchestrator.execute_parallel_analysis(state, &tasks).await?;
            }
            ReviewPhase::Synthesis => {
                if state.context.is_none() {
                    return Err(ReviewError::Synthesis("review has no context".into()));
                }
                let result = synthesize(&self.aggregator, &self.matrix, &state.findings, &state.metrics);
                let reason = format!(
                    "{}: {}",
                    result.decision.decision, result.decision.rationale
                );
                if !result.conflicts.is_empty() {
                    warn!(review = %state.key, conflicts = result.conflicts.len(), "Severity conflicts between tasks");
                }
                state.synthesis = Some(result);
                state.transition_to(ReviewPhase::Output, &reason)?;
            }
            ReviewPhase::Output => {
                let synthesis = state
                    .synthesis
                    .as_ref()
                    .ok_or_else(|| ReviewError::Synthesis("no synthesis result to output".into()))?;
                let failures = state
                    .task_errors()
                    .filter(|e| e.phase == ReviewPhase::ParallelAnalysis)
                    .count();
                let mut output = build_output(synthesis, failures, &self.config.output);
                let posted = {
                    let key = &state.key;
                    let output = &output;
                    self.collaborator_retry
                        .execute(move || self.poster.post(key, output))
                        .await
                };
                let reason = match posted {
                    Ok(()) => {
                        output.posted = true;
                        output.posted_at = Some(Utc::now());
                        format!("posted {} comment(s)", output.comments.len())
                    }
                    Err(e) => {
                        state.record_error(ReviewPhase::Output, Some("poster"), e.to_string());
                        "posting failed; output kept unposted".to_string()
                    }
                };
                state.output = Some(output);
                state.transition_to(ReviewPhase::Completed, &reason)?;
            }
            ReviewPhase::Completed | ReviewPhase::Failed => {}
        }
        Ok(())
    }
}
