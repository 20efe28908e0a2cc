//! Parallel analysis orchestrator.
//!
//! Fans one request per task out through the [`ResilientCaller`], waits for
//! all of them, and writes the results back into the review by task index.
//! A failed or timed-out task is logged against the current phase and never
//! stops the others. The review always advances to `synthesis`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::parse::{parse_consolidation, parse_task_output};
use crate::analysis::prompts::{build_consolidation_request, build_task_request, CONSOLIDATION_TASK};
use crate::analysis::{CompletionRequest, CompletionResponse, TaskKind};
use crate::resilience::caller::ResilientCaller;
use crate::resilience::error::{CallError, ConfigError};
use crate::review::finding::{Finding, TaskOutcome};
use crate::review::state::{ConsolidationStats, FindingSet, ReviewPhase, ReviewState, TransitionError};

/// Error type for orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("review {0} has no gathered context")]
    MissingContext(String),

    #[error("no analysis tasks requested")]
    NoTasks,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tasks dispatched for every review.
    pub tasks: Vec<TaskKind>,
    /// Upper bound for one task, including retries and rate-limit waits.
    pub task_timeout_ms: u64,
    /// Output units requested per task.
    pub max_output_units: u32,
    /// Patch characters included in each prompt.
    pub max_patch_chars: usize,
    /// Run a consolidation call over all raw findings.
    pub consolidate: bool,
    pub consolidation_max_output_units: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tasks: TaskKind::ALL.to_vec(),
            task_timeout_ms: 180_000,
            max_output_units: 2_048,
            max_patch_chars: 60_000,
            consolidate: false,
            consolidation_max_output_units: 4_096,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::new("orchestrator.tasks", "at least one task is required"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.tasks.iter().find(|t| !seen.insert(**t)) {
            return Err(ConfigError::new(
                "orchestrator.tasks",
                format!("task '{dup}' listed more than once"),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::new("orchestrator.task_timeout_ms", "must be > 0"));
        }
        if self.max_output_units == 0 {
            return Err(ConfigError::new("orchestrator.max_output_units", "must be > 0"));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Dispatches analysis tasks for a review.
#[derive(Clone)]
pub struct Orchestrator {
    caller: Arc<ResilientCaller>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(caller: Arc<ResilientCaller>, config: OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { caller, config })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn caller(&self) -> &Arc<ResilientCaller> {
        &self.caller
    }

    /// One call, bounded by the task timeout. A timeout drops the call and
    /// is reported like any other failure.
    async fn call_with_timeout(&self, request: &CompletionRequest) -> Result<CompletionResponse, CallError> {
        let limit = self.config.task_timeout();
        match tokio::time::timeout(limit, self.caller.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(limit)),
        }
    }

    /// Run every task concurrently and move the review to `synthesis`.
    ///
    /// Prior findings and metrics are cleared first, so re-running this phase
    /// is a full re-dispatch.
    pub async fn execute_parallel_analysis(
        &self,
        review: &mut ReviewState,
        tasks: &[TaskKind],
    ) -> Result<Vec<TaskOutcome>, OrchestratorError> {
        if tasks.is_empty() {
            return Err(OrchestratorError::NoTasks);
        }
        let context = review
            .context
            .clone()
            .ok_or_else(|| OrchestratorError::MissingContext(review.key.to_string()))?;
        if review.phase != ReviewPhase::ParallelAnalysis {
            review.transition_to(ReviewPhase::ParallelAnalysis, "dispatching analysis tasks")?;
        }
        review.clear_analysis();
        review.planned_tasks = tasks.to_vec();

        let requests: Vec<CompletionRequest> = tasks
            .iter()
            .map(|task| {
                build_task_request(
                    *task,
                    &context,
                    self.config.max_output_units,
                    self.config.max_patch_chars,
                )
            })
            .collect();

        info!(review = %review.key, tasks = tasks.len(), "Dispatching parallel analysis");
        let started = Instant::now();
        let results = join_all(requests.iter().map(|req| self.call_with_timeout(req))).await;

        let phase = review.phase;
        let mut by_category: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
        let mut outcomes = Vec::with_capacity(tasks.len());
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(response) => {
                    let parsed = parse_task_output(&response.text, task.name(), task.category());
                    if let Some(warning) = &parsed.warning {
                        warn!(review = %review.key, task = %task, warning = %warning, "Task output degraded");
                    }
                    debug!(review = %review.key, task = %task, findings = parsed.findings.len(), "Task fulfilled");
                    by_category
                        .entry(task.category().to_string())
                        .or_default()
                        .extend(parsed.findings.iter().cloned());
                    review
                        .metrics
                        .entry(task.category().to_string())
                        .or_default()
                        .extend(parsed.metrics.clone());
                    outcomes.push(TaskOutcome::fulfilled(task.name(), parsed.findings, parsed.metrics));
                }
                Err(e) => {
                    review.record_error(phase, Some(task.name()), e.to_string());
                    outcomes.push(TaskOutcome::rejected(task.name(), e.to_string()));
                }
            }
        }

        let fulfilled = outcomes.iter().filter(|o| o.is_fulfilled()).count();
        info!(
            review = %review.key,
            fulfilled,
            rejected = outcomes.len() - fulfilled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Parallel analysis finished"
        );

        review.findings = if self.config.consolidate {
            self.consolidate(review, by_category).await
        } else {
            FindingSet::Categorized(by_category)
        };

        review.transition_to(
            ReviewPhase::Synthesis,
            &format!("{fulfilled}/{} analysis tasks fulfilled", outcomes.len()),
        )?;
        Ok(outcomes)
    }

    /// Replace the raw findings with one consolidated list, or keep the
    /// flattened union when consolidation fails.
    async fn consolidate(
        &self,
        review: &mut ReviewState,
        by_category: BTreeMap<String, Vec<Finding>>,
    ) -> FindingSet {
        let raw: Vec<Finding> = by_category.into_values().flatten().collect();
        let original_count = raw.len();
        if raw.is_empty() {
            return FindingSet::Consolidated {
                findings: raw,
                stats: ConsolidationStats {
                    original_count: 0,
                    consolidated_count: 0,
                    duplicates_removed: 0,
                    fallback: false,
                },
            };
        }

        let request = build_consolidation_request(&raw, self.config.consolidation_max_output_units);
        let failure = match self.call_with_timeout(&request).await {
            Ok(response) => match parse_consolidation(&response.text) {
                Some(findings) => {
                    info!(
                        review = %review.key,
                        original = original_count,
                        consolidated = findings.len(),
                        "Findings consolidated"
                    );
                    return FindingSet::Consolidated {
                        stats: ConsolidationStats {
                            original_count,
                            consolidated_count: findings.len(),
                            duplicates_removed: original_count.saturating_sub(findings.len()),
                            fallback: false,
                        },
                        findings,
                    };
                }
                None => "consolidation output had no findings list".to_string(),
            },
            Err(e) => e.to_string(),
        };

        review.record_error(review.phase, Some(CONSOLIDATION_TASK), failure);
        FindingSet::Consolidated {
            findings: raw,
            stats: ConsolidationStats {
                original_count,
                consolidated_count: original_count,
                duplicates_removed: 0,
                fallback: true,
            },
        }
    }
}
