//! Review Coordination Library
//!
//! Coordinates a multi-task code review: concurrent analysis tasks behind a
//! shared, rate-limited and budgeted external dependency, merged into one
//! deduplicated, conflict-aware verdict by explicit rules, with the whole
//! review tracked by a persisted, resumable phase machine.
//!
//! # Components
//!
//! ## Resilience ([`resilience`])
//! - [`RetryPolicy`]: exponential backoff with jitter and retry-after hints
//! - [`CircuitBreaker`]: sliding-window failure-rate breaker
//! - [`RateLimiter`]: token buckets for requests, input units, output units
//! - [`BudgetTracker`]: per-review unit budget with per-task attribution
//! - [`ResilientCaller`]: all four composed around an [`AnalysisClient`]
//!
//! ## Review ([`review`], [`orchestrator`], [`synthesis`], [`output`])
//! - [`Orchestrator`]: fan out tasks, isolate failures, optional consolidation
//! - [`FindingAggregator`]: dedup, escalation, conflict detection
//! - [`DecisionMatrix`]: first-match threshold rules
//! - [`ReviewState`]: phase machine with append-only checkpoints
//! - [`StatePersistence`]: in-memory, JSON file, and (with `heavy-state`) RocksDB
//!
//! ## Pipeline ([`pipeline`])
//! - [`ReviewPipeline`]: drives a review end to end and resumes it
//!
//! # Usage
//!
//! ```rust,ignore
//! let pipeline = ReviewPipeline::new(config, client, provider, poster, store)?;
//! let state = pipeline.run(ReviewKey::new("github", "acme/app", "42")).await?;
//! println!("{:?}", state.synthesis.map(|s| s.decision));
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod analysis;
pub mod config;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod resilience;
pub mod review;
pub mod synthesis;

pub use analysis::{AnalysisClient, CompletionRequest, CompletionResponse, TaskKind, Usage};
pub use config::CoordinationConfig;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
pub use output::{build_output, InlineComment, OutputConfig, ReviewOutput, ReviewPoster};
pub use pipeline::{ContextProvider, ReviewError, ReviewPipeline, ReviewResult};
pub use resilience::{
    BudgetConfig, BudgetTracker, BreakerConfig, CallError, CircuitBreaker, CircuitState,
    ConfigError, RateLimitConfig, RateLimiter, ResilientCaller, RetryConfig, RetryObserver,
    RetryPolicy,
};
pub use review::{
    Conflict, DiffFile, DiffStats, Finding, FindingSet, InMemoryStatePersistence,
    JsonFileStatePersistence, PersistenceError, ReviewContext, ReviewKey, ReviewPhase,
    ReviewState, Severity, StatePersistence, TaskOutcome, TransitionError,
};
pub use synthesis::{
    Decision, DecisionKind, DecisionMatrix, DecisionThresholds, FindingAggregator, SynthesisResult,
};

#[cfg(feature = "heavy-state")]
pub use review::RocksDbStatePersistence;
