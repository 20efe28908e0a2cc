//! Review state machine: phases, transitions, and the review aggregate.
//!
//! ```text
//! initializing → context_gathering → review → parallel_analysis
//!              → synthesis → output → completed
//!   (any non-terminal) → failed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use super::finding::Finding;
use crate::analysis::TaskKind;
use crate::output::ReviewOutput;
use crate::synthesis::SynthesisResult;

/// Phase of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPhase {
    Initializing,
    ContextGathering,
    Review,
    ParallelAnalysis,
    Synthesis,
    Output,
    Completed,
    Failed,
}

impl ReviewPhase {
    pub const ALL: [ReviewPhase; 8] = [
        Self::Initializing,
        Self::ContextGathering,
        Self::Review,
        Self::ParallelAnalysis,
        Self::Synthesis,
        Self::Output,
        Self::Completed,
        Self::Failed,
    ];

    /// Position in the happy path; `Failed` sorts last.
    fn ordinal(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::ContextGathering => 1,
            Self::Review => 2,
            Self::ParallelAnalysis => 3,
            Self::Synthesis => 4,
            Self::Output => 5,
            Self::Completed => 6,
            Self::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Next phase on the happy path.
    pub fn next(self) -> Option<ReviewPhase> {
        match self {
            Self::Initializing => Some(Self::ContextGathering),
            Self::ContextGathering => Some(Self::Review),
            Self::Review => Some(Self::ParallelAnalysis),
            Self::ParallelAnalysis => Some(Self::Synthesis),
            Self::Synthesis => Some(Self::Output),
            Self::Output => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Transitions are forward-only, or to `Failed` from any non-terminal phase.
    pub fn can_transition_to(self, to: ReviewPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || to.ordinal() > self.ordinal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::ContextGathering => "context_gathering",
            Self::Review => "review",
            Self::ParallelAnalysis => "parallel_analysis",
            Self::Synthesis => "synthesis",
            Self::Output => "output",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReviewPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewPhase {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| TransitionError::UnknownPhase(s.to_string()))
    }
}

/// Rejected phase change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown review phase '{0}'")]
    UnknownPhase(String),

    #[error("invalid transition {from} → {to}")]
    Invalid { from: ReviewPhase, to: ReviewPhase },

    #[error("review is already {0}; no further transitions allowed")]
    Terminal(ReviewPhase),
}

/// Identity of a review: one change on one repository of one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReviewKey {
    pub external_id: String,
    pub platform: String,
    pub repository: String,
}

impl ReviewKey {
    pub fn new(
        platform: impl Into<String>,
        repository: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            platform: platform.into(),
            repository: repository.into(),
        }
    }

    /// Filesystem- and key-safe identifier, distinct for distinct keys.
    ///
    /// Fields are joined with `__`. Inside a field every byte outside
    /// `[A-Za-z0-9.-]` (including `_` and `%`) is written as `%XX`, so the
    /// separator cannot occur within a field.
    pub fn storage_id(&self) -> String {
        [&self.platform, &self.repository, &self.external_id]
            .iter()
            .map(|field| escape_field(field))
            .collect::<Vec<_>>()
            .join("__")
    }
}

fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for byte in field.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

impl fmt::Display for ReviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.platform, self.repository, self.external_id)
    }
}

/// One changed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    pub patch: String,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u32,
    pub additions: u32,
    pub deletions: u32,
}

/// Immutable snapshot of the change under review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewContext {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub files: Vec<DiffFile>,
    pub stats: DiffStats,
}

impl ReviewContext {
    /// Context from a file list, deriving the stats.
    pub fn from_files(files: Vec<DiffFile>) -> Self {
        let stats = DiffStats {
            files_changed: files.len() as u32,
            additions: files.iter().map(|f| f.additions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
        };
        Self {
            title: None,
            description: None,
            files,
            stats,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Append-only transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub from: ReviewPhase,
    pub to: ReviewPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Append-only error log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub phase: ReviewPhase,
    #[serde(default)]
    pub task: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Statistics of a consolidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    pub original_count: usize,
    pub consolidated_count: usize,
    pub duplicates_removed: usize,
    /// Consolidation failed and the flattened union was kept.
    pub fallback: bool,
}

/// Raw findings of one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSet {
    /// Per-category lists as reported by each task.
    Categorized(BTreeMap<String, Vec<Finding>>),
    /// One flat list after a consolidation pass.
    Consolidated {
        findings: Vec<Finding>,
        stats: ConsolidationStats,
    },
}

impl Default for FindingSet {
    fn default() -> Self {
        Self::Categorized(BTreeMap::new())
    }
}

impl FindingSet {
    pub fn len(&self) -> usize {
        match self {
            Self::Categorized(map) => map.values().map(Vec::len).sum(),
            Self::Consolidated { findings, .. } => findings.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattened union in category order.
    pub fn flatten(&self) -> Vec<Finding> {
        match self {
            Self::Categorized(map) => map.values().flatten().cloned().collect(),
            Self::Consolidated { findings, .. } => findings.clone(),
        }
    }

    /// Findings grouped by category. Consolidated findings are regrouped by
    /// their own category; untagged ones land under `"general"`.
    pub fn by_category(&self) -> BTreeMap<String, Vec<Finding>> {
        match self {
            Self::Categorized(map) => map.clone(),
            Self::Consolidated { findings, .. } => {
                let mut map: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
                for f in findings {
                    let category = if f.category.is_empty() {
                        "general".to_string()
                    } else {
                        f.category.clone()
                    };
                    map.entry(category).or_default().push(f.clone());
                }
                map
            }
        }
    }
}

/// Aggregate root for one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    /// Random id for log correlation across resumes.
    pub run_id: String,
    pub key: ReviewKey,
    pub phase: ReviewPhase,
    #[serde(default)]
    pub context: Option<ReviewContext>,
    #[serde(default)]
    pub planned_tasks: Vec<TaskKind>,
    #[serde(default)]
    pub findings: FindingSet,
    /// Task metrics per category.
    #[serde(default)]
    pub metrics: BTreeMap<String, Map<String, Value>>,
    #[serde(default)]
    pub synthesis: Option<SynthesisResult>,
    #[serde(default)]
    pub output: Option<ReviewOutput>,
    pub checkpoints: Vec<Checkpoint>,
    pub errors: Vec<ErrorEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewState {
    pub fn new(key: ReviewKey) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            key,
            phase: ReviewPhase::Initializing,
            context: None,
            planned_tasks: Vec::new(),
            findings: FindingSet::default(),
            metrics: BTreeMap::new(),
            synthesis: None,
            output: None,
            checkpoints: Vec::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Move to `to`, appending a checkpoint. On error nothing changes.
    pub fn transition_to(&mut self, to: ReviewPhase, reason: &str) -> Result<(), TransitionError> {
        let from = self.phase;
        if from.is_terminal() {
            return Err(TransitionError::Terminal(from));
        }
        if !from.can_transition_to(to) {
            return Err(TransitionError::Invalid { from, to });
        }
        let now = Utc::now();
        self.checkpoints.push(Checkpoint {
            from,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        self.phase = to;
        self.updated_at = now;
        info!(review = %self.key, run_id = %self.run_id, from = %from, to = %to, "Review phase transition");
        Ok(())
    }

    /// Transition by phase name; unknown names are rejected before any change.
    pub fn transition_to_named(&mut self, to: &str, reason: &str) -> Result<(), TransitionError> {
        let phase: ReviewPhase = to.parse()?;
        self.transition_to(phase, reason)
    }

    /// Record an error against `phase`.
    pub fn record_error(&mut self, phase: ReviewPhase, task: Option<&str>, error: impl Into<String>) {
        let error = error.into();
        warn!(review = %self.key, phase = %phase, task = task.unwrap_or("-"), error = %error, "Review error recorded");
        self.errors.push(ErrorEntry {
            phase,
            task: task.map(str::to_string),
            error,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Record the error and move to `Failed`. A terminal review keeps its phase.
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        let phase = self.phase;
        self.record_error(phase, None, error.clone());
        if let Err(e) = self.transition_to(ReviewPhase::Failed, &error) {
            warn!(review = %self.key, error = %e, "Could not mark review failed");
        }
    }

    /// Drop analysis results ahead of a full re-dispatch.
    pub fn clear_analysis(&mut self) {
        self.findings = FindingSet::default();
        self.metrics.clear();
        self.synthesis = None;
        self.output = None;
    }

    /// Errors recorded for task failures.
    pub fn task_errors(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.errors.iter().filter(|e| e.task.is_some())
    }

    /// Check the structural invariants of a (possibly loaded) state.
    pub fn validate(&self) -> Result<(), String> {
        let expected = self
            .checkpoints
            .last()
            .map(|c| c.to)
            .unwrap_or(ReviewPhase::Initializing);
        if self.phase != expected {
            return Err(format!(
                "phase {} does not match last checkpoint target {}",
                self.phase, expected
            ));
        }
        let mut current = ReviewPhase::Initializing;
        for (i, cp) in self.checkpoints.iter().enumerate() {
            if cp.from != current {
                return Err(format!(
                    "checkpoint {i} starts at {} but review was at {current}",
                    cp.from
                ));
            }
            if !cp.from.can_transition_to(cp.to) {
                return Err(format!("checkpoint {i} records illegal {} → {}", cp.from, cp.to));
            }
            current = cp.to;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::finding::Severity;

    fn key() -> ReviewKey {
        ReviewKey::new("github", "acme/widgets", "42")
    }

    #[test]
    fn test_new_review_is_initializing() {
        let state = ReviewState::new(key());
        assert_eq!(state.phase, ReviewPhase::Initializing);
        assert!(state.checkpoints.is_empty());
        assert!(state.validate().is_ok());
        assert!(!state.run_id.is_empty());
    }

    #[test]
    fn test_happy_path_appends_checkpoints() {
        let mut state = ReviewState::new(key());
        let mut phase = ReviewPhase::Initializing;
        while let Some(next) = phase.next() {
            state.transition_to(next, "advance").unwrap();
            phase = next;
        }
        assert_eq!(state.phase, ReviewPhase::Completed);
        assert_eq!(state.checkpoints.len(), 6);
        assert_eq!(state.checkpoints.last().unwrap().to, state.phase);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut state = ReviewState::new(key());
        state.transition_to(ReviewPhase::ContextGathering, "").unwrap();
        state.transition_to(ReviewPhase::Review, "").unwrap();
        let err = state
            .transition_to(ReviewPhase::ContextGathering, "")
            .unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));
        assert_eq!(state.phase, ReviewPhase::Review);
        assert_eq!(state.checkpoints.len(), 2);
    }

    #[test]
    fn test_unknown_phase_name_rejected() {
        let mut state = ReviewState::new(key());
        let err = state.transition_to_named("deploying", "").unwrap_err();
        assert_eq!(err, TransitionError::UnknownPhase("deploying".into()));
        assert!(state.checkpoints.is_empty());

        state.transition_to_named("context_gathering", "").unwrap();
        assert_eq!(state.phase, ReviewPhase::ContextGathering);
    }

    #[test]
    fn test_terminal_rejects_everything() {
        let mut state = ReviewState::new(key());
        state.fail("boom");
        assert_eq!(state.phase, ReviewPhase::Failed);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].phase, ReviewPhase::Initializing);
        assert_eq!(
            state.transition_to(ReviewPhase::Review, ""),
            Err(TransitionError::Terminal(ReviewPhase::Failed))
        );
        assert_eq!(
            state.transition_to(ReviewPhase::Failed, ""),
            Err(TransitionError::Terminal(ReviewPhase::Failed))
        );
    }

    #[test]
    fn test_validate_detects_phase_mismatch() {
        let mut state = ReviewState::new(key());
        state.transition_to(ReviewPhase::ContextGathering, "").unwrap();
        state.phase = ReviewPhase::Synthesis;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_finding_set_regroups_consolidated() {
        let set = FindingSet::Consolidated {
            findings: vec![
                Finding::new("a.rs", Some(1), Severity::Major, "security", "x"),
                Finding::new("b.rs", None, Severity::Minor, "", "y"),
            ],
            stats: ConsolidationStats {
                original_count: 3,
                consolidated_count: 2,
                duplicates_removed: 1,
                fallback: false,
            },
        };
        let grouped = set.by_category();
        assert_eq!(grouped["security"].len(), 1);
        assert_eq!(grouped["general"].len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_storage_id_is_path_safe() {
        let id = key().storage_id();
        assert_eq!(id, "github__acme%2Fwidgets__42");
        assert_eq!(key().to_string(), "github:acme/widgets#42");
    }

    #[test]
    fn test_storage_id_distinguishes_lookalike_keys() {
        let keys = [
            ReviewKey::new("github", "acme/widgets", "42"),
            ReviewKey::new("github", "acme_widgets", "42"),
            ReviewKey::new("github", "acme%2Fwidgets", "42"),
            ReviewKey::new("github__acme", "widgets", "42"),
            ReviewKey::new("github", "acme__widgets", "42"),
            ReviewKey::new("github", "acme", "widgets__42"),
        ];
        let ids: std::collections::HashSet<String> = keys.iter().map(ReviewKey::storage_id).collect();
        assert_eq!(ids.len(), keys.len());
        for id in &ids {
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '%')));
        }
    }
}
