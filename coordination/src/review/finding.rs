//! Findings, conflicts, and per-task outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of a finding. Ordering is by rank: `Critical < Major < Minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    /// Sort rank, lowest first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::Major => 1,
            Self::Minor => 2,
        }
    }

    /// Map free-form severity labels onto the three levels. Unknown labels
    /// are treated as minor.
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Self::Critical,
            "major" | "high" | "medium" | "error" => Self::Major,
            _ => Self::Minor,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
        }
    }
}

/// One observation about the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub severity: Severity,
    /// Empty until tagged by the producing task or the aggregator.
    #[serde(default)]
    pub category: String,
    pub message: String,
    /// Tasks that reported this finding.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Set once when aggregation raised the severity.
    #[serde(default)]
    pub escalated: bool,
}

/// Dedup identity of a finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FindingKey {
    pub file: String,
    pub line: Option<u32>,
    pub category: String,
}

impl Finding {
    pub fn new(
        file: impl Into<String>,
        line: Option<u32>,
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            severity,
            category: category.into(),
            message: message.into(),
            sources: Vec::new(),
            confidence: None,
            suggestion: None,
            escalated: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.add_source(source.into());
        self
    }

    /// Append `source` unless already present.
    pub fn add_source(&mut self, source: String) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    pub fn key(&self) -> FindingKey {
        FindingKey {
            file: self.file.clone(),
            line: self.line,
            category: self.category.clone(),
        }
    }

    /// `file:line`, or just `file` when the finding has no line.
    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.file, line),
            None => self.file.clone(),
        }
    }
}

/// One participant in a severity disagreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub source: String,
    pub severity: Severity,
    pub category: String,
}

/// Findings at the same location that disagree on severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub location: String,
    /// Distinct severities, most severe first.
    pub severities: Vec<Severity>,
    pub findings: Vec<ConflictEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Fulfilled,
    Rejected,
}

/// Result of one dispatched task in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: String,
    pub status: OutcomeStatus,
    pub findings: Vec<Finding>,
    pub metrics: Map<String, Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn fulfilled(task: impl Into<String>, findings: Vec<Finding>, metrics: Map<String, Value>) -> Self {
        Self {
            task: task.into(),
            status: OutcomeStatus::Fulfilled,
            findings,
            metrics,
            error: None,
        }
    }

    pub fn rejected(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            status: OutcomeStatus::Rejected,
            findings: Vec::new(),
            metrics: Map::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status == OutcomeStatus::Fulfilled
    }
}
