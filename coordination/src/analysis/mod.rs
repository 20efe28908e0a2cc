//! Analysis task invocation boundary.
//!
//! The orchestrator never talks to a model directly; it hands a
//! [`CompletionRequest`] to an [`AnalysisClient`] through the resilience
//! stack and parses whatever text comes back with [`parse`].

pub mod parse;
pub mod prompts;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resilience::budget::UsageReport;
use crate::resilience::error::CallError;

/// The built-in analysis concerns. Each task reports under its own category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Tests,
    Security,
    Performance,
    Design,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Tests,
        TaskKind::Security,
        TaskKind::Performance,
        TaskKind::Design,
    ];

    /// Task name used in logs, budgets, and finding sources.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tests => "tests",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Design => "design",
        }
    }

    /// Category findings from this task are filed under.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Tests => "testing",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Design => "design",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tests" | "testing" => Ok(Self::Tests),
            "security" => Ok(Self::Security),
            "performance" | "perf" => Ok(Self::Performance),
            "design" | "architecture" => Ok(Self::Design),
            other => Err(format!("unknown analysis task '{other}'")),
        }
    }
}

/// One request to the analysis dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Task name, for attribution.
    pub task: String,
    pub system_context: String,
    pub user_prompt: String,
    pub max_output_units: u32,
}

/// Units reported by the dependency for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: u64,
    pub output_units: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_units + self.output_units
    }
}

/// Raw response text plus optional usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, input_units: u64, output_units: u64) -> Self {
        self.usage = Some(Usage {
            input_units,
            output_units,
        });
        self
    }
}

impl UsageReport for CompletionResponse {
    fn consumed_units(&self) -> Option<f64> {
        self.usage.map(|u| u.total() as f64)
    }
}

/// The shared, rate-limited external analysis dependency.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CallError>;

    /// Client name for logs.
    fn name(&self) -> &str {
        "analysis"
    }
}
