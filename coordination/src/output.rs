//! Rendering a synthesis into postable review output.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resilience::error::CallError;
use crate::review::finding::Severity;
use crate::review::state::ReviewKey;
use crate::synthesis::{DecisionKind, SynthesisResult};

/// Output rendering options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Inline comments beyond this are folded into the summary count.
    pub max_inline_comments: usize,
    /// Least severe finding that still gets an inline comment.
    pub min_comment_severity: Severity,
    /// List severity conflicts in the summary.
    pub include_conflicts: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_inline_comments: 50,
            min_comment_severity: Severity::Minor,
            include_conflicts: true,
        }
    }
}

/// One inline comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineComment {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

/// What gets handed to the poster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub summary: String,
    pub comments: Vec<InlineComment>,
    pub decision: DecisionKind,
    /// Whether the poster accepted this output.
    #[serde(default)]
    pub posted: bool,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

/// Publishes review output. Implementations must upsert: posting the same
/// review twice replaces the earlier output.
#[async_trait]
pub trait ReviewPoster: Send + Sync {
    async fn post(&self, key: &ReviewKey, output: &ReviewOutput) -> Result<(), CallError>;
}

fn comment_body(finding: &crate::review::finding::Finding) -> String {
    let mut body = format!("**{}** [{}] {}", finding.severity, finding.category, finding.message);
    if let Some(suggestion) = &finding.suggestion {
        let _ = write!(body, "\n\nSuggestion: {suggestion}");
    }
    if finding.sources.len() > 1 {
        let _ = write!(body, "\n\n_Reported by: {}_", finding.sources.join(", "));
    }
    if finding.escalated {
        body.push_str("\n\n_Escalated: reported independently by several reviewers._");
    }
    body
}

/// Build postable output from a synthesis. `task_failures` is the number of
/// analysis tasks that did not produce a result.
pub fn build_output(
    synthesis: &SynthesisResult,
    task_failures: usize,
    config: &OutputConfig,
) -> ReviewOutput {
    let decision = &synthesis.decision;
    let eligible: Vec<_> = synthesis
        .merged
        .iter()
        .filter(|f| f.severity <= config.min_comment_severity)
        .collect();
    let comments: Vec<InlineComment> = eligible
        .iter()
        .take(config.max_inline_comments)
        .map(|f| InlineComment {
            file: f.file.clone(),
            line: f.line,
            severity: f.severity,
            message: comment_body(f),
        })
        .collect();

    let mut summary = String::new();
    let _ = writeln!(summary, "## Review decision: `{}`\n", decision.decision);
    let _ = writeln!(summary, "{}\n", decision.rationale);
    let _ = writeln!(summary, "| Severity | Count |");
    let _ = writeln!(summary, "|----------|-------|");
    let _ = writeln!(summary, "| critical | {} |", decision.critical_count);
    let _ = writeln!(summary, "| major    | {} |", decision.major_count);
    let _ = writeln!(summary, "| minor    | {} |", decision.minor_count);
    let _ = writeln!(summary, "\nCoverage delta: {:.1}", decision.coverage_delta);

    if synthesis.stats.duplicates_removed > 0 || synthesis.stats.escalated_count > 0 {
        let _ = writeln!(
            summary,
            "\n{} duplicate finding(s) merged, {} escalated.",
            synthesis.stats.duplicates_removed, synthesis.stats.escalated_count
        );
    }
    if config.include_conflicts && !synthesis.conflicts.is_empty() {
        let _ = writeln!(summary, "\n### Severity conflicts\n");
        for conflict in &synthesis.conflicts {
            let severities: Vec<String> =
                conflict.severities.iter().map(ToString::to_string).collect();
            let _ = writeln!(summary, "- `{}`: {}", conflict.location, severities.join(" vs "));
        }
    }
    let folded = eligible.len().saturating_sub(comments.len());
    if folded > 0 {
        let _ = writeln!(summary, "\n{folded} more finding(s) not shown inline.");
    }
    if task_failures > 0 {
        let _ = writeln!(
            summary,
            "\n> {task_failures} analysis task(s) failed; this review may be incomplete."
        );
    }

    ReviewOutput {
        summary,
        comments,
        decision: decision.decision,
        posted: false,
        posted_at: None,
    }
}
