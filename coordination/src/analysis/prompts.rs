//! Request payloads for each analysis task and for consolidation.

use std::fmt::Write as _;

use super::{CompletionRequest, TaskKind};
use crate::review::finding::Finding;
use crate::review::state::ReviewContext;

/// Task name used for consolidation calls in budgets and logs.
pub const CONSOLIDATION_TASK: &str = "consolidation";

const RESPONSE_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{
  "findings": [
    {"file": "path/to/file", "line": 42, "severity": "critical|major|minor",
     "category": "<category>", "message": "what is wrong", "suggestion": "how to fix",
     "confidence": 0.0-1.0}
  ],
  "metrics": {}
}
Report only issues introduced or exposed by this change. Use an empty findings
array when there is nothing to report."#;

/// What each task looks for.
pub fn focus_areas(task: TaskKind) -> &'static [&'static str] {
    match task {
        TaskKind::Tests => &[
            "changed behaviour without corresponding tests",
            "missing edge-case and error-path coverage",
            "brittle or non-deterministic tests",
            "estimated coverage change, reported as metrics.coverage_delta (percentage points)",
        ],
        TaskKind::Security => &[
            "injection (SQL, command, path traversal)",
            "authentication and authorization gaps",
            "secrets or credentials in code",
            "unsafe deserialization and unchecked input",
        ],
        TaskKind::Performance => &[
            "algorithmic complexity regressions",
            "unbounded allocations or N+1 queries",
            "blocking calls on async paths",
            "missing caching or batching on hot paths",
        ],
        TaskKind::Design => &[
            "separation of concerns and module boundaries",
            "error handling consistency",
            "public API clarity and naming",
            "duplication that should be shared",
        ],
    }
}

/// System context for `task`.
pub fn system_context(task: TaskKind) -> String {
    let mut out = format!(
        "You are a {} reviewer. Category for your findings: \"{}\".\nFocus on:\n",
        task.name(),
        task.category()
    );
    for area in focus_areas(task) {
        let _ = writeln!(out, "- {area}");
    }
    out.push('\n');
    out.push_str(RESPONSE_FORMAT);
    out
}

/// Render the change as one prompt body, truncating patches past
/// `max_patch_chars` in total.
pub fn render_diff(context: &ReviewContext, max_patch_chars: usize) -> String {
    let mut out = String::new();
    if let Some(title) = &context.title {
        let _ = writeln!(out, "Title: {title}");
    }
    if let Some(description) = &context.description {
        let _ = writeln!(out, "Description:\n{description}");
    }
    let _ = writeln!(
        out,
        "Files changed: {} (+{} -{})\n",
        context.stats.files_changed, context.stats.additions, context.stats.deletions
    );

    let mut budget = max_patch_chars;
    for file in &context.files {
        let _ = writeln!(out, "### {} (+{} -{})", file.path, file.additions, file.deletions);
        if budget == 0 {
            out.push_str("[patch omitted]\n\n");
            continue;
        }
        let patch: String = file.patch.chars().take(budget).collect();
        budget = budget.saturating_sub(patch.chars().count());
        out.push_str("```diff\n");
        out.push_str(&patch);
        if patch.len() < file.patch.len() {
            out.push_str("\n[truncated]");
        }
        out.push_str("\n```\n\n");
    }
    out
}

/// Request for one analysis task.
pub fn build_task_request(
    task: TaskKind,
    context: &ReviewContext,
    max_output_units: u32,
    max_patch_chars: usize,
) -> CompletionRequest {
    CompletionRequest {
        task: task.name().to_string(),
        system_context: system_context(task),
        user_prompt: format!(
            "Review the following change.\n\n{}",
            render_diff(context, max_patch_chars)
        ),
        max_output_units,
    }
}

/// Request asking for one deduplicated list over all raw findings.
pub fn build_consolidation_request(findings: &[Finding], max_output_units: u32) -> CompletionRequest {
    let listing = serde_json::to_string_pretty(findings).unwrap_or_else(|_| "[]".to_string());
    CompletionRequest {
        task: CONSOLIDATION_TASK.to_string(),
        system_context: format!(
            "You consolidate code review findings from several reviewers.\n\
             Merge findings that describe the same problem at the same location, \
             keeping the most specific message and the union of their sources. \
             Never invent new findings and never drop distinct ones.\n\n{RESPONSE_FORMAT}"
        ),
        user_prompt: format!("Findings to consolidate:\n```json\n{listing}\n```"),
        max_output_units,
    }
}
