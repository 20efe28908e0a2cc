//! Parse-or-empty handling of analysis responses.
//!
//! Responses may be raw JSON, JSON in a fenced block, or JSON buried in
//! prose. The first well-formed object or array wins. Anything unusable
//! degrades to an empty result plus a warning; it is never an error.

use serde_json::{Map, Value};

use crate::review::finding::{Finding, Severity};

/// Findings and metrics recovered from one task response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub findings: Vec<Finding>,
    pub metrics: Map<String, Value>,
    /// Set when the response was unusable or partially malformed.
    pub warning: Option<String>,
}

fn parse_block(block: &str) -> Option<Value> {
    serde_json::from_str::<Value>(block.trim())
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Contents of the first fenced block, with an optional language tag removed.
fn fenced_block<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = text.find(marker)?;
    let after = &text[start + marker.len()..];
    let end = after.find("```")?;
    let body = &after[..end];
    // Drop a language tag on the opening line (```rust, ```JSON ...).
    match body.find('\n') {
        Some(nl) if !body[..nl].trim_start().starts_with(['{', '[']) => Some(&body[nl + 1..]),
        _ => Some(body),
    }
}

/// First well-formed JSON object or array in `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(value) = fenced_block(text, "```json").and_then(parse_block) {
        return Some(value);
    }
    if let Some(value) = fenced_block(text, "```").and_then(parse_block) {
        return Some(value);
    }
    for (idx, c) in text.char_indices() {
        if c != '{' && c != '[' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            return Some(value);
        }
    }
    None
}

fn string_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match obj.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

fn line_field(obj: &Map<String, Value>) -> Option<u32> {
    match obj.get("line").or_else(|| obj.get("line_number")) {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build a finding from one JSON object, or `None` when file or message is
/// missing.
fn finding_from_value(value: &Value, default_category: &str) -> Option<Finding> {
    let obj = value.as_object()?;
    let file = string_field(obj, &["file", "path", "filename"])?;
    let message = string_field(obj, &["message", "description", "issue", "title"])?;
    let severity = string_field(obj, &["severity", "level", "priority"])
        .map(|s| Severity::parse_lenient(&s))
        .unwrap_or(Severity::Minor);
    let category =
        string_field(obj, &["category", "type"]).unwrap_or_else(|| default_category.to_string());

    let mut finding = Finding::new(file, line_field(obj), severity, category, message);
    finding.confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| c.clamp(0.0, 1.0));
    finding.suggestion = string_field(obj, &["suggestion", "fix", "recommendation"]);
    if let Some(Value::Array(sources)) = obj.get("sources") {
        for s in sources.iter().filter_map(Value::as_str) {
            finding.add_source(s.to_string());
        }
    }
    Some(finding)
}

/// Pull the findings array and metrics object out of a parsed response.
fn split_output(value: Value) -> (Vec<Value>, Map<String, Value>) {
    match value {
        Value::Array(items) => (items, Map::new()),
        Value::Object(mut obj) => {
            let findings = ["findings", "issues", "results"]
                .iter()
                .find_map(|k| match obj.remove(*k) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                })
                .unwrap_or_default();
            let metrics = match obj.remove("metrics") {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            };
            (findings, metrics)
        }
        _ => (Vec::new(), Map::new()),
    }
}

/// Parse one task response. Findings are attributed to `source` and filed
/// under `category` unless they name their own.
pub fn parse_task_output(text: &str, source: &str, category: &str) -> ParsedOutput {
    let Some(value) = extract_json(text) else {
        return ParsedOutput {
            warning: Some(format!("no JSON found in {} chars of output", text.len())),
            ..ParsedOutput::default()
        };
    };
    let (items, metrics) = split_output(value);
    let total = items.len();
    let findings: Vec<Finding> = items
        .iter()
        .filter_map(|item| finding_from_value(item, category))
        .map(|f| f.with_source(source))
        .collect();
    let skipped = total - findings.len();
    ParsedOutput {
        warning: (skipped > 0)
            .then(|| format!("skipped {skipped} of {total} findings missing file or message")),
        findings,
        metrics,
    }
}

/// Parse a consolidation response into its replacement finding list.
/// Returns `None` when the response carries no usable findings array.
pub fn parse_consolidation(text: &str) -> Option<Vec<Finding>> {
    let value = extract_json(text)?;
    let has_list = value.is_array()
        || ["findings", "issues", "results"]
            .iter()
            .any(|k| value.get(*k).is_some_and(Value::is_array));
    if !has_list {
        return None;
    }
    let (items, _) = split_output(value);
    Some(
        items
            .iter()
            .filter_map(|item| finding_from_value(item, ""))
            .map(|mut f| {
                if f.sources.is_empty() {
                    f.add_source("consolidation".to_string());
                }
                f
            })
            .collect(),
    )
}
