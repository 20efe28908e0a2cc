//! Finding aggregation: dedup, escalation, and conflict detection.
//!
//! Input is the per-category map produced by the analysis phase. Findings
//! are deduplicated by `(file, line, category)`; the first occurrence is
//! canonical and later duplicates only contribute their sources. A minor
//! finding reported by enough distinct sources is escalated to major once.
//! Conflicts are computed on the pre-dedup list: any `(file, line)` with
//! more than one distinct severity yields one [`Conflict`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::review::finding::{Conflict, ConflictEntry, Finding, FindingKey, Severity};

/// Distinct sources needed to escalate a minor finding.
pub const DEFAULT_ESCALATION_SOURCES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStats {
    pub input_count: usize,
    pub merged_count: usize,
    pub duplicates_removed: usize,
    pub escalated_count: usize,
}

/// Output of one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub merged: Vec<Finding>,
    pub conflicts: Vec<Conflict>,
    pub stats: AggregationStats,
}

#[derive(Debug, Clone)]
pub struct FindingAggregator {
    escalation_sources: usize,
}

impl Default for FindingAggregator {
    fn default() -> Self {
        Self {
            escalation_sources: DEFAULT_ESCALATION_SOURCES,
        }
    }
}

/// Who reported a finding: its first source, else its category.
fn origin(finding: &Finding) -> String {
    finding
        .sources
        .first()
        .cloned()
        .unwrap_or_else(|| finding.category.clone())
}

impl FindingAggregator {
    pub fn new(escalation_sources: usize) -> Self {
        Self {
            escalation_sources: escalation_sources.max(1),
        }
    }

    /// Flatten, tagging untagged findings with their category and making
    /// sure each one names at least one source.
    fn flatten(by_category: &BTreeMap<String, Vec<Finding>>) -> Vec<Finding> {
        let mut flat = Vec::new();
        for (category, findings) in by_category {
            for finding in findings {
                let mut f = finding.clone();
                if f.category.is_empty() {
                    f.category = category.clone();
                }
                if f.sources.is_empty() {
                    f.add_source(category.clone());
                }
                flat.push(f);
            }
        }
        flat
    }

    fn dedup(flat: &[Finding]) -> Vec<Finding> {
        let mut index: HashMap<FindingKey, usize> = HashMap::new();
        let mut merged: Vec<Finding> = Vec::new();
        for f in flat {
            match index.get(&f.key()) {
                Some(&i) => {
                    for source in &f.sources {
                        merged[i].add_source(source.clone());
                    }
                }
                None => {
                    index.insert(f.key(), merged.len());
                    merged.push(f.clone());
                }
            }
        }
        merged
    }

    fn conflicts(flat: &[Finding]) -> Vec<Conflict> {
        let mut by_location: BTreeMap<(&str, Option<u32>), Vec<&Finding>> = BTreeMap::new();
        for f in flat {
            by_location.entry((f.file.as_str(), f.line)).or_default().push(f);
        }
        by_location
            .into_values()
            .filter_map(|group| {
                let severities: BTreeSet<Severity> = group.iter().map(|f| f.severity).collect();
                if severities.len() < 2 {
                    return None;
                }
                let mut findings: Vec<ConflictEntry> = group
                    .iter()
                    .map(|f| ConflictEntry {
                        source: origin(f),
                        severity: f.severity,
                        category: f.category.clone(),
                    })
                    .collect();
                findings.sort_by(|a, b| {
                    (a.severity, &a.source, &a.category).cmp(&(b.severity, &b.source, &b.category))
                });
                Some(Conflict {
                    location: group[0].location(),
                    severities: severities.into_iter().collect(),
                    findings,
                })
            })
            .collect()
    }

    /// Aggregate all findings of one review.
    pub fn aggregate(&self, by_category: &BTreeMap<String, Vec<Finding>>) -> Aggregation {
        let flat = Self::flatten(by_category);
        let mut merged = Self::dedup(&flat);

        let mut escalated_count = 0;
        for f in &mut merged {
            if !f.escalated
                && f.severity == Severity::Minor
                && f.sources.len() >= self.escalation_sources
            {
                f.severity = Severity::Major;
                f.escalated = true;
                escalated_count += 1;
            }
        }

        let conflicts = Self::conflicts(&flat);
        // Stable: equal severities keep first-seen order.
        merged.sort_by_key(|f| f.severity.rank());

        let stats = AggregationStats {
            input_count: flat.len(),
            merged_count: merged.len(),
            duplicates_removed: flat.len() - merged.len(),
            escalated_count,
        };
        debug!(
            input = stats.input_count,
            merged = stats.merged_count,
            conflicts = conflicts.len(),
            escalated = stats.escalated_count,
            "Findings aggregated"
        );
        Aggregation {
            merged,
            conflicts,
            stats,
        }
    }
}
