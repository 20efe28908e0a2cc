//! Synthesis: aggregate raw findings, then decide.

pub mod aggregator;
pub mod decision;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use aggregator::{Aggregation, AggregationStats, FindingAggregator};
pub use decision::{Decision, DecisionKind, DecisionMatrix, DecisionThresholds};

use crate::review::finding::{Conflict, Finding};
use crate::review::state::FindingSet;

/// Everything synthesis produces for one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub decision: Decision,
    pub merged: Vec<Finding>,
    pub conflicts: Vec<Conflict>,
    pub stats: AggregationStats,
}

/// Aggregate `findings` and run the decision matrix over the result.
pub fn synthesize(
    aggregator: &FindingAggregator,
    matrix: &DecisionMatrix,
    findings: &FindingSet,
    metrics: &BTreeMap<String, Map<String, Value>>,
) -> SynthesisResult {
    let aggregation = aggregator.aggregate(&findings.by_category());
    let decision = matrix.decide_with_metrics(&aggregation.merged, metrics);
    SynthesisResult {
        decision,
        merged: aggregation.merged,
        conflicts: aggregation.conflicts,
        stats: aggregation.stats,
    }
}
