//! Rule-priority decision matrix over aggregated findings.
//!
//! Rules are evaluated in order; the first match wins:
//!
//! | # | Condition                                        | Decision                 |
//! |---|--------------------------------------------------|--------------------------|
//! | 1 | `critical > thresholds.critical`                 | `changes_requested`      |
//! | 2 | `major > thresholds.major`                       | `needs_work`             |
//! | 3 | `coverage_delta < thresholds.coverage_delta`     | `needs_work`             |
//! | 4 | `minor > 0 && major == 0 && critical == 0`       | `approved_with_comments` |
//! | 5 | no findings                                      | `approved`               |
//! | 6 | otherwise                                        | `approved_with_comments` |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resilience::error::ConfigError;
use crate::review::finding::{Finding, Severity};

/// Metric key carrying the coverage change in percentage points.
pub const COVERAGE_DELTA_METRIC: &str = "coverage_delta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approved,
    ApprovedWithComments,
    NeedsWork,
    ChangesRequested,
    /// Synthesis could not produce a verdict.
    Error,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::ApprovedWithComments => write!(f, "approved_with_comments"),
            Self::NeedsWork => write!(f, "needs_work"),
            Self::ChangesRequested => write!(f, "changes_requested"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Decision thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    /// Critical findings tolerated before requesting changes.
    pub critical: usize,
    /// Major findings tolerated before asking for work.
    pub major: usize,
    /// Coverage change (percentage points) below which work is needed.
    pub coverage_delta: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            critical: 0,
            major: 3,
            coverage_delta: -5.0,
        }
    }
}

impl DecisionThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.coverage_delta.is_finite() {
            return Err(ConfigError::new(
                "decision.coverage_delta",
                format!("must be finite, got {}", self.coverage_delta),
            ));
        }
        Ok(())
    }
}

/// Verdict for one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: DecisionKind,
    pub rationale: String,
    pub critical_count: usize,
    pub major_count: usize,
    pub minor_count: usize,
    pub total_findings: usize,
    pub coverage_delta: f64,
}

impl Decision {
    /// Decision recorded when synthesis itself failed.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            decision: DecisionKind::Error,
            rationale: reason.into(),
            critical_count: 0,
            major_count: 0,
            minor_count: 0,
            total_findings: 0,
            coverage_delta: 0.0,
        }
    }
}

/// First numeric `coverage_delta` across the metrics, testing metrics first.
/// Missing or non-numeric values count as zero.
pub fn coverage_delta(metrics: &BTreeMap<String, Map<String, Value>>) -> f64 {
    let preferred = metrics.get("testing").into_iter();
    preferred
        .chain(metrics.values())
        .find_map(|m| m.get(COVERAGE_DELTA_METRIC).and_then(Value::as_f64))
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Default)]
pub struct DecisionMatrix {
    thresholds: DecisionThresholds,
}

impl DecisionMatrix {
    pub fn new(thresholds: DecisionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &DecisionThresholds {
        &self.thresholds
    }

    /// Evaluate the rules over merged findings and a coverage delta.
    pub fn decide(&self, findings: &[Finding], coverage_delta: f64) -> Decision {
        let count = |sev: Severity| findings.iter().filter(|f| f.severity == sev).count();
        let critical = count(Severity::Critical);
        let major = count(Severity::Major);
        let minor = count(Severity::Minor);
        let t = &self.thresholds;

        let (decision, rationale) = if critical > t.critical {
            (
                DecisionKind::ChangesRequested,
                format!("{critical} critical finding(s) exceed threshold {}", t.critical),
            )
        } else if major > t.major {
            (
                DecisionKind::NeedsWork,
                format!("{major} major finding(s) exceed threshold {}", t.major),
            )
        } else if coverage_delta < t.coverage_delta {
            (
                DecisionKind::NeedsWork,
                format!(
                    "coverage delta {coverage_delta:.1} is below threshold {:.1}",
                    t.coverage_delta
                ),
            )
        } else if minor > 0 && major == 0 && critical == 0 {
            (
                DecisionKind::ApprovedWithComments,
                format!("{minor} minor finding(s) only"),
            )
        } else if findings.is_empty() {
            (DecisionKind::Approved, "no findings".to_string())
        } else {
            (
                DecisionKind::ApprovedWithComments,
                format!(
                    "{critical} critical and {major} major finding(s) within thresholds ({} / {})",
                    t.critical, t.major
                ),
            )
        };

        Decision {
            decision,
            rationale,
            critical_count: critical,
            major_count: major,
            minor_count: minor,
            total_findings: findings.len(),
            coverage_delta,
        }
    }

    /// Same as [`decide`](Self::decide), reading the coverage delta from
    /// task metrics.
    pub fn decide_with_metrics(
        &self,
        findings: &[Finding],
        metrics: &BTreeMap<String, Map<String, Value>>,
    ) -> Decision {
        self.decide(findings, coverage_delta(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn findings(critical: usize, major: usize, minor: usize) -> Vec<Finding> {
        let mut out = Vec::new();
        for (n, sev) in [
            (critical, Severity::Critical),
            (major, Severity::Major),
            (minor, Severity::Minor),
        ] {
            for i in 0..n {
                out.push(Finding::new(format!("{sev}{i}.rs"), Some(1), sev, "design", "x"));
            }
        }
        out
    }

    #[test]
    fn test_critical_wins_over_everything() {
        let d = DecisionMatrix::default().decide(&findings(1, 0, 2), -10.0);
        assert_eq!(d.decision, DecisionKind::ChangesRequested);
        assert!(d.rationale.contains("1 critical"));
        assert_eq!(d.total_findings, 3);
    }

    #[test]
    fn test_no_findings_approved() {
        let d = DecisionMatrix::default().decide(&[], 0.0);
        assert_eq!(d.decision, DecisionKind::Approved);
    }

    #[test]
    fn test_major_threshold() {
        let m = DecisionMatrix::default();
        assert_eq!(m.decide(&findings(0, 4, 0), 0.0).decision, DecisionKind::NeedsWork);
        assert_eq!(
            m.decide(&findings(0, 3, 0), 0.0).decision,
            DecisionKind::ApprovedWithComments
        );
    }

    #[test]
    fn test_coverage_drop_needs_work() {
        let d = DecisionMatrix::default().decide(&findings(0, 0, 1), -6.5);
        assert_eq!(d.decision, DecisionKind::NeedsWork);
        assert!(d.rationale.contains("-6.5"));
        // Equal to the threshold is not below it.
        let d = DecisionMatrix::default().decide(&[], -5.0);
        assert_eq!(d.decision, DecisionKind::Approved);
    }

    #[test]
    fn test_minor_only_approved_with_comments() {
        let d = DecisionMatrix::default().decide(&findings(0, 0, 5), 0.0);
        assert_eq!(d.decision, DecisionKind::ApprovedWithComments);
        assert_eq!(d.minor_count, 5);
    }

    #[test]
    fn test_custom_thresholds() {
        let m = DecisionMatrix::new(DecisionThresholds {
            critical: 1,
            major: 0,
            coverage_delta: -1.0,
        });
        assert_eq!(m.decide(&findings(1, 0, 0), 0.0).decision, DecisionKind::ApprovedWithComments);
        assert_eq!(m.decide(&findings(0, 1, 0), 0.0).decision, DecisionKind::NeedsWork);
    }

    #[test]
    fn test_coverage_delta_from_metrics() {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "design".to_string(),
            json!({"coverage_delta": 3.0}).as_object().unwrap().clone(),
        );
        metrics.insert(
            "testing".to_string(),
            json!({"coverage_delta": -7, "new_tests": 0}).as_object().unwrap().clone(),
        );
        assert_eq!(coverage_delta(&metrics), -7.0);
        assert_eq!(coverage_delta(&BTreeMap::new()), 0.0);

        let d = DecisionMatrix::default().decide_with_metrics(&[], &metrics);
        assert_eq!(d.decision, DecisionKind::NeedsWork);
    }
}
