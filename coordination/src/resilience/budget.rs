//! Per-review unit budget with per-task attribution.
//!
//! Every analysis call first reserves `estimated × safety_margin` units. A
//! call is rejected pre-flight when `used + reserved + that amount` would
//! exceed `max_units`. On success the reservation is swapped for the actual
//! consumption, booked against the task under the same lock; on failure (or
//! cancellation) only the reservation is released, so `used_units` never moves.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{CallError, ConfigError};

/// Trait for estimating units from text.
pub trait UnitEstimator: Send + Sync {
    /// Estimate the number of units in the given text.
    fn estimate(&self, text: &str) -> u64;

    /// Estimator name for logging.
    fn name(&self) -> &str;
}

/// Character-count based estimator (chars / divisor).
///
/// Uses the approximation of ~4 characters per unit for English text.
#[derive(Debug, Clone)]
pub struct CharCountEstimator {
    pub chars_per_unit: f64,
}

impl Default for CharCountEstimator {
    fn default() -> Self {
        Self {
            chars_per_unit: 4.0,
        }
    }
}

impl UnitEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u64 {
        (text.chars().count() as f64 / self.chars_per_unit).ceil() as u64
    }

    fn name(&self) -> &str {
        "char_count"
    }
}

/// Results that can report how many units they actually consumed.
pub trait UsageReport {
    fn consumed_units(&self) -> Option<f64>;
}

/// Budget tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Units available to one review.
    pub max_units: f64,
    /// Multiplier applied to estimates in the pre-flight check (>= 1.0).
    pub safety_margin: f64,
    /// Units booked when a successful result does not report usage.
    pub fallback_units: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_units: 500_000.0,
            safety_margin: 1.2,
            fallback_units: 4_000.0,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_units > 0.0) {
            return Err(ConfigError::new(
                "budget.max_units",
                format!("must be > 0, got {}", self.max_units),
            ));
        }
        if !(self.safety_margin >= 1.0) {
            return Err(ConfigError::new(
                "budget.safety_margin",
                format!("must be >= 1.0, got {}", self.safety_margin),
            ));
        }
        if !(self.fallback_units >= 0.0) {
            return Err(ConfigError::new(
                "budget.fallback_units",
                format!("must be >= 0, got {}", self.fallback_units),
            ));
        }
        Ok(())
    }
}

/// One entry in the call log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub task: String,
    pub estimated_units: f64,
    /// Units booked; zero for failed calls.
    pub consumed_units: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_units: f64,
    pub used_units: f64,
    pub reserved_units: f64,
    pub per_task: BTreeMap<String, f64>,
    pub calls: usize,
}

impl BudgetSnapshot {
    pub fn remaining(&self) -> f64 {
        (self.max_units - self.used_units - self.reserved_units).max(0.0)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    used: f64,
    reserved: f64,
    per_task: BTreeMap<String, f64>,
    call_log: Vec<CallRecord>,
}

/// Releases its reservation on drop unless committed.
struct Reservation<'a> {
    tracker: &'a BudgetTracker,
    units: f64,
    settled: bool,
}

impl Reservation<'_> {
    /// Swap the reservation for the booked outcome under one ledger lock.
    fn commit(mut self, task: &str, estimated: f64, consumed: f64, success: bool) {
        let mut ledger = self.tracker.lock();
        ledger.reserved = (ledger.reserved - self.units).max(0.0);
        if success {
            ledger.used += consumed;
            *ledger.per_task.entry(task.to_string()).or_insert(0.0) += consumed;
        }
        ledger.call_log.push(CallRecord {
            task: task.to_string(),
            estimated_units: estimated,
            consumed_units: if success { consumed } else { 0.0 },
            success,
            timestamp: Utc::now(),
        });
        self.settled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut ledger = self.tracker.lock();
        ledger.reserved = (ledger.reserved - self.units).max(0.0);
    }
}

/// Tracks unit consumption for one review.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    ledger: Mutex<Ledger>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve(&self, task: &str, estimated: f64) -> Result<Reservation<'_>, CallError> {
        let units = estimated.max(0.0) * self.config.safety_margin;
        let mut ledger = self.lock();
        let committed = ledger.used + ledger.reserved;
        if committed + units > self.config.max_units {
            warn!(
                task,
                used = ledger.used,
                reserved = ledger.reserved,
                requested = units,
                max = self.config.max_units,
                "Budget pre-flight rejected call"
            );
            return Err(CallError::BudgetExceeded {
                task: task.to_string(),
                used: committed,
                estimated: units,
                max: self.config.max_units,
            });
        }
        ledger.reserved += units;
        Ok(Reservation {
            tracker: self,
            units,
            settled: false,
        })
    }

    /// Run `operation` under the budget, attributing consumption to `task`.
    pub async fn track_call<T, F, Fut>(
        &self,
        task: &str,
        estimated_units: f64,
        operation: F,
    ) -> Result<T, CallError>
    where
        T: UsageReport,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let reservation = self.reserve(task, estimated_units)?;
        let result = operation().await;
        match &result {
            Ok(value) => {
                let consumed = value
                    .consumed_units()
                    .unwrap_or(self.config.fallback_units);
                debug!(task, estimated = estimated_units, consumed, "Budget booked");
                reservation.commit(task, estimated_units, consumed, true);
            }
            Err(_) => reservation.commit(task, estimated_units, 0.0, false),
        }
        result
    }

    pub fn used_units(&self) -> f64 {
        self.lock().used
    }

    pub fn usage_for(&self, task: &str) -> f64 {
        self.lock().per_task.get(task).copied().unwrap_or(0.0)
    }

    pub fn call_log(&self) -> Vec<CallRecord> {
        self.lock().call_log.clone()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let ledger = self.lock();
        BudgetSnapshot {
            max_units: self.config.max_units,
            used_units: ledger.used,
            reserved_units: ledger.reserved,
            per_task: ledger.per_task.clone(),
            calls: ledger.call_log.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Units(Option<f64>);

    impl UsageReport for Units {
        fn consumed_units(&self) -> Option<f64> {
            self.0
        }
    }

    fn tracker(max: f64) -> BudgetTracker {
        BudgetTracker::new(BudgetConfig {
            max_units: max,
            safety_margin: 1.5,
            fallback_units: 50.0,
        })
        .unwrap()
    }

    #[test]
    fn test_char_count_estimator() {
        let est = CharCountEstimator::default();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
        assert_eq!(est.name(), "char_count");
    }

    #[test]
    fn test_margin_below_one_rejected() {
        let err = BudgetTracker::new(BudgetConfig {
            safety_margin: 0.9,
            ..BudgetConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.field, "budget.safety_margin");
    }

    #[tokio::test]
    async fn test_success_books_actual_units() {
        let t = tracker(1_000.0);
        t.track_call("security", 100.0, || async { Ok(Units(Some(120.0))) })
            .await
            .unwrap();
        t.track_call("tests", 100.0, || async { Ok(Units(None)) })
            .await
            .unwrap();
        assert_eq!(t.used_units(), 170.0);
        assert_eq!(t.usage_for("security"), 120.0);
        assert_eq!(t.usage_for("tests"), 50.0);
        let snap = t.snapshot();
        assert_eq!(snap.used_units, snap.per_task.values().sum::<f64>());
        assert_eq!(snap.reserved_units, 0.0);
        assert_eq!(snap.calls, 2);
    }

    #[tokio::test]
    async fn test_preflight_rejects_without_invoking() {
        let t = tracker(100.0);
        let invoked = AtomicBool::new(false);
        // 70 * 1.5 = 105 > 100
        let result = t
            .track_call("design", 70.0, || async {
                invoked.store(true, Ordering::SeqCst);
                Ok(Units(Some(1.0)))
            })
            .await;
        assert!(matches!(result, Err(CallError::BudgetExceeded { .. })));
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(t.call_log().len(), 0);
    }

    #[tokio::test]
    async fn test_failed_call_leaves_used_unchanged() {
        let t = tracker(1_000.0);
        t.track_call("tests", 10.0, || async { Ok(Units(Some(10.0))) })
            .await
            .unwrap();
        let before = t.used_units();
        let result: Result<Units, _> = t
            .track_call("tests", 10.0, || async { Err(CallError::http(500, "boom")) })
            .await;
        assert!(result.is_err());
        assert_eq!(t.used_units(), before);
        assert_eq!(t.snapshot().reserved_units, 0.0);
        let log = t.call_log();
        assert!(!log[1].success);
        assert_eq!(log[1].consumed_units, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_see_each_other() {
        let t = tracker(100.0);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = t.track_call("a", 40.0, || async move {
            let _ = rx.await;
            Ok(Units(Some(40.0)))
        });
        let second = async {
            // 40*1.5 reserved by the first call; 40*1.5 more would exceed 100.
            tokio::task::yield_now().await;
            let r = t
                .track_call("b", 40.0, || async { Ok(Units(Some(1.0))) })
                .await;
            let _ = tx.send(());
            r
        };
        let (a, b) = tokio::join!(first, second);
        assert!(a.is_ok());
        assert!(matches!(b, Err(CallError::BudgetExceeded { .. })));
        assert_eq!(t.used_units(), 40.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commit_never_exposes_released_but_unbooked_units() {
        const CALLS: usize = 8;
        let t = Arc::new(tracker(10_000.0));
        let gate = Arc::new(tokio::sync::Barrier::new(CALLS + 1));
        let handles: Vec<_> = (0..CALLS)
            .map(|i| {
                let t = Arc::clone(&t);
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    // Reserves 10 * 1.5 and books exactly that much.
                    t.track_call(&format!("task-{i}"), 10.0, move || async move {
                        gate.wait().await;
                        Ok(Units(Some(15.0)))
                    })
                    .await
                })
            })
            .collect();

        gate.wait().await;
        let committed = 15.0 * CALLS as f64;
        while !handles.iter().all(|h| h.is_finished()) {
            let snap = t.snapshot();
            assert_eq!(snap.used_units + snap.reserved_units, committed, "{snap:?}");
            std::hint::spin_loop();
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        let snap = t.snapshot();
        assert_eq!(snap.used_units, committed);
        assert_eq!(snap.reserved_units, 0.0);
        assert_eq!(snap.calls, CALLS);
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_reservation() {
        let t = tracker(100.0);
        let pending = t.track_call("a", 50.0, || async {
            std::future::pending::<()>().await;
            Ok(Units(Some(1.0)))
        });
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        let snap = t.snapshot();
        assert_eq!(snap.reserved_units, 0.0);
        assert_eq!(snap.used_units, 0.0);
    }
}
