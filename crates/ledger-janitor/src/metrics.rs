//! Metrics collection for Janitor operations

use serde::Serialize;

/// Counters collected across sweeps and handled events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JanitorMetrics {
    /// Total sweep iterations completed
    pub sweep_count: usize,

    /// Sweeps that returned an error
    pub failed_sweeps: usize,

    /// Proposals marked expired
    pub expired_proposals: usize,

    /// Suppressed conflicts reactivated after their suppression lapsed
    pub reactivated_conflicts: usize,

    /// Organisms re-evaluated by sweeps
    pub reevaluated_organisms: usize,

    /// Conflicts created or reactivated by sweep re-evaluation
    pub detected_conflicts: usize,

    /// Conflicts whose score changed after a commit
    pub rescored_conflicts: usize,

    /// Events received from the ledger
    pub events_handled: usize,

    /// Events dropped because the receiver fell behind
    pub lagged_events: u64,

    /// Total time spent sweeping (ms)
    pub total_runtime_ms: u64,
}

impl JanitorMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sweep cycle completion
    pub fn record_sweep(&mut self, runtime_ms: u64) {
        self.sweep_count += 1;
        self.total_runtime_ms += runtime_ms;
    }

    /// Record a failed sweep
    pub fn record_failure(&mut self) {
        self.failed_sweeps += 1;
    }

    /// Record expired proposals
    pub fn record_expired(&mut self, count: usize) {
        self.expired_proposals += count;
    }

    /// Record reactivated conflicts
    pub fn record_reactivated(&mut self, count: usize) {
        self.reactivated_conflicts += count;
    }

    /// Record one organism re-evaluation and the conflicts it raised
    pub fn record_reevaluation(&mut self, detected: usize) {
        self.reevaluated_organisms += 1;
        self.detected_conflicts += detected;
    }

    /// Record re-scored conflicts
    pub fn record_rescored(&mut self, count: usize) {
        self.rescored_conflicts += count;
    }

    /// Record a received event
    pub fn record_event(&mut self) {
        self.events_handled += 1;
    }

    /// Record events skipped by a lagging receiver
    pub fn record_lagged(&mut self, skipped: u64) {
        self.lagged_events += skipped;
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Generate a summary report of metrics
    pub fn summary(&self) -> String {
        [
            "Janitor Metrics Summary".to_string(),
            "======================".to_string(),
            format!("Sweep cycles: {} ({} failed)", self.sweep_count, self.failed_sweeps),
            format!("Total runtime: {}ms", self.total_runtime_ms),
            format!("Expired proposals: {}", self.expired_proposals),
            format!("Reactivated conflicts: {}", self.reactivated_conflicts),
            format!(
                "Re-evaluated organisms: {} ({} conflicts raised)",
                self.reevaluated_organisms, self.detected_conflicts
            ),
            format!("Re-scored conflicts: {}", self.rescored_conflicts),
            format!("Events: {} handled, {} lagged", self.events_handled, self.lagged_events),
        ]
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = JanitorMetrics::new();
        assert_eq!(metrics.sweep_count, 0);
        assert_eq!(metrics.expired_proposals, 0);
        assert_eq!(metrics.lagged_events, 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let mut metrics = JanitorMetrics::new();
        metrics.record_sweep(5);
        metrics.record_sweep(7);
        metrics.record_expired(2);
        metrics.record_expired(1);
        metrics.record_reevaluation(1);
        metrics.record_reevaluation(0);
        metrics.record_lagged(4);

        assert_eq!(metrics.sweep_count, 2);
        assert_eq!(metrics.total_runtime_ms, 12);
        assert_eq!(metrics.expired_proposals, 3);
        assert_eq!(metrics.reevaluated_organisms, 2);
        assert_eq!(metrics.detected_conflicts, 1);
        assert_eq!(metrics.lagged_events, 4);
    }

    #[test]
    fn test_reset() {
        let mut metrics = JanitorMetrics::new();
        metrics.record_sweep(1);
        metrics.record_event();
        metrics.record_rescored(3);

        metrics.reset();
        assert_eq!(metrics, JanitorMetrics::default());
    }

    #[test]
    fn test_summary() {
        let mut metrics = JanitorMetrics::new();
        metrics.record_sweep(120);
        metrics.record_reactivated(2);
        metrics.record_event();
        metrics.record_lagged(3);

        let summary = metrics.summary();
        assert!(summary.contains("Sweep cycles: 1 (0 failed)"));
        assert!(summary.contains("Total runtime: 120ms"));
        assert!(summary.contains("Reactivated conflicts: 2"));
        assert!(summary.contains("Events: 1 handled, 3 lagged"));
    }
}
