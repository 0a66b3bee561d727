//! Configuration for Janitor operations
//!
//! Defines the sweep interval and which maintenance passes run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the Janitor service
///
/// # Examples
///
/// ```
/// use ledger_janitor::JanitorConfig;
///
/// let config = JanitorConfig::default();
/// assert_eq!(config.sweep_interval_ms, 60_000);
///
/// let config = JanitorConfig::strict();
/// assert!(config.reevaluate_on_sweep);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// How often to run the sweep cycle (in milliseconds)
    /// Default: one minute
    pub sweep_interval_ms: u64,

    /// Re-score an organism's active conflicts when a commit lands
    /// Default: true
    pub rescore_on_commit: bool,

    /// Re-run conflict detection for every organism on each sweep
    /// Default: false
    pub reevaluate_on_sweep: bool,

    /// Log what would change without writing
    /// Default: false
    pub dry_run: bool,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            rescore_on_commit: true,
            reevaluate_on_sweep: false,
            dry_run: false,
        }
    }
}

impl JanitorConfig {
    /// Frequent sweeps with full re-evaluation
    ///
    /// - Sweep interval: 15 seconds
    /// - Re-evaluates every organism on each sweep
    pub fn strict() -> Self {
        Self {
            sweep_interval_ms: 15_000,
            reevaluate_on_sweep: true,
            ..Self::default()
        }
    }

    /// Infrequent sweeps, expiry and reactivation only
    ///
    /// - Sweep interval: 5 minutes
    pub fn lenient() -> Self {
        Self {
            sweep_interval_ms: 300_000,
            reevaluate_on_sweep: false,
            ..Self::default()
        }
    }

    /// Get sweep interval as Duration (never zero)
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
