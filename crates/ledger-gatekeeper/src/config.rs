//! Evaluator configuration

use ledger_domain::value::DEFAULT_EPSILON;
use serde::{Deserialize, Serialize};

/// Configuration for constraint evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Numeric tolerance for equality and threshold comparisons
    pub epsilon: f64,

    /// Tolerance used by `within_tolerance` when the rule's own is unusable
    /// (negative or not finite)
    pub default_tolerance: f64,

    /// Whether evaluation errors count as failures (otherwise the result is
    /// reported as skipped)
    pub errors_as_failures: bool,

    /// Maximum nesting of boolean combinators
    pub max_depth: usize,

    /// Whether failing results carry repair hints
    pub repair_hints: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            default_tolerance: 0.0,
            errors_as_failures: true,
            max_depth: 32,
            repair_hints: true,
        }
    }
}

impl EvaluatorConfig {
    /// Exact comparisons; every error fails
    pub fn strict() -> Self {
        Self {
            epsilon: 0.0,
            errors_as_failures: true,
            ..Default::default()
        }
    }

    /// Looser comparisons; errors skip the rule
    pub fn lenient() -> Self {
        Self {
            epsilon: 1e-6,
            default_tolerance: 1e-3,
            errors_as_failures: false,
            ..Default::default()
        }
    }
}
