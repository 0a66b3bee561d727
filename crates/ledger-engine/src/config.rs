//! Ledger configuration

use ledger_domain::constraint::SOFT_PENALTY_RANGE;
use ledger_domain::CoherenceWeights;
use serde::{Deserialize, Serialize};

/// When the ledger may resolve conflicts on its own
///
/// Disabled unless configured. Rules are tried in order: weight delta,
/// hard-beats-soft, baseline-mode precedence. Every automatic resolution
/// still records a tradeoff and a compensating mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoResolvePolicy {
    /// Master switch
    pub enabled: bool,

    /// Prefer the heavier claim when weights differ by more than this
    pub weight_delta_threshold: Option<f64>,

    /// Prefer a claim carrying an attached hard constraint over one without
    pub hard_beats_soft: bool,

    /// Prefer the claim whose baseline mode ranks higher
    /// (declared > ideal > selected > historical > snapshot)
    pub baseline_mode_precedence: bool,
}

impl Default for AutoResolvePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            weight_delta_threshold: Some(0.3),
            hard_beats_soft: true,
            baseline_mode_precedence: true,
        }
    }
}

/// Configuration for the ledger engine
///
/// # Examples
///
/// ```
/// use ledger_engine::LedgerConfig;
///
/// let config = LedgerConfig::default();
/// assert_eq!(config.proposal_ttl_ms, 24 * 60 * 60 * 1000);
///
/// let config = LedgerConfig::strict();
/// assert!(config.reject_unknown_actors);
///
/// let config = LedgerConfig::lenient();
/// assert!(!config.reject_unknown_actors);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long a proposal stays committable (ms)
    pub proposal_ttl_ms: u64,

    /// Coherence formula weights
    pub coherence_weights: CoherenceWeights,

    /// Soft penalty given to constraints registered without one
    pub default_soft_penalty: f64,

    /// Automatic conflict resolution
    pub auto_resolve: AutoResolvePolicy,

    /// Projections kept in the cache
    pub projection_capacity: usize,

    /// Buffered events per subscriber
    pub event_capacity: usize,

    /// Actors known at startup (`system` is always known)
    pub actors: Vec<String>,

    /// Refuse proposals from unregistered actors
    pub reject_unknown_actors: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            proposal_ttl_ms: 24 * 60 * 60 * 1000,
            coherence_weights: CoherenceWeights::default(),
            default_soft_penalty: 0.25,
            auto_resolve: AutoResolvePolicy::default(),
            projection_capacity: 256,
            event_capacity: 1024,
            actors: Vec::new(),
            reject_unknown_actors: true,
        }
    }
}

impl LedgerConfig {
    /// Short proposal lifetime, registered actors only
    pub fn strict() -> Self {
        Self {
            proposal_ttl_ms: 60 * 60 * 1000,
            reject_unknown_actors: true,
            ..Default::default()
        }
    }

    /// Long proposal lifetime, any actor
    pub fn lenient() -> Self {
        Self {
            proposal_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            reject_unknown_actors: false,
            ..Default::default()
        }
    }

    /// Default soft penalty clamped into the allowed range
    pub fn soft_penalty(&self) -> f64 {
        let (lo, hi) = SOFT_PENALTY_RANGE;
        if self.default_soft_penalty.is_finite() {
            self.default_soft_penalty.clamp(lo, hi)
        } else {
            lo
        }
    }
}
