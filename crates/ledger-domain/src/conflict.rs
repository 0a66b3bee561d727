//! Conflict module - persistent records of claims that cannot all hold
//!
//! Conflicts are never deleted. Status moves only along
//! `active -> {resolved, suppressed}` and `suppressed -> active`, and every
//! transition is appended to the conflict's history.

use crate::error::TransitionError;
use crate::lens::LensKey;
use crate::tradeoff::Tradeoff;
use crate::{ClaimId, ConflictId, ConstraintId, MutationId, OrganismId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of trigger produced the conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// An `exclusion` rule failed
    ExclusionConstraint,
    /// A `weighted_drift_lte` rule failed against a declared/ideal baseline
    BaselineViolation,
    /// Two passing rules implied mutually exclusive states
    Derived,
}

impl ConflictType {
    /// Get the type name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ExclusionConstraint => "exclusion-constraint",
            ConflictType::BaselineViolation => "baseline-violation",
            ConflictType::Derived => "derived",
        }
    }

    /// Parse a type name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exclusion-constraint" => Some(ConflictType::ExclusionConstraint),
            "baseline-violation" => Some(ConflictType::BaselineViolation),
            "derived" => Some(ConflictType::Derived),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computed severity bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// score < 0.5
    Low,
    /// 0.5 <= score < 1.0
    Medium,
    /// 1.0 <= score < 1.5
    High,
    /// score >= 1.5
    Existential,
}

impl ConflictSeverity {
    /// Bucket a severity score
    pub fn from_score(score: f64) -> Self {
        if score >= 1.5 {
            ConflictSeverity::Existential
        } else if score >= 1.0 {
            ConflictSeverity::High
        } else if score >= 0.5 {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::Low
        }
    }

    /// Get the severity name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Existential => "existential",
        }
    }

    /// Parse a severity name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(ConflictSeverity::Low),
            "medium" => Some(ConflictSeverity::Medium),
            "high" => Some(ConflictSeverity::High),
            "existential" => Some(ConflictSeverity::Existential),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    /// Unresolved
    Active,
    /// Resolved through a compensating mutation; terminal
    Resolved,
    /// Temporarily silenced
    Suppressed,
}

impl ConflictStatus {
    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Active => "active",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Suppressed => "suppressed",
        }
    }

    /// Parse a status name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConflictStatus::Active),
            "resolved" => Some(ConflictStatus::Resolved),
            "suppressed" => Some(ConflictStatus::Suppressed),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal
    pub fn can_transition_to(&self, next: ConflictStatus) -> bool {
        matches!(
            (self, next),
            (ConflictStatus::Active, ConflictStatus::Resolved)
                | (ConflictStatus::Active, ConflictStatus::Suppressed)
                | (ConflictStatus::Suppressed, ConflictStatus::Active)
        )
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which constraint and mutation triggered the conflict
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictOrigin {
    /// Governing constraint
    #[serde(default)]
    pub constraint_id: Option<ConstraintId>,

    /// Its version at trigger time
    #[serde(default)]
    pub constraint_version: Option<u32>,

    /// Mutation whose commit triggered it
    #[serde(default)]
    pub mutation_id: Option<MutationId>,
}

/// How a conflict was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the chosen claim, soft-delete the sacrificed ones
    Prefer,
    /// Reweight the sacrificed claims to zero
    Demote,
    /// Set the sacrificed claims back to their baseline values
    Revert,
    /// Declare the chosen claim's current value as its baseline
    Rebaseline,
}

impl ResolutionStrategy {
    /// Get the strategy name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Prefer => "prefer",
            ResolutionStrategy::Demote => "demote",
            ResolutionStrategy::Revert => "revert",
            ResolutionStrategy::Rebaseline => "rebaseline",
        }
    }
}

/// Resolution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// Strategy applied
    pub strategy: ResolutionStrategy,

    /// Claim kept
    #[serde(default)]
    pub chosen_claim_id: Option<ClaimId>,

    /// Claims given up
    #[serde(default)]
    pub sacrificed: Vec<ClaimId>,

    /// Mandatory tradeoff
    pub tradeoff: Tradeoff,

    /// Compensating mutation carrying the resolution
    pub mutation_id: MutationId,

    /// Who resolved it
    pub resolved_by: String,

    /// Resolution time (ms)
    pub resolved_at: u64,

    /// Whether an auto-resolution policy did it
    #[serde(default)]
    pub automatic: bool,
}

/// Suppression record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suppression {
    /// Why it was suppressed
    pub reason: String,

    /// Auto-reactivation time (ms)
    #[serde(default)]
    pub expires_at: Option<u64>,

    /// Who approved it
    pub approved_by: String,

    /// Suppression time (ms)
    pub suppressed_at: u64,
}

impl Suppression {
    /// Whether the suppression has lapsed
    pub fn has_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// One status transition in a conflict's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// Previous status
    pub from: ConflictStatus,
    /// New status
    pub to: ConflictStatus,
    /// Transition time (ms)
    pub at: u64,
    /// Why
    pub reason: String,
}

/// Inputs to the severity formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityInputs {
    /// Mean weight of the involved claims
    pub mean_weight: f64,
    /// Any governing constraint is hard
    pub hard: bool,
    /// Any involved baseline is declared or ideal
    pub reference_baseline: bool,
    /// Earlier occurrences of the same conflict
    pub prior_occurrences: u32,
}

impl SeverityInputs {
    /// `mean(weight) × (1.5 if hard) × (1.3 if declared/ideal) × (1 + 0.1 × prior)`
    pub fn score(&self) -> f64 {
        let hard = if self.hard { 1.5 } else { 1.0 };
        let reference = if self.reference_baseline { 1.3 } else { 1.0 };
        self.mean_weight * hard * reference * (1.0 + 0.1 * self.prior_occurrences as f64)
    }
}

/// Mean of claim weights; zero for none
pub fn mean_weight(weights: &[f64]) -> f64 {
    if weights.is_empty() {
        0.0
    } else {
        weights.iter().sum::<f64>() / weights.len() as f64
    }
}

/// Stable identity of "the same conflict": trigger type, constraint and sorted claims
pub fn fingerprint(conflict_type: ConflictType, constraint_id: Option<ConstraintId>, claims: &[ClaimId]) -> String {
    let mut sorted: Vec<ClaimId> = claims.to_vec();
    sorted.sort();
    sorted.dedup();
    let claims: Vec<String> = sorted.iter().map(|c| c.to_string()).collect();
    format!(
        "{}|{}|{}",
        conflict_type,
        constraint_id.map(|c| c.to_string()).unwrap_or_default(),
        claims.join(",")
    )
}

/// A relation between claims that cannot all be valid together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Unique identifier
    pub id: ConflictId,

    /// Owning organism
    pub organism_id: OrganismId,

    /// Trigger kind
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,

    /// Computed severity bucket
    pub severity: ConflictSeverity,

    /// Computed severity score
    pub score: f64,

    /// Mean weight of involved claims at last scoring
    pub mean_weight: f64,

    /// Lifecycle state
    pub status: ConflictStatus,

    /// Involved claims
    pub claims: Vec<ClaimId>,

    /// Involved lenses
    pub lenses: Vec<LensKey>,

    /// Trigger origin
    pub origin: ConflictOrigin,

    /// Identity used for refresh/reactivation
    pub fingerprint: String,

    /// Earlier occurrences of the same fingerprint
    pub prior_occurrences: u32,

    /// Whether the last re-evaluation still saw the trigger
    pub still_triggered: bool,

    /// Human-readable description of the trigger
    pub detail: String,

    /// Resolution record
    #[serde(default)]
    pub resolution: Option<Resolution>,

    /// Suppression record
    #[serde(default)]
    pub suppression: Option<Suppression>,

    /// Status transitions
    #[serde(default)]
    pub history: Vec<StatusChange>,

    /// Creation time (ms)
    pub created_at: u64,

    /// Last change (ms)
    pub updated_at: u64,

    /// Last re-evaluation (ms)
    pub last_evaluated_at: u64,
}

impl Conflict {
    /// Create an active conflict, scoring it from `inputs`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organism_id: OrganismId,
        conflict_type: ConflictType,
        claims: Vec<ClaimId>,
        lenses: Vec<LensKey>,
        origin: ConflictOrigin,
        inputs: SeverityInputs,
        detail: impl Into<String>,
        now: u64,
    ) -> Self {
        let score = inputs.score();
        let fingerprint = fingerprint(conflict_type, origin.constraint_id, &claims);
        Self {
            id: ConflictId::new(),
            organism_id,
            conflict_type,
            severity: ConflictSeverity::from_score(score),
            score,
            mean_weight: inputs.mean_weight,
            status: ConflictStatus::Active,
            claims,
            lenses,
            origin,
            fingerprint,
            prior_occurrences: inputs.prior_occurrences,
            still_triggered: true,
            detail: detail.into(),
            resolution: None,
            suppression: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            last_evaluated_at: now,
        }
    }

    /// Re-score from fresh inputs
    pub fn rescore(&mut self, inputs: SeverityInputs, now: u64) {
        self.score = inputs.score();
        self.severity = ConflictSeverity::from_score(self.score);
        self.mean_weight = inputs.mean_weight;
        self.prior_occurrences = inputs.prior_occurrences;
        self.updated_at = now;
        self.last_evaluated_at = now;
    }

    /// Move to `next`, appending to history
    pub fn transition(&mut self, next: ConflictStatus, reason: impl Into<String>, now: u64) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "conflict",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.history.push(StatusChange {
            from: self.status,
            to: next,
            at: now,
            reason: reason.into(),
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Whether the conflict involves `claim_id`
    pub fn involves(&self, claim_id: ClaimId) -> bool {
        self.claims.contains(&claim_id)
    }

    /// Whether it is active
    pub fn is_active(&self) -> bool {
        self.status == ConflictStatus::Active
    }

    /// Contribution to conflict burden: score × mean weight
    pub fn burden(&self) -> f64 {
        self.score * self.mean_weight
    }

    /// Status at a past instant, reconstructed from history
    pub fn status_at(&self, at: u64) -> Option<ConflictStatus> {
        if at < self.created_at {
            return None;
        }
        let mut status = ConflictStatus::Active;
        for change in &self.history {
            if change.at <= at {
                status = change.to;
            }
        }
        Some(status)
    }
}
