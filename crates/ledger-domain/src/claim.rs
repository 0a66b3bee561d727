//! Claim module - the atomic unit of the ledger

use crate::lens::LensKey;
use crate::value::Value;
use crate::{ClaimId, ConstraintId, MutationId, OrganismId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference frame kind for a baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    /// Captured automatically from a past value
    Snapshot,
    /// Explicitly declared by an actor
    Declared,
    /// An aspirational target
    Ideal,
    /// Derived from history
    Historical,
    /// Chosen among alternatives
    Selected,
}

impl BaselineMode {
    /// Get the mode name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineMode::Snapshot => "snapshot",
            BaselineMode::Declared => "declared",
            BaselineMode::Ideal => "ideal",
            BaselineMode::Historical => "historical",
            BaselineMode::Selected => "selected",
        }
    }

    /// Declared and ideal baselines are reference frames an actor committed to;
    /// deviating from them is a baseline violation rather than plain drift
    pub fn is_reference(&self) -> bool {
        matches!(self, BaselineMode::Declared | BaselineMode::Ideal)
    }

    /// Precedence used by baseline-mode auto-resolution (higher wins)
    pub fn precedence(&self) -> u8 {
        match self {
            BaselineMode::Declared => 4,
            BaselineMode::Ideal => 3,
            BaselineMode::Selected => 2,
            BaselineMode::Historical => 1,
            BaselineMode::Snapshot => 0,
        }
    }
}

impl fmt::Display for BaselineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference frame against which drift is measured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    /// Frame kind
    pub mode: BaselineMode,

    /// Captured value
    pub value: Value,

    /// Capture time (ms)
    pub captured_at: u64,
}

impl Baseline {
    /// Create a baseline
    pub fn new(mode: BaselineMode, value: Value, captured_at: u64) -> Self {
        Self {
            mode,
            value,
            captured_at,
        }
    }
}

/// The mutable part of a claim, as recorded in a change's before/after
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSnapshot {
    /// Asserted value
    pub value: Value,

    /// Relative importance in [0, 1]
    pub weight: f64,

    /// Reference frame
    pub baseline: Baseline,

    /// Attached constraint ids
    #[serde(default)]
    pub constraints: Vec<ConstraintId>,

    /// Soft-delete marker
    #[serde(default)]
    pub deleted: bool,
}

/// A versioned, weighted assertion `(organism, lens) -> value`
///
/// `version` increments on every committed mutation touching the claim and
/// `last_mutation_id` always names the mutation that produced the current
/// state. Claims are never removed: deletion is a mutation that sets `deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    /// Unique identifier
    pub id: ClaimId,

    /// Owning organism
    pub organism_id: OrganismId,

    /// Lens key
    pub lens: LensKey,

    /// Asserted value
    pub value: Value,

    /// Relative importance in [0, 1]
    pub weight: f64,

    /// Attached constraint ids
    #[serde(default)]
    pub constraints: Vec<ConstraintId>,

    /// Reference frame
    pub baseline: Baseline,

    /// Lineage pointer
    pub last_mutation_id: Option<MutationId>,

    /// Optimistic-concurrency token
    pub version: u64,

    /// Soft-delete marker
    #[serde(default)]
    pub deleted: bool,

    /// Creation time (ms)
    pub created_at: u64,

    /// Last update time (ms)
    pub updated_at: u64,
}

impl Claim {
    /// Materialise a brand-new claim from its first snapshot
    pub fn from_snapshot(
        id: ClaimId,
        organism_id: OrganismId,
        lens: LensKey,
        snapshot: ClaimSnapshot,
        mutation_id: MutationId,
        now: u64,
    ) -> Self {
        Self {
            id,
            organism_id,
            lens,
            value: snapshot.value,
            weight: snapshot.weight,
            constraints: snapshot.constraints,
            baseline: snapshot.baseline,
            last_mutation_id: Some(mutation_id),
            version: 1,
            deleted: snapshot.deleted,
            created_at: now,
            updated_at: now,
        }
    }

    /// The mutable part of this claim
    pub fn snapshot(&self) -> ClaimSnapshot {
        ClaimSnapshot {
            value: self.value.clone(),
            weight: self.weight,
            baseline: self.baseline.clone(),
            constraints: self.constraints.clone(),
            deleted: self.deleted,
        }
    }

    /// Next version of this claim carrying `snapshot`, produced by `mutation_id`
    pub fn advanced(&self, snapshot: ClaimSnapshot, mutation_id: MutationId, now: u64) -> Self {
        Self {
            value: snapshot.value,
            weight: snapshot.weight,
            constraints: snapshot.constraints,
            baseline: snapshot.baseline,
            deleted: snapshot.deleted,
            last_mutation_id: Some(mutation_id),
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Overwrite the mutable part in place without touching lineage
    ///
    /// Used for in-memory what-if states (validation, simulation, replay).
    pub fn overlay(&mut self, snapshot: ClaimSnapshot) {
        self.value = snapshot.value;
        self.weight = snapshot.weight;
        self.constraints = snapshot.constraints;
        self.baseline = snapshot.baseline;
        self.deleted = snapshot.deleted;
    }

    /// Whether the claim is live (not soft-deleted)
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}
