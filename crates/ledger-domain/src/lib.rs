//! Claim Ledger Domain Layer
//!
//! This crate contains the core data model of the claim ledger and every pure
//! computation over it. It has no I/O and no runtime: infrastructure (storage),
//! application services (mutation engine, conflict detector) and delivery
//! (HTTP) live in other crates and depend on this one.
//!
//! ## Key Concepts
//!
//! - **Organism**: an anchor entity that owns claims
//! - **Lens**: a typed schema key (`cluster.path`) giving a claim's value meaning
//! - **Claim**: a versioned, weighted `(organism, lens) -> value` assertion
//! - **Mutation**: an append-only, atomic change set forming a causal chain
//! - **Constraint**: a declarative rule (data, not code) with hard/soft severity
//! - **Conflict**: a persistent record of claims that cannot all hold together
//! - **Tradeoff**: the explicit record of what was sacrificed to accept a change
//!
//! ## Architecture
//!
//! - Pure business logic only, no storage or network code
//! - Store contracts are trait definitions in [`traits`]
//! - Drift and coherence are free functions in [`drift`]; they are never stored

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod claim;
pub mod conflict;
pub mod constraint;
pub mod drift;
pub mod error;
pub mod id;
pub mod lens;
pub mod mutation;
pub mod organism;
pub mod projection;
pub mod state;
pub mod tradeoff;
pub mod traits;
pub mod value;

// Re-exports for convenience
pub use claim::{Baseline, BaselineMode, Claim, ClaimSnapshot};
pub use conflict::{
    Conflict, ConflictOrigin, ConflictSeverity, ConflictStatus, ConflictType, Resolution,
    ResolutionStrategy, SeverityInputs, StatusChange, Suppression,
};
pub use constraint::{
    Clause, Compatibility, Constraint, ConstraintResult, Evidence, ImpliedState, OnFail, Operand,
    RepairHint, Rule, Scope, Selector, Severity,
};
pub use drift::{CoherenceBreakdown, CoherenceWeights};
pub use error::{StoreError, TransitionError};
pub use id::{ClaimId, ConflictId, ConstraintId, IdError, LensId, MutationId, OrganismId, ProjectionId};
pub use lens::{Formula, Lens, LensKey, Resolver, ValueSchema};
pub use mutation::{
    BaselineDraft, Change, ChangeError, ChangeOp, ChangeRequest, Mutation, MutationStatus,
};
pub use organism::Organism;
pub use projection::{
    BaselineDiffRow, MatrixRow, Projection, ProjectionData, ProjectionKind, SummaryData, TimelineEntry,
};
pub use state::OrganismState;
pub use tradeoff::Tradeoff;
pub use value::{Value, ValueKind};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
