//! Claim Ledger Engine
//!
//! The [`Ledger`] facade ties the store, the constraint evaluator and the
//! conflict rules together into the operations callers use.
//!
//! The engine provides:
//! - Catalog management (organisms, lenses, versioned constraints, actors)
//! - The mutation lifecycle: propose, validate, commit, reject, rollback, expire
//! - Conflict detection, resolution, suppression and auto-resolution
//! - Read queries: evaluate, diff, explain, simulate, replay
//! - A projection cache invalidated by every commit
//! - A broadcast event stream for asynchronous subscribers
//!
//! # Examples
//!
//! ```no_run
//! use ledger_engine::{Ledger, LedgerConfig};
//!
//! let ledger = Ledger::in_memory(LedgerConfig::lenient());
//! let organism = ledger.create_organism("Maison", "brand", vec![]).unwrap();
//!
//! // let mutation = ledger.propose(organism.id, "alice", changes, None)?;
//! // ledger.commit(mutation.id, vec![], None)?;
//! ```

#![warn(missing_docs)]

mod catalog;
mod clock;
mod config;
mod conflicts;
mod error;
mod events;
mod ledger;
mod mutations;
mod projections;
mod queries;

pub use catalog::{ConstraintDraft, LensDraft};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutoResolvePolicy, LedgerConfig};
pub use conflicts::{ConflictCandidate, ConflictSweep, ResolveRequest};
pub use error::{LedgerError, LedgerResult};
pub use events::{EventBus, LedgerEvent};
pub use ledger::{Ledger, SYSTEM_ACTOR};
pub use mutations::ValidationResult;
pub use projections::ProjectionCache;
pub use queries::{
    ClaimChange, DiffResult, DiffSide, DriftRow, EvaluateInclude, Evaluation, ExplainInput, Explanation,
    LineageEntry, SimulationResult, WeightShift,
};
