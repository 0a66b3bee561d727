//! Domain-level error types shared by every store backend

use crate::ClaimId;
use thiserror::Error;

/// Errors returned by store implementations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind ("claim", "mutation", ...)
        kind: &'static str,
        /// Offending identifier or key
        id: String,
    },

    /// Record already exists
    #[error("{kind} already exists: {id}")]
    Duplicate {
        /// Record kind
        kind: &'static str,
        /// Offending identifier or key
        id: String,
    },

    /// Compare-and-swap on a claim version lost
    #[error("Version conflict on {claim_id}: expected {expected_version}, current {current_version}")]
    VersionConflict {
        /// Claim whose version moved
        claim_id: ClaimId,
        /// Version found in the store
        current_version: u64,
        /// Version the writer expected
        expected_version: u64,
    },

    /// Attempt to rewrite a terminal record
    #[error("Immutable record: {0}")]
    Immutable(String),

    /// Stored data could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A lock guarding the store was poisoned
    #[error("Store lock poisoned")]
    Poisoned,

    /// Backend failure (database, I/O)
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Illegal state-machine transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    /// Entity kind ("mutation", "conflict")
    pub entity: &'static str,
    /// Current state
    pub from: String,
    /// Requested state
    pub to: String,
}
