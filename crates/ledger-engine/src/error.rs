//! Ledger error types

use ledger_domain::{
    ChangeError, ClaimId, ConflictId, ConstraintResult, LensKey, MutationId, RepairHint, StoreError, TransitionError,
};
use serde_json::json;
use thiserror::Error;

/// Errors returned by ledger operations
///
/// Every rejection carries enough structured evidence to build a corrective
/// mutation; see [`LedgerError::details`].
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// A hard constraint failed; nothing was written
    #[error("{} hard constraint(s) failed", results.len())]
    ConstraintHardFail {
        /// Failing results
        results: Vec<ConstraintResult>,
        /// Suggested fixes gathered from the results
        repair_hints: Vec<RepairHint>,
    },

    /// A soft constraint failed and no tradeoff covers it
    #[error("tradeoff required for {}", join(lenses))]
    TradeoffRequired {
        /// Lenses a tradeoff must reference
        lenses: Vec<LensKey>,
        /// Uncovered soft failures
        results: Vec<ConstraintResult>,
    },

    /// An active existential conflict must be resolved first
    #[error("blocked by {} unresolved existential conflict(s)", conflict_ids.len())]
    ConflictUnresolved {
        /// Blocking conflicts
        conflict_ids: Vec<ConflictId>,
    },

    /// Optimistic-concurrency collision; re-propose against fresh state
    #[error("version conflict on {claim_id}: current {current_version}, expected {expected_version}")]
    VersionConflict {
        /// Contended claim
        claim_id: ClaimId,
        /// Version in the store
        current_version: u64,
        /// Version the mutation was built against
        expected_version: u64,
    },

    /// The operation would orphan or rewrite history
    #[error("lineage violation: {0}")]
    LineageViolation(String),

    /// Unknown identifier
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind
        kind: &'static str,
        /// Identifier as given
        id: String,
    },

    /// Malformed request or op that cannot apply
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Actor is not registered
    #[error("unknown actor: {0}")]
    UnknownActor(String),

    /// Proposal outlived its TTL
    #[error("mutation {0} has expired")]
    MutationExpired(MutationId),

    /// Lifecycle misuse
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Backend failure
    #[error("store error: {0}")]
    Store(StoreError),
}

fn join(lenses: &[LensKey]) -> String {
    lenses.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", ")
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                claim_id,
                current_version,
                expected_version,
            } => LedgerError::VersionConflict {
                claim_id,
                current_version,
                expected_version,
            },
            StoreError::NotFound { kind, id } => LedgerError::NotFound { kind, id },
            other => LedgerError::Store(other),
        }
    }
}

impl From<ChangeError> for LedgerError {
    fn from(err: ChangeError) -> Self {
        LedgerError::InvalidOperation(err.to_string())
    }
}

impl LedgerError {
    /// Shorthand for a missing entity
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable wire code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::ConstraintHardFail { .. } => "CONSTRAINT_HARD_FAIL",
            LedgerError::TradeoffRequired { .. } => "TRADEOFF_REQUIRED",
            LedgerError::ConflictUnresolved { .. } => "CONFLICT_UNRESOLVED",
            LedgerError::VersionConflict { .. } => "VERSION_CONFLICT",
            LedgerError::LineageViolation(_) => "LINEAGE_VIOLATION",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::InvalidOperation(_) => "INVALID_OPERATION",
            LedgerError::UnknownActor(_) => "UNKNOWN_ACTOR",
            LedgerError::MutationExpired(_) => "MUTATION_EXPIRED",
            LedgerError::InvalidTransition(_) => "INVALID_TRANSITION",
            LedgerError::Store(_) => "STORE_ERROR",
        }
    }

    /// Only version conflicts are safe to retry (with fresh reads)
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::VersionConflict { .. })
    }

    /// Structured evidence for the error envelope
    pub fn details(&self) -> serde_json::Value {
        match self {
            LedgerError::ConstraintHardFail { results, repair_hints } => json!({
                "results": results,
                "repairHints": repair_hints,
            }),
            LedgerError::TradeoffRequired { lenses, results } => json!({
                "lenses": lenses,
                "results": results,
            }),
            LedgerError::ConflictUnresolved { conflict_ids } => json!({ "conflictIds": conflict_ids }),
            LedgerError::VersionConflict {
                claim_id,
                current_version,
                expected_version,
            } => json!({
                "claimId": claim_id,
                "currentVersion": current_version,
                "expectedVersion": expected_version,
            }),
            LedgerError::NotFound { kind, id } => json!({ "kind": kind, "id": id }),
            LedgerError::MutationExpired(id) => json!({ "mutationId": id }),
            LedgerError::InvalidTransition(err) => json!({
                "entity": err.entity,
                "from": err.from,
                "to": err.to,
            }),
            LedgerError::LineageViolation(_)
            | LedgerError::InvalidOperation(_)
            | LedgerError::UnknownActor(_)
            | LedgerError::Store(_) => serde_json::Value::Null,
        }
    }
}

/// Result alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let claim_id = ClaimId::new();
        let err: LedgerError = StoreError::VersionConflict {
            claim_id,
            current_version: 4,
            expected_version: 3,
        }
        .into();
        assert_eq!(err.code(), "VERSION_CONFLICT");
        assert!(err.is_retryable());
        assert_eq!(err.details()["currentVersion"], 4);

        let err: LedgerError = StoreError::Poisoned.into();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_lineage_violation_is_not_retryable() {
        let err = LedgerError::LineageViolation("claim changed later".into());
        assert_eq!(err.code(), "LINEAGE_VIOLATION");
        assert!(!err.is_retryable());
    }
}
