//! Trait definitions for storage
//!
//! These traits define the boundary between the ledger engine and its
//! persistence. Implementations live in the store crate.
//!
//! All methods take `&self`: implementations guard their own state so one
//! store can be shared across threads behind an `Arc`.

use crate::{
    Claim, ClaimId, Conflict, ConflictId, ConflictSeverity, ConflictStatus, ConflictType, Constraint,
    ConstraintId, Lens, LensKey, Mutation, MutationId, MutationStatus, Organism, OrganismId, StoreError,
};

/// Claim write inside an atomic commit batch
#[derive(Debug, Clone)]
pub struct ClaimWrite {
    /// New claim state (version already advanced)
    pub claim: Claim,

    /// Version the writer observed; `None` inserts a new claim
    pub expected_version: Option<u64>,
}

/// Everything one commit writes, applied all-or-nothing
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// Organism whose chain advances
    pub organism_id: OrganismId,

    /// The committed mutation; `prev_mutation_id` is assigned by the store
    pub mutation: Mutation,

    /// Claim states to write
    pub writes: Vec<ClaimWrite>,
}

/// What an atomic commit produced
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    /// Mutation as stored (chain pointer assigned)
    pub mutation: Mutation,

    /// Claims as stored
    pub claims: Vec<Claim>,
}

/// Query criteria for listing claims
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Restrict to one lens cluster
    pub cluster: Option<String>,

    /// Include soft-deleted claims
    pub include_deleted: bool,
}

/// Query criteria for listing conflicts
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    /// Owning organism
    pub organism_id: Option<OrganismId>,

    /// Status
    pub status: Option<ConflictStatus>,

    /// Severity
    pub severity: Option<ConflictSeverity>,

    /// Trigger type
    pub conflict_type: Option<ConflictType>,

    /// Involved claim
    pub claim_id: Option<ClaimId>,
}

impl ConflictFilter {
    /// Whether a conflict passes the filter
    pub fn matches(&self, conflict: &Conflict) -> bool {
        self.organism_id.is_none_or(|o| o == conflict.organism_id)
            && self.status.is_none_or(|s| s == conflict.status)
            && self.severity.is_none_or(|s| s == conflict.severity)
            && self.conflict_type.is_none_or(|t| t == conflict.conflict_type)
            && self.claim_id.is_none_or(|c| conflict.involves(c))
    }
}

/// Claim storage with atomic compare-and-swap commits
pub trait ClaimStore: Send + Sync {
    /// Get a claim by id
    fn get_claim(&self, id: ClaimId) -> Result<Option<Claim>, StoreError>;

    /// Get the claim an organism holds for a lens (deleted or not)
    fn find_claim(&self, organism_id: OrganismId, lens: &LensKey) -> Result<Option<Claim>, StoreError>;

    /// List an organism's claims ordered by lens
    fn list_claims(&self, organism_id: OrganismId, filter: &ClaimFilter) -> Result<Vec<Claim>, StoreError>;

    /// Atomically check every expected version, write every claim, store the
    /// mutation with `prev_mutation_id` set to the organism head, and advance
    /// the head. Nothing is written when any check fails.
    fn apply_changes(&self, batch: CommitBatch) -> Result<CommitReceipt, StoreError>;
}

/// Append-only mutation log
pub trait MutationLog: Send + Sync {
    /// Insert or update a mutation record
    ///
    /// Terminal records (committed, rejected, rolled back, expired) may only
    /// move committed -> rolled back; anything else is `Immutable`.
    fn put_mutation(&self, mutation: &Mutation) -> Result<(), StoreError>;

    /// Get a mutation by id
    fn get_mutation(&self, id: MutationId) -> Result<Option<Mutation>, StoreError>;

    /// List mutations, optionally by organism and status, oldest first
    fn list_mutations(
        &self,
        organism_id: Option<OrganismId>,
        status: Option<MutationStatus>,
    ) -> Result<Vec<Mutation>, StoreError>;

    /// An organism's committed chain, oldest first
    fn chain(&self, organism_id: OrganismId) -> Result<Vec<Mutation>, StoreError>;

    /// Latest committed mutation of an organism
    fn head(&self, organism_id: OrganismId) -> Result<Option<MutationId>, StoreError>;
}

/// Conflict records; status changes only, no delete
pub trait ConflictLedger: Send + Sync {
    /// Insert or update a conflict
    fn put_conflict(&self, conflict: &Conflict) -> Result<(), StoreError>;

    /// Get a conflict by id
    fn get_conflict(&self, id: ConflictId) -> Result<Option<Conflict>, StoreError>;

    /// List conflicts, oldest first
    fn list_conflicts(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StoreError>;
}

/// Organisms, lenses and versioned constraints
pub trait Catalog: Send + Sync {
    /// Insert or update an organism
    fn put_organism(&self, organism: &Organism) -> Result<(), StoreError>;

    /// Get an organism
    fn get_organism(&self, id: OrganismId) -> Result<Option<Organism>, StoreError>;

    /// List organisms, oldest first
    fn list_organisms(&self) -> Result<Vec<Organism>, StoreError>;

    /// Insert or replace a lens by key
    fn put_lens(&self, lens: &Lens) -> Result<(), StoreError>;

    /// Get a lens by key
    fn get_lens(&self, key: &LensKey) -> Result<Option<Lens>, StoreError>;

    /// List lenses ordered by key
    fn list_lenses(&self) -> Result<Vec<Lens>, StoreError>;

    /// Store a constraint version; the latest version becomes current
    fn put_constraint(&self, constraint: &Constraint) -> Result<(), StoreError>;

    /// Current version of a constraint
    fn get_constraint(&self, id: ConstraintId) -> Result<Option<Constraint>, StoreError>;

    /// Current versions of every constraint
    fn list_constraints(&self) -> Result<Vec<Constraint>, StoreError>;

    /// Every stored version of a constraint, oldest first
    fn constraint_history(&self, id: ConstraintId) -> Result<Vec<Constraint>, StoreError>;
}

/// Everything the ledger needs from a backend
pub trait LedgerStore: ClaimStore + MutationLog + ConflictLedger + Catalog {}

impl<T> LedgerStore for T where T: ClaimStore + MutationLog + ConflictLedger + Catalog {}
