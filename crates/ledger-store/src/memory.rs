//! In-memory store

use crate::{check_commit_target, check_mutation_update};
use ledger_domain::traits::{
    Catalog, ClaimFilter, ClaimStore, CommitBatch, CommitReceipt, ConflictFilter, ConflictLedger, MutationLog,
};
use ledger_domain::{
    Claim, ClaimId, Conflict, ConflictId, Constraint, ConstraintId, Lens, LensKey, Mutation, MutationId,
    MutationStatus, Organism, OrganismId, StoreError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Inner {
    organisms: BTreeMap<OrganismId, Organism>,
    lenses: BTreeMap<LensKey, Lens>,
    constraints: BTreeMap<ConstraintId, Vec<Constraint>>,
    claims: HashMap<ClaimId, Claim>,
    claim_index: HashMap<(OrganismId, LensKey), ClaimId>,
    mutations: BTreeMap<MutationId, Mutation>,
    chains: HashMap<OrganismId, Vec<MutationId>>,
    conflicts: BTreeMap<ConflictId, Conflict>,
}

/// Process-local store
///
/// One `RwLock` guards everything, so a commit batch is trivially atomic and
/// readers never see half of one.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

impl ClaimStore for MemoryStore {
    fn get_claim(&self, id: ClaimId) -> Result<Option<Claim>, StoreError> {
        Ok(self.read()?.claims.get(&id).cloned())
    }

    fn find_claim(&self, organism_id: OrganismId, lens: &LensKey) -> Result<Option<Claim>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .claim_index
            .get(&(organism_id, lens.clone()))
            .and_then(|id| inner.claims.get(id))
            .cloned())
    }

    fn list_claims(&self, organism_id: OrganismId, filter: &ClaimFilter) -> Result<Vec<Claim>, StoreError> {
        let inner = self.read()?;
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.organism_id == organism_id)
            .filter(|c| filter.include_deleted || c.is_live())
            .filter(|c| filter.cluster.as_deref().is_none_or(|cl| c.lens.cluster() == cl))
            .cloned()
            .collect();
        claims.sort_by(|a, b| a.lens.cmp(&b.lens));
        Ok(claims)
    }

    fn apply_changes(&self, batch: CommitBatch) -> Result<CommitReceipt, StoreError> {
        let mut inner = self.write()?;
        check_commit_target(inner.mutations.get(&batch.mutation.id), &batch.mutation)?;

        // Check everything before touching anything
        for write in &batch.writes {
            let claim = &write.claim;
            match write.expected_version {
                None => {
                    if inner.claims.contains_key(&claim.id) {
                        return Err(StoreError::Duplicate {
                            kind: "claim",
                            id: format!("{} ({})", claim.id, claim.lens),
                        });
                    }
                    // Another writer created the lens first
                    let key = (claim.organism_id, claim.lens.clone());
                    if let Some(holder) = inner.claim_index.get(&key).and_then(|id| inner.claims.get(id)) {
                        return Err(StoreError::VersionConflict {
                            claim_id: holder.id,
                            current_version: holder.version,
                            expected_version: 0,
                        });
                    }
                }
                Some(expected) => {
                    let current = inner.claims.get(&claim.id).ok_or_else(|| StoreError::NotFound {
                        kind: "claim",
                        id: claim.id.to_string(),
                    })?;
                    if current.version != expected {
                        return Err(StoreError::VersionConflict {
                            claim_id: claim.id,
                            current_version: current.version,
                            expected_version: expected,
                        });
                    }
                }
            }
        }

        let mut mutation = batch.mutation;
        mutation.prev_mutation_id = inner.chains.get(&batch.organism_id).and_then(|c| c.last()).copied();

        let mut claims = Vec::with_capacity(batch.writes.len());
        for write in batch.writes {
            let claim = write.claim;
            inner
                .claim_index
                .insert((claim.organism_id, claim.lens.clone()), claim.id);
            inner.claims.insert(claim.id, claim.clone());
            claims.push(claim);
        }

        inner.chains.entry(batch.organism_id).or_default().push(mutation.id);
        inner.mutations.insert(mutation.id, mutation.clone());

        Ok(CommitReceipt { mutation, claims })
    }
}

impl MutationLog for MemoryStore {
    fn put_mutation(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        check_mutation_update(inner.mutations.get(&mutation.id), mutation)?;
        inner.mutations.insert(mutation.id, mutation.clone());
        Ok(())
    }

    fn get_mutation(&self, id: MutationId) -> Result<Option<Mutation>, StoreError> {
        Ok(self.read()?.mutations.get(&id).cloned())
    }

    fn list_mutations(
        &self,
        organism_id: Option<OrganismId>,
        status: Option<MutationStatus>,
    ) -> Result<Vec<Mutation>, StoreError> {
        Ok(self
            .read()?
            .mutations
            .values()
            .filter(|m| organism_id.is_none_or(|o| o == m.organism_id))
            .filter(|m| status.is_none_or(|s| s == m.status))
            .cloned()
            .collect())
    }

    fn chain(&self, organism_id: OrganismId) -> Result<Vec<Mutation>, StoreError> {
        let inner = self.read()?;
        let Some(ids) = inner.chains.get(&organism_id) else {
            return Ok(Vec::new());
        };
        ids.iter()
            .map(|id| {
                inner.mutations.get(id).cloned().ok_or_else(|| StoreError::InvalidData(format!(
                    "chain of {} references missing mutation {}",
                    organism_id, id
                )))
            })
            .collect()
    }

    fn head(&self, organism_id: OrganismId) -> Result<Option<MutationId>, StoreError> {
        Ok(self.read()?.chains.get(&organism_id).and_then(|c| c.last()).copied())
    }
}

impl ConflictLedger for MemoryStore {
    fn put_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        self.write()?.conflicts.insert(conflict.id, conflict.clone());
        Ok(())
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<Conflict>, StoreError> {
        Ok(self.read()?.conflicts.get(&id).cloned())
    }

    fn list_conflicts(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StoreError> {
        Ok(self
            .read()?
            .conflicts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }
}

impl Catalog for MemoryStore {
    fn put_organism(&self, organism: &Organism) -> Result<(), StoreError> {
        self.write()?.organisms.insert(organism.id, organism.clone());
        Ok(())
    }

    fn get_organism(&self, id: OrganismId) -> Result<Option<Organism>, StoreError> {
        Ok(self.read()?.organisms.get(&id).cloned())
    }

    fn list_organisms(&self) -> Result<Vec<Organism>, StoreError> {
        Ok(self.read()?.organisms.values().cloned().collect())
    }

    fn put_lens(&self, lens: &Lens) -> Result<(), StoreError> {
        self.write()?.lenses.insert(lens.key.clone(), lens.clone());
        Ok(())
    }

    fn get_lens(&self, key: &LensKey) -> Result<Option<Lens>, StoreError> {
        Ok(self.read()?.lenses.get(key).cloned())
    }

    fn list_lenses(&self) -> Result<Vec<Lens>, StoreError> {
        Ok(self.read()?.lenses.values().cloned().collect())
    }

    fn put_constraint(&self, constraint: &Constraint) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let versions = inner.constraints.entry(constraint.id).or_default();
        match versions.iter_mut().find(|c| c.version == constraint.version) {
            Some(existing) => *existing = constraint.clone(),
            None => {
                versions.push(constraint.clone());
                versions.sort_by_key(|c| c.version);
            }
        }
        Ok(())
    }

    fn get_constraint(&self, id: ConstraintId) -> Result<Option<Constraint>, StoreError> {
        Ok(self
            .read()?
            .constraints
            .get(&id)
            .and_then(|versions| versions.last())
            .cloned())
    }

    fn list_constraints(&self) -> Result<Vec<Constraint>, StoreError> {
        Ok(self
            .read()?
            .constraints
            .values()
            .filter_map(|versions| versions.last())
            .cloned()
            .collect())
    }

    fn constraint_history(&self, id: ConstraintId) -> Result<Vec<Constraint>, StoreError> {
        Ok(self.read()?.constraints.get(&id).cloned().unwrap_or_default())
    }
}
