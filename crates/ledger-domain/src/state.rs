//! In-memory organism state
//!
//! Used for validation (sequential what-if application of a mutation's
//! changes), simulation, and replay (a left fold over committed mutations).

use crate::claim::{Claim, ClaimSnapshot};
use crate::lens::LensKey;
use crate::mutation::Mutation;
use crate::value::Value;
use crate::{ClaimId, MutationId, OrganismId};
use std::collections::BTreeMap;

/// Claims of one organism keyed by lens
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrganismState {
    /// Owning organism
    pub organism_id: OrganismId,

    /// Claims (including soft-deleted ones)
    pub claims: BTreeMap<LensKey, Claim>,
}

impl OrganismState {
    /// Empty state
    pub fn empty(organism_id: OrganismId) -> Self {
        Self {
            organism_id,
            claims: BTreeMap::new(),
        }
    }

    /// State from stored claims
    pub fn from_claims(organism_id: OrganismId, claims: Vec<Claim>) -> Self {
        Self {
            organism_id,
            claims: claims.into_iter().map(|c| (c.lens.clone(), c)).collect(),
        }
    }

    /// Claim by lens, deleted or not
    pub fn get(&self, lens: &LensKey) -> Option<&Claim> {
        self.claims.get(lens)
    }

    /// Live claim by lens
    pub fn live(&self, lens: &LensKey) -> Option<&Claim> {
        self.claims.get(lens).filter(|c| c.is_live())
    }

    /// Claim by id
    pub fn by_id(&self, claim_id: ClaimId) -> Option<&Claim> {
        self.claims.values().find(|c| c.id == claim_id)
    }

    /// Every live claim, ordered by lens
    pub fn live_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values().filter(|c| c.is_live())
    }

    /// Value of a live claim
    pub fn value(&self, lens: &LensKey) -> Option<&Value> {
        self.live(lens).map(|c| &c.value)
    }

    /// Numeric value of a live claim (resolver lookup)
    pub fn numeric(&self, lens: &LensKey) -> Option<f64> {
        self.value(lens).and_then(Value::as_f64)
    }

    /// Place `snapshot` on the claim at `lens`, creating it when absent
    ///
    /// Lineage is not touched; this is for what-if states.
    pub fn overlay(&mut self, claim_id: ClaimId, lens: &LensKey, snapshot: ClaimSnapshot, now: u64) {
        match self.claims.get_mut(lens) {
            Some(claim) => claim.overlay(snapshot),
            None => {
                let mut claim = Claim::from_snapshot(
                    claim_id,
                    self.organism_id,
                    lens.clone(),
                    snapshot,
                    MutationId::from_value(0),
                    now,
                );
                claim.last_mutation_id = None;
                claim.version = 0;
                self.claims.insert(lens.clone(), claim);
            }
        }
    }

    /// Apply a committed mutation's recorded `after` snapshots with lineage
    pub fn apply_committed(&mut self, mutation: &Mutation) {
        let at = mutation.committed_at.unwrap_or(mutation.updated_at);
        let mut touched: Vec<ClaimId> = Vec::new();
        for change in &mutation.changes {
            let Some(after) = change.after.clone() else {
                continue;
            };
            match self.claims.get_mut(&change.lens) {
                Some(claim) if touched.contains(&claim.id) => claim.overlay(after),
                Some(claim) => {
                    *claim = claim.advanced(after, mutation.id, at);
                    touched.push(claim.id);
                }
                None => {
                    let claim = Claim::from_snapshot(
                        change.claim_id,
                        mutation.organism_id,
                        change.lens.clone(),
                        after,
                        mutation.id,
                        at,
                    );
                    touched.push(claim.id);
                    self.claims.insert(change.lens.clone(), claim);
                }
            }
        }
    }

    /// Rebuild state by folding committed mutations in chain order
    pub fn replay<'a, I>(organism_id: OrganismId, chain: I) -> Self
    where
        I: IntoIterator<Item = &'a Mutation>,
    {
        chain
            .into_iter()
            .filter(|m| m.status.is_applied())
            .fold(Self::empty(organism_id), |mut state, m| {
                state.apply_committed(m);
                state
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Baseline, BaselineMode};
    use crate::mutation::{Change, ChangeOp, MutationStatus};

    fn key(s: &str) -> LensKey {
        LensKey::parse(s).unwrap()
    }

    fn committed(organism_id: OrganismId, changes: Vec<Change>, at: u64) -> Mutation {
        let mut m = Mutation::new(organism_id, "alice", None, changes, at);
        m.status = MutationStatus::Committed;
        m.committed_at = Some(at);
        m
    }

    fn snap(value: f64) -> ClaimSnapshot {
        ClaimSnapshot {
            value: Value::from(value),
            weight: 0.5,
            baseline: Baseline::new(BaselineMode::Snapshot, Value::from(value), 0),
            constraints: vec![],
            deleted: false,
        }
    }

    #[test]
    fn test_replay_folds_chain() {
        let org = OrganismId::new();
        let claim_id = ClaimId::new();
        let lens = key("pricing.floor");

        let first = committed(
            org,
            vec![Change {
                claim_id,
                lens: lens.clone(),
                op: ChangeOp::Set { value: Value::from(1.0) },
                expected_version: None,
                before: None,
                after: Some(snap(1.0)),
            }],
            10,
        );
        let second = committed(
            org,
            vec![Change {
                claim_id,
                lens: lens.clone(),
                op: ChangeOp::Set { value: Value::from(2.0) },
                expected_version: Some(1),
                before: Some(snap(1.0)),
                after: Some(snap(2.0)),
            }],
            20,
        );

        let state = OrganismState::replay(org, [&first, &second]);
        let claim = state.get(&lens).unwrap();
        assert_eq!(claim.value, Value::from(2.0));
        assert_eq!(claim.version, 2);
        assert_eq!(claim.last_mutation_id, Some(second.id));
        assert_eq!(claim.created_at, 10);

        let partial = OrganismState::replay(org, [&first]);
        assert_eq!(partial.numeric(&lens), Some(1.0));
    }

    #[test]
    fn test_two_changes_same_claim_bump_once() {
        let org = OrganismId::new();
        let claim_id = ClaimId::new();
        let lens = key("pricing.floor");
        let change = |v: f64| Change {
            claim_id,
            lens: lens.clone(),
            op: ChangeOp::Set { value: Value::from(v) },
            expected_version: Some(1),
            before: None,
            after: Some(snap(v)),
        };

        let mut state = OrganismState::empty(org);
        state.overlay(claim_id, &lens, snap(0.0), 0);
        state.claims.get_mut(&lens).unwrap().version = 1;

        state.apply_committed(&committed(org, vec![change(1.0), change(2.0)], 5));
        let claim = state.get(&lens).unwrap();
        assert_eq!(claim.version, 2);
        assert_eq!(claim.value, Value::from(2.0));
    }
}
