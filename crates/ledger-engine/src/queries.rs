//! Read-only queries: evaluate, diff, explain, simulate, replay
//!
//! None of these write to the store. Historical reads rebuild claim state by
//! folding the committed chain up to `as_of` and take constraints and
//! conflicts at the version or status they had at that instant.

use crate::{ConflictCandidate, Ledger, LedgerError, LedgerResult};
use ledger_domain::drift::{self, CoherenceBreakdown};
use ledger_domain::{
    BaselineMode, ChangeRequest, Claim, ClaimId, ClaimSnapshot, Conflict, ConstraintResult, Formula,
    Lens, LensKey, Mutation, MutationId, MutationStatus, OrganismId, OrganismState, Value,
};
use ledger_domain::traits::ClaimFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Sections an evaluation returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluateInclude {
    /// Active conflicts
    pub conflicts: bool,
    /// Constraint results over the whole organism
    pub constraints: bool,
    /// Per-claim drift rows
    pub drift: bool,
    /// An explanation per lens
    pub explain: bool,
}

impl Default for EvaluateInclude {
    fn default() -> Self {
        Self {
            conflicts: true,
            constraints: true,
            drift: true,
            explain: false,
        }
    }
}

/// Drift of one live claim
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftRow {
    /// Lens
    pub lens: LensKey,
    /// Claim
    pub claim_id: ClaimId,
    /// Current value
    pub value: Value,
    /// Reference value
    pub baseline: Value,
    /// Reference mode
    pub mode: BaselineMode,
    /// Distance to the baseline in [0, 1]
    pub drift: f64,
    /// Drift × weight
    pub weighted_drift: f64,
    /// Claim weight
    pub weight: f64,
}

/// Coherence report of an organism
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Organism evaluated
    pub organism_id: OrganismId,
    /// Coherence in [0, 1]
    pub coherence: f64,
    /// Weighted mean drift
    pub total_drift: f64,
    /// Burdens and weights behind the score
    pub breakdown: CoherenceBreakdown,
    /// Drift rows, when requested
    pub drift: Vec<DriftRow>,
    /// Active conflicts, when requested
    pub conflicts: Vec<Conflict>,
    /// Constraint results, when requested
    pub constraint_results: Vec<ConstraintResult>,
    /// Explanations, when requested
    pub explain: Vec<Explanation>,
}

/// One side of a diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSide {
    /// Organism
    pub organism_id: OrganismId,
    /// Instant to read at; current state when absent
    #[serde(default)]
    pub as_of: Option<u64>,
}

/// A lens whose value differs between the sides
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimChange {
    /// Lens
    pub lens: LensKey,
    /// Left value
    pub left: Value,
    /// Right value
    pub right: Value,
    /// Left claim
    pub left_claim_id: ClaimId,
    /// Right claim
    pub right_claim_id: ClaimId,
}

/// A lens whose weight differs between the sides
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightShift {
    /// Lens
    pub lens: LensKey,
    /// Left weight
    pub left: f64,
    /// Right weight
    pub right: f64,
    /// right − left
    pub delta: f64,
}

/// Comparison of two organism states
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// Lenses held on both sides with different values
    pub changed: Vec<ClaimChange>,
    /// Lenses held only on the right
    pub added: Vec<LensKey>,
    /// Lenses held only on the left
    pub removed: Vec<LensKey>,
    /// Weight changes on lenses held on both sides
    pub weight_shifts: Vec<WeightShift>,
    /// Left coherence
    pub coherence_left: f64,
    /// Right coherence
    pub coherence_right: f64,
    /// right − left
    pub coherence_delta: f64,
}

/// Input of a computed lens
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainInput {
    /// Input lens
    pub lens: LensKey,
    /// Its current value
    pub value: Option<Value>,
}

/// A committed mutation that touched a claim
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEntry {
    /// Mutation
    pub mutation_id: MutationId,
    /// Who proposed it
    pub actor: String,
    /// Why
    pub intent: Option<String>,
    /// Committed or rolled back
    pub status: MutationStatus,
    /// Commit time
    pub committed_at: Option<u64>,
    /// Ops applied to the claim, in order
    pub ops: Vec<String>,
    /// Claim state before the mutation
    pub before: Option<ClaimSnapshot>,
    /// Claim state after the mutation
    pub after: Option<ClaimSnapshot>,
}

/// Where a lens value comes from
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    /// Organism
    pub organism_id: OrganismId,
    /// Lens explained
    pub lens: LensKey,
    /// Claim holding the lens
    pub claim: Option<Claim>,
    /// Current or computed value
    pub value: Option<Value>,
    /// Whether the value came from a resolver
    pub computed: bool,
    /// Resolver formula of a computed lens
    pub resolver: Option<Formula>,
    /// Resolver inputs and their values
    pub inputs: Vec<ExplainInput>,
    /// Drift of the claim
    pub drift: Option<f64>,
    /// Mutations that touched the claim, newest first
    pub lineage: Vec<LineageEntry>,
}

/// Outcome of applying changes to a throwaway copy of an organism
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    /// Coherence now
    pub coherence_before: f64,
    /// Coherence with the changes applied
    pub coherence_after: f64,
    /// Conflicts a commit would record
    pub conflicts_would_create: Vec<ConflictCandidate>,
    /// Failing constraint results, one line each
    pub warnings: Vec<String>,
}

fn drift_rows(state: &OrganismState, lenses: &BTreeMap<LensKey, Lens>) -> Vec<DriftRow> {
    state
        .live_claims()
        .map(|claim| {
            let scale = lenses.get(&claim.lens).and_then(Lens::distance_scale);
            DriftRow {
                lens: claim.lens.clone(),
                claim_id: claim.id,
                value: claim.value.clone(),
                baseline: claim.baseline.value.clone(),
                mode: claim.baseline.mode,
                drift: drift::drift(claim, scale),
                weighted_drift: drift::weighted_drift(claim, scale),
                weight: claim.weight,
            }
        })
        .collect()
}

fn lineage(chain: &[Mutation], claim_id: ClaimId) -> Vec<LineageEntry> {
    chain
        .iter()
        .rev()
        .filter(|m| m.touches(claim_id))
        .map(|m| {
            let changes: Vec<_> = m.changes.iter().filter(|c| c.claim_id == claim_id).collect();
            LineageEntry {
                mutation_id: m.id,
                actor: m.actor.clone(),
                intent: m.intent.clone(),
                status: m.status,
                committed_at: m.committed_at,
                ops: changes.iter().map(|c| c.op.name().to_string()).collect(),
                before: changes.first().and_then(|c| c.before.clone()),
                after: changes.last().and_then(|c| c.after.clone()),
            }
        })
        .collect()
}

fn explanation(
    organism_id: OrganismId,
    lens: &LensKey,
    state: &OrganismState,
    lenses: &BTreeMap<LensKey, Lens>,
    chain: &[Mutation],
) -> Option<Explanation> {
    let claim = state.get(lens);
    let formula = lenses
        .get(lens)
        .and_then(|l| l.resolver.as_ref())
        .map(|r| r.formula.clone());
    if claim.is_none() && formula.is_none() {
        return None;
    }

    let live = claim.filter(|c| c.is_live());
    let computed = live.is_none() && formula.is_some();
    let value = match (live, &formula) {
        (Some(c), _) => Some(c.value.clone()),
        (None, Some(f)) => f.evaluate(|input| state.numeric(input)).map(Value::Number),
        (None, None) => None,
    };
    let inputs = formula
        .as_ref()
        .map(|f| {
            f.inputs()
                .into_iter()
                .map(|input| ExplainInput {
                    value: state.value(&input).cloned(),
                    lens: input,
                })
                .collect()
        })
        .unwrap_or_default();
    let scale = lenses.get(lens).and_then(Lens::distance_scale);

    Some(Explanation {
        organism_id,
        lens: lens.clone(),
        drift: live.map(|c| drift::drift(c, scale)),
        lineage: claim.map(|c| lineage(chain, c.id)).unwrap_or_default(),
        claim: claim.cloned(),
        value,
        computed,
        resolver: formula,
        inputs,
    })
}

impl Ledger {
    /// Rebuild an organism's claims from its committed chain
    ///
    /// Only mutations committed at or before `as_of` are folded; with no
    /// `as_of` the whole chain is.
    pub fn replay(&self, organism_id: OrganismId, as_of: Option<u64>) -> LedgerResult<OrganismState> {
        self.load_organism(organism_id)?;
        let chain = self.chain(organism_id)?;
        let folded = chain
            .iter()
            .filter(|m| as_of.is_none_or(|at| m.committed_at.is_some_and(|c| c <= at)));
        Ok(OrganismState::replay(organism_id, folded))
    }

    /// Stored claims of an organism, live ones only unless the filter says otherwise
    pub fn list_claims(&self, organism_id: OrganismId, filter: &ClaimFilter) -> LedgerResult<Vec<Claim>> {
        self.load_organism(organism_id)?;
        Ok(self.store.list_claims(organism_id, filter)?)
    }

    /// Coherence, drift, conflicts and constraint results of an organism
    pub fn evaluate(&self, organism_id: OrganismId, include: EvaluateInclude) -> LedgerResult<Evaluation> {
        let organism = self.load_organism(organism_id)?;
        let lenses = self.lens_map()?;
        let constraints = self.current_constraints()?;
        let state = self.current_state(organism_id)?;
        let conflicts = self.active_conflicts_at(organism_id, None)?;
        let assessment = self.assess(&organism, &state, &lenses, &constraints, &conflicts);

        let explain = if include.explain {
            let chain = self.chain(organism_id)?;
            state
                .live_claims()
                .filter_map(|claim| explanation(organism_id, &claim.lens, &state, &lenses, &chain))
                .collect()
        } else {
            Vec::new()
        };

        debug!(
            organism = %organism_id,
            coherence = assessment.breakdown.coherence,
            conflicts = conflicts.len(),
            "Organism evaluated"
        );
        Ok(Evaluation {
            organism_id,
            coherence: assessment.breakdown.coherence,
            total_drift: assessment.breakdown.total_drift,
            drift: if include.drift { drift_rows(&state, &lenses) } else { Vec::new() },
            conflicts: if include.conflicts { conflicts } else { Vec::new() },
            constraint_results: if include.constraints { assessment.results } else { Vec::new() },
            breakdown: assessment.breakdown,
            explain,
        })
    }

    fn coherence_at(&self, side: &DiffSide) -> LedgerResult<(OrganismState, f64)> {
        let organism = self.load_organism(side.organism_id)?;
        let lenses = self.lens_map()?;
        let constraints = self.constraints_at(side.as_of)?;
        let state = self.state_at(side.organism_id, side.as_of)?;
        let conflicts = self.active_conflicts_at(side.organism_id, side.as_of)?;
        let coherence = self
            .assess(&organism, &state, &lenses, &constraints, &conflicts)
            .breakdown
            .coherence;
        Ok((state, coherence))
    }

    /// Compare two organism states, matching claims by lens
    ///
    /// Either side may be historical; both may name the same organism.
    pub fn diff(&self, left: DiffSide, right: DiffSide) -> LedgerResult<DiffResult> {
        let (left_state, coherence_left) = self.coherence_at(&left)?;
        let (right_state, coherence_right) = self.coherence_at(&right)?;
        let epsilon = self.evaluator.config().epsilon;

        let mut result = DiffResult {
            changed: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            weight_shifts: Vec::new(),
            coherence_left,
            coherence_right,
            coherence_delta: coherence_right - coherence_left,
        };
        for l in left_state.live_claims() {
            let Some(r) = right_state.live(&l.lens) else {
                result.removed.push(l.lens.clone());
                continue;
            };
            if !l.value.loosely_eq(&r.value, epsilon) {
                result.changed.push(ClaimChange {
                    lens: l.lens.clone(),
                    left: l.value.clone(),
                    right: r.value.clone(),
                    left_claim_id: l.id,
                    right_claim_id: r.id,
                });
            }
            if (r.weight - l.weight).abs() > epsilon {
                result.weight_shifts.push(WeightShift {
                    lens: l.lens.clone(),
                    left: l.weight,
                    right: r.weight,
                    delta: r.weight - l.weight,
                });
            }
        }
        result.added = right_state
            .live_claims()
            .filter(|r| left_state.live(&r.lens).is_none())
            .map(|r| r.lens.clone())
            .collect();
        Ok(result)
    }

    /// Value, resolver and lineage of one lens of an organism
    pub fn explain(&self, organism_id: OrganismId, lens: &LensKey) -> LedgerResult<Explanation> {
        self.load_organism(organism_id)?;
        let lenses = self.lens_map()?;
        let state = self.current_state(organism_id)?;
        let chain = self.chain(organism_id)?;
        explanation(organism_id, lens, &state, &lenses, &chain)
            .ok_or_else(|| LedgerError::not_found("claim", format!("{} on {}", lens, organism_id)))
    }

    /// Apply changes to a copy of an organism and report the effect; nothing
    /// is persisted
    pub fn simulate(&self, organism_id: OrganismId, changes: Vec<ChangeRequest>) -> LedgerResult<SimulationResult> {
        if changes.is_empty() {
            return Err(LedgerError::InvalidOperation(
                "a simulation needs at least one change".into(),
            ));
        }
        let organism = self.load_organism(organism_id)?;
        let now = self.now();
        let lenses = self.lens_map()?;
        let constraints = self.current_constraints()?;
        let base = self.current_state(organism_id)?;
        let conflicts = self.organism_conflicts(organism_id)?;
        let active: Vec<Conflict> = conflicts.iter().filter(|c| c.is_active()).cloned().collect();

        let before = self.assess(&organism, &base, &lenses, &constraints, &active);
        let prepared = self.prepare_changes(&base, changes, &lenses, now)?;
        let simulation = self.run_changes(&organism, &base, &prepared, &lenses, &constraints, now)?;
        let after = self.assess(&organism, &simulation.state, &lenses, &constraints, &active);
        let candidates = self.new_candidates(&organism, &simulation.state, &lenses, &constraints, &conflicts);

        let added_burden: f64 = candidates.iter().map(|c| c.score * c.mean_weight).sum();
        let coherence_after = drift::coherence(
            after.breakdown.conflict_burden + added_burden,
            after.breakdown.constraint_burden.unwrap_or(f64::INFINITY),
            after.breakdown.total_drift,
            self.config.coherence_weights,
        )
        .coherence;

        let warnings = simulation
            .results
            .iter()
            .filter(|r| r.blocks())
            .map(|r| format!("{} ({}): {}", r.constraint_name, r.severity, r.evidence.detail))
            .collect();

        Ok(SimulationResult {
            coherence_before: before.breakdown.coherence,
            coherence_after,
            conflicts_would_create: candidates,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_domain::{Baseline, Change, ChangeOp};

    fn key(s: &str) -> LensKey {
        LensKey::parse(s).unwrap()
    }

    fn committed(org: OrganismId, claim_id: ClaimId, op: ChangeOp, value: f64, at: u64) -> Mutation {
        let after = ClaimSnapshot {
            value: Value::from(value),
            weight: 0.5,
            baseline: Baseline::new(BaselineMode::Declared, Value::from(10.0), 0),
            constraints: vec![],
            deleted: false,
        };
        let change = Change {
            claim_id,
            lens: key("pricing.floor"),
            op,
            expected_version: None,
            before: None,
            after: Some(after),
        };
        let mut m = Mutation::new(org, "alice", None, vec![change], at);
        m.status = MutationStatus::Committed;
        m.committed_at = Some(at);
        m
    }

    #[test]
    fn test_lineage_newest_first() {
        let org = OrganismId::new();
        let claim_id = ClaimId::new();
        let first = committed(org, claim_id, ChangeOp::Set { value: Value::from(12.0) }, 12.0, 10);
        let second = committed(org, claim_id, ChangeOp::Set { value: Value::from(14.0) }, 14.0, 20);
        let unrelated = committed(org, ClaimId::new(), ChangeOp::Delete, 0.0, 30);

        let entries = lineage(&[first.clone(), second.clone(), unrelated], claim_id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mutation_id, second.id);
        assert_eq!(entries[1].mutation_id, first.id);
        assert_eq!(entries[0].ops, vec!["set".to_string()]);
    }

    #[test]
    fn test_explain_needs_claim_or_resolver() {
        let org = OrganismId::new();
        let state = OrganismState::empty(org);
        assert!(explanation(org, &key("pricing.floor"), &state, &BTreeMap::new(), &[]).is_none());
    }

    #[test]
    fn test_default_include_skips_explain() {
        let include = EvaluateInclude::default();
        assert!(include.conflicts && include.constraints && include.drift);
        assert!(!include.explain);
    }
}
