//! Conflict detection, resolution and suppression
//!
//! Three triggers record conflicts, all read off a full evaluation of an
//! organism's committed state:
//!
//! - a failing `exclusion` rule
//! - a failing `weighted_drift_lte` rule whose subject has a declared or
//!   ideal baseline
//! - two passing constraints implying disjoint values for the same lens
//!
//! A trigger is matched to earlier conflicts by fingerprint. Conflicts are
//! never deleted; they move between statuses and keep a history.

use crate::events::LedgerEvent;
use crate::mutations::CommitMode;
use crate::{AutoResolvePolicy, Ledger, LedgerError, LedgerResult, SYSTEM_ACTOR};
use ledger_domain::conflict::{fingerprint, mean_weight};
use ledger_domain::traits::ConflictFilter;
use ledger_domain::{
    BaselineMode, Change, ChangeOp, Claim, ClaimId, Conflict, ConflictId, ConflictOrigin, ConflictSeverity,
    ConflictStatus, ConflictType, Constraint, ConstraintId, Lens, LensKey, Mutation, MutationId, Organism,
    OrganismId, OrganismState, Resolution, ResolutionStrategy, Rule, SeverityInputs, Suppression, Tradeoff,
    TransitionError, Value,
};
use ledger_gatekeeper::{contradictions, EvaluationContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A conflict a trigger would record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCandidate {
    /// Trigger kind
    pub conflict_type: ConflictType,
    /// Governing constraint
    pub constraint_id: ConstraintId,
    /// Its version
    pub constraint_version: u32,
    /// Involved claims
    pub claims: Vec<ClaimId>,
    /// Involved lenses
    pub lenses: Vec<LensKey>,
    /// Mean weight of the involved claims
    pub mean_weight: f64,
    /// Whether a governing constraint is hard
    pub hard: bool,
    /// Whether an involved claim has a declared or ideal baseline
    pub reference_baseline: bool,
    /// Score with no prior occurrences
    pub score: f64,
    /// Severity with no prior occurrences
    pub severity: ConflictSeverity,
    /// Identity used to match earlier conflicts
    pub fingerprint: String,
    /// What fired
    pub detail: String,
}

impl ConflictCandidate {
    fn new(
        conflict_type: ConflictType,
        lead: &Constraint,
        hard: bool,
        claims: Vec<ClaimId>,
        lenses: Vec<LensKey>,
        state: &OrganismState,
        detail: String,
    ) -> Self {
        let involved: Vec<&Claim> = claims.iter().filter_map(|id| state.by_id(*id)).collect();
        let inputs = severity_inputs(&involved, hard, 0);
        let score = inputs.score();
        Self {
            fingerprint: fingerprint(conflict_type, Some(lead.id), &claims),
            conflict_type,
            constraint_id: lead.id,
            constraint_version: lead.version,
            claims,
            lenses,
            mean_weight: inputs.mean_weight,
            hard,
            reference_baseline: inputs.reference_baseline,
            score,
            severity: ConflictSeverity::from_score(score),
            detail,
        }
    }

    fn inputs(&self, prior_occurrences: u32) -> SeverityInputs {
        SeverityInputs {
            mean_weight: self.mean_weight,
            hard: self.hard,
            reference_baseline: self.reference_baseline,
            prior_occurrences,
        }
    }
}

fn severity_inputs(claims: &[&Claim], hard: bool, prior_occurrences: u32) -> SeverityInputs {
    let weights: Vec<f64> = claims.iter().map(|c| c.weight).collect();
    SeverityInputs {
        mean_weight: mean_weight(&weights),
        hard,
        reference_baseline: claims.iter().any(|c| c.baseline.mode.is_reference()),
        prior_occurrences,
    }
}

fn join_values(values: &[Value]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}

/// What one detection pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSweep {
    /// New conflicts
    pub created: Vec<ConflictId>,
    /// Active conflicts whose trigger fired again
    pub updated: Vec<ConflictId>,
    /// Suppressed conflicts whose trigger fired again
    pub reactivated: Vec<ConflictId>,
    /// Active conflicts whose trigger no longer fires
    pub cleared: Vec<ConflictId>,
}

/// Conflict resolution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// How to resolve
    pub strategy: ResolutionStrategy,
    /// Claim kept
    #[serde(default)]
    pub chosen_claim_id: Option<ClaimId>,
    /// Claims given up; every other involved claim when empty and a claim was chosen
    #[serde(default)]
    pub sacrificed: Vec<ClaimId>,
    /// Mandatory tradeoff referencing one of the conflict's lenses
    pub tradeoff: Tradeoff,
    /// Who resolves
    pub actor: String,
}

fn claim_change(claim: &Claim, op: ChangeOp) -> Change {
    Change {
        claim_id: claim.id,
        lens: claim.lens.clone(),
        op,
        expected_version: Some(claim.version),
        before: None,
        after: None,
    }
}

/// Changes carrying out a resolution strategy
fn resolution_changes(
    strategy: ResolutionStrategy,
    chosen: Option<ClaimId>,
    sacrificed: &[ClaimId],
    state: &OrganismState,
) -> LedgerResult<Vec<Change>> {
    let live = |id: &ClaimId| state.by_id(*id).filter(|c| c.is_live());
    if strategy == ResolutionStrategy::Rebaseline {
        let id = chosen.ok_or_else(|| LedgerError::InvalidOperation("rebaseline needs chosenClaimId".into()))?;
        let claim = live(&id).ok_or_else(|| LedgerError::not_found("claim", id))?;
        return Ok(vec![claim_change(
            claim,
            ChangeOp::Rebaseline {
                mode: BaselineMode::Declared,
                value: None,
            },
        )]);
    }

    if sacrificed.is_empty() {
        return Err(LedgerError::InvalidOperation(format!(
            "{} needs sacrificed claims or a chosen claim",
            strategy.as_str()
        )));
    }
    Ok(sacrificed
        .iter()
        .filter_map(live)
        .map(|claim| {
            let op = match strategy {
                ResolutionStrategy::Demote => ChangeOp::Reweight { weight: 0.0 },
                ResolutionStrategy::Revert => ChangeOp::Set {
                    value: claim.baseline.value.clone(),
                },
                _ => ChangeOp::Delete,
            };
            claim_change(claim, op)
        })
        .collect())
}

/// Winner under the auto-resolution policy, with the rule that picked it
fn pick_winner(policy: &AutoResolvePolicy, claims: &[&Claim], constraints: &[Constraint]) -> Option<(ClaimId, &'static str)> {
    if claims.len() < 2 {
        return None;
    }

    if let Some(threshold) = policy.weight_delta_threshold {
        let mut by_weight = claims.to_vec();
        by_weight.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        if by_weight[0].weight - by_weight[1].weight > threshold {
            return Some((by_weight[0].id, "weight delta"));
        }
    }

    if policy.hard_beats_soft {
        let hard: Vec<&&Claim> = claims
            .iter()
            .filter(|claim| {
                claim
                    .constraints
                    .iter()
                    .any(|id| constraints.iter().any(|c| c.id == *id && c.active && c.is_hard()))
            })
            .collect();
        if hard.len() == 1 {
            return Some((hard[0].id, "hard beats soft"));
        }
    }

    if policy.baseline_mode_precedence {
        let top = claims.iter().map(|c| c.baseline.mode.precedence()).max()?;
        let leaders: Vec<&&Claim> = claims
            .iter()
            .filter(|c| c.baseline.mode.precedence() == top)
            .collect();
        if leaders.len() == 1 {
            return Some((leaders[0].id, "baseline mode precedence"));
        }
    }
    None
}

impl Ledger {
    /// Every trigger firing on `state`
    pub(crate) fn candidates(
        &self,
        organism: &Organism,
        state: &OrganismState,
        lenses: &BTreeMap<LensKey, Lens>,
        constraints: &[Constraint],
    ) -> Vec<ConflictCandidate> {
        let ctx = EvaluationContext::new(organism, state, lenses);
        let results = self.evaluator.evaluate_organism(constraints, &ctx);
        let governing = |id: ConstraintId| {
            constraints
                .iter()
                .find(|c| c.id == id)
                .filter(|c| c.on_fail.create_conflict)
        };

        let mut candidates = Vec::new();
        for result in results.iter().filter(|r| r.blocks()) {
            let Some(constraint) = governing(result.constraint_id) else {
                continue;
            };
            let conflict_type = match constraint.rule {
                Rule::Exclusion { .. } => ConflictType::ExclusionConstraint,
                Rule::WeightedDriftLte { .. } => {
                    let reference = result
                        .subject
                        .and_then(|id| state.by_id(id))
                        .is_some_and(|c| c.baseline.mode.is_reference());
                    if !reference {
                        continue;
                    }
                    ConflictType::BaselineViolation
                }
                _ => continue,
            };
            candidates.push(ConflictCandidate::new(
                conflict_type,
                constraint,
                constraint.is_hard(),
                result.involved_claims.clone(),
                result.lenses.clone(),
                state,
                result.evidence.detail.clone(),
            ));
        }

        for (a, b) in contradictions(&results, self.evaluator.config().epsilon) {
            let (Some(first), Some(second)) = (governing(a.constraint_id), governing(b.constraint_id)) else {
                continue;
            };
            let lead = if second.is_hard() && !first.is_hard() { second } else { first };
            let mut claims: Vec<ClaimId> = Vec::new();
            for id in [a.because, b.because].into_iter().flatten() {
                if !claims.contains(&id) {
                    claims.push(id);
                }
            }
            let detail = format!(
                "{} requires {} in [{}] while {} requires it in [{}]",
                first.name,
                a.lens,
                join_values(&a.values),
                second.name,
                join_values(&b.values)
            );
            candidates.push(ConflictCandidate::new(
                ConflictType::Derived,
                lead,
                first.is_hard() || second.is_hard(),
                claims,
                vec![a.lens.clone()],
                state,
                detail,
            ));
        }
        candidates
    }

    /// Candidates not already recorded as active conflicts
    pub(crate) fn new_candidates(
        &self,
        organism: &Organism,
        state: &OrganismState,
        lenses: &BTreeMap<LensKey, Lens>,
        constraints: &[Constraint],
        existing: &[Conflict],
    ) -> Vec<ConflictCandidate> {
        let mut fresh: Vec<ConflictCandidate> = Vec::new();
        for candidate in self.candidates(organism, state, lenses, constraints) {
            let recorded = existing
                .iter()
                .any(|c| c.is_active() && c.fingerprint == candidate.fingerprint);
            if !recorded && !fresh.iter().any(|f| f.fingerprint == candidate.fingerprint) {
                fresh.push(candidate);
            }
        }
        fresh
    }

    /// Reconcile conflict records with the organism's committed state
    pub(crate) fn detect_conflicts(
        &self,
        organism: &Organism,
        mutation_id: Option<MutationId>,
        now: u64,
    ) -> LedgerResult<ConflictSweep> {
        let lenses = self.lens_map()?;
        let constraints = self.current_constraints()?;
        let state = self.current_state(organism.id)?;
        let mut existing = self.organism_conflicts(organism.id)?;
        let mut sweep = ConflictSweep::default();
        let mut fired: Vec<String> = Vec::new();

        for candidate in self.candidates(organism, &state, &lenses, &constraints) {
            if fired.contains(&candidate.fingerprint) {
                continue;
            }
            fired.push(candidate.fingerprint.clone());

            let print = candidate.fingerprint.as_str();
            if let Some(conflict) = existing.iter_mut().find(|c| c.fingerprint == print && c.is_active()) {
                let before = conflict.severity;
                conflict.rescore(candidate.inputs(conflict.prior_occurrences), now);
                conflict.still_triggered = true;
                self.store.put_conflict(conflict)?;
                sweep.updated.push(conflict.id);
                if conflict.severity != before {
                    self.events.publish(LedgerEvent::ConflictUpdated {
                        organism_id: organism.id,
                        conflict_id: conflict.id,
                        severity: conflict.severity,
                    });
                }
            } else if let Some(conflict) = existing
                .iter_mut()
                .find(|c| c.fingerprint == print && c.status == ConflictStatus::Suppressed)
            {
                conflict.transition(ConflictStatus::Active, "trigger fired again", now)?;
                conflict.suppression = None;
                conflict.rescore(candidate.inputs(conflict.prior_occurrences + 1), now);
                conflict.still_triggered = true;
                self.store.put_conflict(conflict)?;
                sweep.reactivated.push(conflict.id);
                self.events.publish(LedgerEvent::ConflictReactivated {
                    organism_id: organism.id,
                    conflict_id: conflict.id,
                });
                info!(conflict = %conflict.id, severity = %conflict.severity, "Suppressed conflict reactivated");
            } else {
                let prior = existing.iter().filter(|c| c.fingerprint == print).count() as u32;
                let origin = ConflictOrigin {
                    constraint_id: Some(candidate.constraint_id),
                    constraint_version: Some(candidate.constraint_version),
                    mutation_id,
                };
                let conflict = Conflict::new(
                    organism.id,
                    candidate.conflict_type,
                    candidate.claims.clone(),
                    candidate.lenses.clone(),
                    origin,
                    candidate.inputs(prior),
                    candidate.detail.clone(),
                    now,
                );
                self.store.put_conflict(&conflict)?;
                sweep.created.push(conflict.id);
                self.events.publish(LedgerEvent::ConflictCreated {
                    organism_id: organism.id,
                    conflict_id: conflict.id,
                    severity: conflict.severity,
                });
                warn!(
                    conflict = %conflict.id,
                    organism = %organism.id,
                    conflict_type = %conflict.conflict_type,
                    severity = %conflict.severity,
                    score = conflict.score,
                    "Conflict created"
                );
                existing.push(conflict);
            }
        }

        for conflict in existing
            .iter_mut()
            .filter(|c| c.is_active() && c.still_triggered && !fired.contains(&c.fingerprint))
        {
            conflict.still_triggered = false;
            conflict.last_evaluated_at = now;
            self.store.put_conflict(conflict)?;
            sweep.cleared.push(conflict.id);
        }

        debug!(
            organism = %organism.id,
            created = sweep.created.len(),
            updated = sweep.updated.len(),
            reactivated = sweep.reactivated.len(),
            cleared = sweep.cleared.len(),
            "Conflicts reconciled"
        );
        Ok(sweep)
    }

    /// Get a conflict
    pub fn get_conflict(&self, id: ConflictId) -> LedgerResult<Conflict> {
        self.load_conflict(id)
    }

    /// Conflicts matching `filter`, oldest first
    pub fn list_conflicts(&self, filter: &ConflictFilter) -> LedgerResult<Vec<Conflict>> {
        Ok(self.store.list_conflicts(filter)?)
    }

    /// Resolve an active conflict through a compensating mutation
    pub fn resolve(&self, conflict_id: ConflictId, request: ResolveRequest) -> LedgerResult<Conflict> {
        self.resolve_with(conflict_id, request, false)
    }

    fn resolve_with(&self, conflict_id: ConflictId, request: ResolveRequest, automatic: bool) -> LedgerResult<Conflict> {
        self.check_actor(&request.actor)?;
        let conflict = self.load_conflict(conflict_id)?;
        if !conflict.is_active() {
            return Err(TransitionError {
                entity: "conflict",
                from: conflict.status.to_string(),
                to: ConflictStatus::Resolved.to_string(),
            }
            .into());
        }
        if !conflict.lenses.iter().any(|l| request.tradeoff.references(l)) {
            return Err(LedgerError::TradeoffRequired {
                lenses: conflict.lenses.clone(),
                results: Vec::new(),
            });
        }
        if let Some(stranger) = request
            .sacrificed
            .iter()
            .chain(request.chosen_claim_id.iter())
            .find(|id| !conflict.involves(**id))
        {
            return Err(LedgerError::InvalidOperation(format!(
                "claim {} is not part of conflict {}",
                stranger, conflict_id
            )));
        }

        let sacrificed: Vec<ClaimId> = match (request.sacrificed.is_empty(), request.chosen_claim_id) {
            (true, Some(chosen)) => conflict.claims.iter().copied().filter(|id| *id != chosen).collect(),
            _ => request.sacrificed.clone(),
        };
        let state = self.current_state(conflict.organism_id)?;
        let changes = resolution_changes(request.strategy, request.chosen_claim_id, &sacrificed, &state)?;

        let mutation = Mutation::new(
            conflict.organism_id,
            request.actor.as_str(),
            Some(format!("resolve {} ({})", conflict_id, request.strategy.as_str())),
            changes,
            self.now(),
        )
        .with_ttl(self.config.proposal_ttl_ms);
        self.store.put_mutation(&mutation)?;
        let committed = self.commit_as(mutation.id, vec![request.tradeoff.clone()], None, CommitMode::Compensating)?;

        // reload: detection after the commit may have rescored it
        let now = self.now();
        let mut conflict = self.load_conflict(conflict_id)?;
        conflict.transition(
            ConflictStatus::Resolved,
            format!("resolved by {}", request.strategy.as_str()),
            now,
        )?;
        conflict.resolution = Some(Resolution {
            strategy: request.strategy,
            chosen_claim_id: request.chosen_claim_id,
            sacrificed,
            tradeoff: request.tradeoff,
            mutation_id: committed.id,
            resolved_by: request.actor,
            resolved_at: now,
            automatic,
        });
        self.store.put_conflict(&conflict)?;
        self.events.publish(LedgerEvent::ConflictResolved {
            organism_id: conflict.organism_id,
            conflict_id,
            mutation_id: committed.id,
        });
        self.invalidate_projections(conflict.organism_id);
        info!(
            conflict = %conflict_id,
            mutation = %committed.id,
            strategy = request.strategy.as_str(),
            automatic,
            "Conflict resolved"
        );
        Ok(conflict)
    }

    /// Resolve a fresh conflict under the auto-resolution policy, if a rule
    /// picks a winner
    pub(crate) fn auto_resolve(&self, conflict_id: ConflictId) -> LedgerResult<Option<Conflict>> {
        let conflict = self.load_conflict(conflict_id)?;
        if !conflict.is_active() || conflict.claims.len() < 2 {
            return Ok(None);
        }
        let state = self.current_state(conflict.organism_id)?;
        let constraints = self.current_constraints()?;
        let claims: Vec<&Claim> = conflict
            .claims
            .iter()
            .filter_map(|id| state.by_id(*id))
            .filter(|c| c.is_live())
            .collect();

        let Some((chosen, rule)) = pick_winner(&self.config.auto_resolve, &claims, &constraints) else {
            return Ok(None);
        };
        let sacrificed: Vec<ClaimId> = claims.iter().map(|c| c.id).filter(|id| *id != chosen).collect();
        let kept = claims
            .iter()
            .find(|c| c.id == chosen)
            .map(|c| c.lens.to_string())
            .unwrap_or_default();
        let tradeoff = Tradeoff::new(
            conflict.lenses.clone(),
            format!("{} competing claim(s)", sacrificed.len()),
            format!("{} kept", kept),
        )
        .with_rationale(format!("auto-resolved by {} rule", rule))
        .approved_by(SYSTEM_ACTOR);

        self.resolve_with(
            conflict_id,
            ResolveRequest {
                strategy: ResolutionStrategy::Prefer,
                chosen_claim_id: Some(chosen),
                sacrificed,
                tradeoff,
                actor: SYSTEM_ACTOR.to_string(),
            },
            true,
        )
        .map(Some)
    }

    /// Suppress an active conflict, optionally until `expires_at`
    pub fn suppress(
        &self,
        conflict_id: ConflictId,
        reason: &str,
        expires_at: Option<u64>,
        approved_by: &str,
    ) -> LedgerResult<Conflict> {
        if reason.trim().is_empty() {
            return Err(LedgerError::InvalidOperation("suppression needs a reason".into()));
        }
        self.check_actor(approved_by)?;

        let now = self.now();
        let mut conflict = self.load_conflict(conflict_id)?;
        conflict.transition(ConflictStatus::Suppressed, reason, now)?;
        conflict.suppression = Some(Suppression {
            reason: reason.to_string(),
            expires_at,
            approved_by: approved_by.to_string(),
            suppressed_at: now,
        });
        self.store.put_conflict(&conflict)?;
        self.events.publish(LedgerEvent::ConflictSuppressed {
            organism_id: conflict.organism_id,
            conflict_id,
        });
        self.invalidate_projections(conflict.organism_id);
        info!(conflict = %conflict_id, approved_by, expires_at, "Conflict suppressed");
        Ok(conflict)
    }

    /// Reactivate every suppressed conflict whose suppression has lapsed
    pub fn reactivate_expired(&self, now: u64) -> LedgerResult<Vec<ConflictId>> {
        let suppressed = self.store.list_conflicts(&ConflictFilter {
            status: Some(ConflictStatus::Suppressed),
            ..Default::default()
        })?;

        let mut reactivated = Vec::new();
        for mut conflict in suppressed {
            if !conflict.suppression.as_ref().is_some_and(|s| s.has_expired(now)) {
                continue;
            }
            conflict.transition(ConflictStatus::Active, "suppression expired", now)?;
            conflict.suppression = None;
            self.store.put_conflict(&conflict)?;
            self.events.publish(LedgerEvent::ConflictReactivated {
                organism_id: conflict.organism_id,
                conflict_id: conflict.id,
            });
            self.invalidate_projections(conflict.organism_id);
            info!(conflict = %conflict.id, "Suppression expired, conflict reactivated");
            reactivated.push(conflict.id);
        }
        Ok(reactivated)
    }

    /// Re-score an organism's active conflicts from current claim weights
    ///
    /// Returns the conflicts whose score changed.
    pub fn rescore_active(&self, organism_id: OrganismId, now: u64) -> LedgerResult<Vec<ConflictId>> {
        let state = self.current_state(organism_id)?;
        let constraints = self.current_constraints()?;
        let active = self.store.list_conflicts(&ConflictFilter {
            organism_id: Some(organism_id),
            status: Some(ConflictStatus::Active),
            ..Default::default()
        })?;

        let mut changed = Vec::new();
        for mut conflict in active {
            let claims: Vec<&Claim> = conflict.claims.iter().filter_map(|id| state.by_id(*id)).collect();
            let hard = conflict
                .origin
                .constraint_id
                .and_then(|id| constraints.iter().find(|c| c.id == id))
                .is_some_and(Constraint::is_hard);
            let inputs = severity_inputs(&claims, hard, conflict.prior_occurrences);
            if (inputs.score() - conflict.score).abs() <= f64::EPSILON {
                continue;
            }

            let before = conflict.severity;
            conflict.rescore(inputs, now);
            self.store.put_conflict(&conflict)?;
            if conflict.severity != before {
                self.events.publish(LedgerEvent::ConflictUpdated {
                    organism_id,
                    conflict_id: conflict.id,
                    severity: conflict.severity,
                });
            }
            debug!(conflict = %conflict.id, score = conflict.score, severity = %conflict.severity, "Conflict re-scored");
            changed.push(conflict.id);
        }
        if !changed.is_empty() {
            self.invalidate_projections(organism_id);
        }
        Ok(changed)
    }
}
