//! Mutation lifecycle: propose, validate, commit, reject, rollback, expire

use crate::events::LedgerEvent;
use crate::{ConflictCandidate, Ledger, LedgerError, LedgerResult};
use ledger_domain::traits::{ClaimWrite, CommitBatch, ConflictFilter};
use ledger_domain::{
    Change, ChangeOp, ChangeRequest, Claim, ClaimId, ConflictSeverity, ConflictStatus, Constraint, ConstraintResult,
    Lens, LensKey, Mutation, MutationId, MutationStatus, Organism, OrganismId, OrganismState, RepairHint, StoreError,
    Tradeoff, TransitionError,
};
use ledger_gatekeeper::EvaluationContext;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Outcome of validating a mutation against current state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Mutation validated
    pub mutation_id: MutationId,

    /// Blocking hard failures
    pub hard_failures: usize,

    /// Blocking soft failures
    pub soft_failures: usize,

    /// Every result, in change order
    pub results: Vec<ConstraintResult>,

    /// Fixes suggested by the failing results
    pub repair_hints: Vec<RepairHint>,

    /// Conflicts a commit would record
    pub conflicts_would_create: Vec<ConflictCandidate>,

    /// Lenses a tradeoff must reference before commit
    pub missing_tradeoffs: Vec<LensKey>,
}

impl ValidationResult {
    fn new(
        mutation_id: MutationId,
        results: Vec<ConstraintResult>,
        tradeoffs: &[Tradeoff],
        conflicts_would_create: Vec<ConflictCandidate>,
    ) -> Self {
        let uncovered: Vec<&ConstraintResult> = results
            .iter()
            .filter(|r| r.is_soft_failure() && !r.is_covered_by(tradeoffs))
            .collect();
        Self {
            mutation_id,
            hard_failures: results.iter().filter(|r| r.is_hard_failure()).count(),
            soft_failures: results.iter().filter(|r| r.is_soft_failure()).count(),
            repair_hints: results
                .iter()
                .filter(|r| r.blocks())
                .flat_map(|r| r.repair_hints.iter().cloned())
                .collect(),
            missing_tradeoffs: primary_lenses(uncovered),
            conflicts_would_create,
            results,
        }
    }

    /// No hard failure and every soft failure covered
    pub fn is_committable(&self) -> bool {
        self.hard_failures == 0 && self.missing_tradeoffs.is_empty()
    }
}

/// How a commit treats soft failures and blocking conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitMode {
    /// Caller-driven commit
    Normal,
    /// Rollback or conflict resolution: exempt from blocking conflicts, soft
    /// failures accepted with a generated tradeoff, no auto-resolution
    Compensating,
}

/// Changes applied in order to a what-if copy of an organism
pub(crate) struct Simulation {
    pub state: OrganismState,
    pub changes: Vec<Change>,
    pub results: Vec<ConstraintResult>,
}

/// Lens each result is about, de-duplicated in first-seen order
fn primary_lenses<'a, I>(results: I) -> Vec<LensKey>
where
    I: IntoIterator<Item = &'a ConstraintResult>,
{
    let mut lenses: Vec<LensKey> = Vec::new();
    for result in results {
        let lens = result.lens.clone().or_else(|| result.lenses.first().cloned());
        if let Some(lens) = lens {
            if !lenses.contains(&lens) {
                lenses.push(lens);
            }
        }
    }
    lenses
}

/// Resolve a request's target against the working state
fn resolve_target(state: &OrganismState, request: &ChangeRequest) -> LedgerResult<(ClaimId, LensKey)> {
    match (request.claim_id, &request.lens) {
        (Some(id), lens) => {
            let claim = state.by_id(id).ok_or_else(|| LedgerError::not_found("claim", id))?;
            if let Some(lens) = lens.as_ref().filter(|l| **l != claim.lens) {
                return Err(LedgerError::InvalidOperation(format!(
                    "claim {} holds lens {}, not {}",
                    id, claim.lens, lens
                )));
            }
            Ok((id, claim.lens.clone()))
        }
        (None, Some(lens)) => match state.get(lens) {
            Some(claim) => Ok((claim.id, lens.clone())),
            None if matches!(request.op, ChangeOp::Create { .. }) => Ok((ClaimId::new(), lens.clone())),
            None => Err(LedgerError::not_found("claim", lens)),
        },
        (None, None) => Err(LedgerError::InvalidOperation(
            "a change needs a claimId or a lens".into(),
        )),
    }
}

/// Apply one change to `state` in place and return it with snapshots recorded
fn apply_change(
    state: &mut OrganismState,
    change: &Change,
    lenses: &BTreeMap<LensKey, Lens>,
    now: u64,
) -> LedgerResult<Change> {
    let current = state.get(&change.lens);
    if let Some(holder) = current.filter(|c| c.id != change.claim_id) {
        return Err(LedgerError::VersionConflict {
            claim_id: holder.id,
            current_version: holder.version,
            expected_version: 0,
        });
    }

    let before = current.map(Claim::snapshot);
    // create over a soft-deleted claim revives it
    let revive = matches!(change.op, ChangeOp::Create { .. }) && before.as_ref().is_some_and(|b| b.deleted);
    let from = if revive { None } else { before.as_ref() };
    let after = change.op.apply(from, now).map_err(|e| {
        LedgerError::InvalidOperation(format!("{} on {}: {}", change.op.name(), change.lens, e))
    })?;

    let writes_value = matches!(
        change.op,
        ChangeOp::Create { .. } | ChangeOp::Set { .. } | ChangeOp::Merge { .. }
    );
    if let Some(lens) = lenses.get(&change.lens).filter(|_| writes_value) {
        let problems = lens.check(&after.value);
        if !problems.is_empty() {
            return Err(LedgerError::InvalidOperation(problems.join("; ")));
        }
    }

    state.overlay(change.claim_id, &change.lens, after.clone(), now);
    Ok(Change {
        before,
        after: Some(after),
        ..change.clone()
    })
}

/// Compare each touched claim's stored version with the one proposed against
fn check_versions(mutation: &Mutation, base: &OrganismState) -> LedgerResult<()> {
    let mut seen: Vec<ClaimId> = Vec::new();
    for change in &mutation.changes {
        if seen.contains(&change.claim_id) {
            continue;
        }
        seen.push(change.claim_id);

        let current = base.by_id(change.claim_id).map(|c| c.version);
        match (current, change.expected_version) {
            (Some(version), Some(expected)) if version == expected => {}
            (None, None) => {
                if let Some(holder) = base.get(&change.lens) {
                    return Err(LedgerError::VersionConflict {
                        claim_id: holder.id,
                        current_version: holder.version,
                        expected_version: 0,
                    });
                }
            }
            (current, expected) => {
                return Err(LedgerError::VersionConflict {
                    claim_id: change.claim_id,
                    current_version: current.unwrap_or(0),
                    expected_version: expected.unwrap_or(0),
                })
            }
        }
    }
    Ok(())
}

impl Ledger {
    /// Propose a mutation
    ///
    /// Targets are resolved and every change is dry-applied so malformed ops
    /// fail here, but no constraint is evaluated yet.
    pub fn propose(
        &self,
        organism_id: OrganismId,
        actor: &str,
        changes: Vec<ChangeRequest>,
        intent: Option<String>,
    ) -> LedgerResult<Mutation> {
        if changes.is_empty() {
            return Err(LedgerError::InvalidOperation(
                "a mutation needs at least one change".into(),
            ));
        }
        self.check_actor(actor)?;
        self.writable_organism(organism_id)?;

        let now = self.now();
        let lenses = self.lens_map()?;
        let base = self.current_state(organism_id)?;
        let prepared = self.prepare_changes(&base, changes, &lenses, now)?;

        let mutation =
            Mutation::new(organism_id, actor, intent, prepared, now).with_ttl(self.config.proposal_ttl_ms);
        self.store.put_mutation(&mutation)?;
        info!(
            mutation = %mutation.id,
            organism = %organism_id,
            actor,
            changes = mutation.changes.len(),
            "Mutation proposed"
        );
        Ok(mutation)
    }

    /// Resolve targets and dry-apply requests in order
    pub(crate) fn prepare_changes(
        &self,
        base: &OrganismState,
        requests: Vec<ChangeRequest>,
        lenses: &BTreeMap<LensKey, Lens>,
        now: u64,
    ) -> LedgerResult<Vec<Change>> {
        let mut working = base.clone();
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            if matches!(request.op, ChangeOp::Restore { .. }) {
                return Err(LedgerError::InvalidOperation(
                    "restore is reserved for compensating mutations".into(),
                ));
            }
            let (claim_id, lens) = resolve_target(&working, &request)?;
            if lenses.get(&lens).is_some_and(Lens::is_computed) {
                return Err(LedgerError::InvalidOperation(format!(
                    "lens {} is computed and cannot be written",
                    lens
                )));
            }
            let change = Change {
                claim_id,
                expected_version: base.get(&lens).filter(|c| c.id == claim_id).map(|c| c.version),
                lens,
                op: request.op,
                before: None,
                after: None,
            };
            prepared.push(apply_change(&mut working, &change, lenses, now)?);
        }
        Ok(prepared)
    }

    /// Apply `changes` sequentially to a copy of `base`, evaluating the
    /// constraints each step impacts against the state that step produced
    pub(crate) fn run_changes(
        &self,
        organism: &Organism,
        base: &OrganismState,
        changes: &[Change],
        lenses: &BTreeMap<LensKey, Lens>,
        constraints: &[Constraint],
        now: u64,
    ) -> LedgerResult<Simulation> {
        let mut state = base.clone();
        let mut applied = Vec::with_capacity(changes.len());
        let mut results = Vec::new();

        for (step, change) in changes.iter().enumerate() {
            let previous = state.clone();
            applied.push(apply_change(&mut state, change, lenses, now)?);

            let ctx = EvaluationContext::new(organism, &state, lenses)
                .with_previous(&previous)
                .at_step(step);
            let targets = self
                .evaluator
                .impacted(constraints, &ctx, std::slice::from_ref(&change.lens));
            results.extend(self.evaluator.evaluate_targets(&targets, &ctx));
        }

        Ok(Simulation {
            state,
            changes: applied,
            results,
        })
    }

    /// Validate a mutation against current state
    ///
    /// With `dry_run` nothing is written. Otherwise the mutation moves to
    /// `validated` and records the results.
    pub fn validate(&self, id: MutationId, dry_run: bool) -> LedgerResult<ValidationResult> {
        let now = self.now();
        let mut mutation = self.load_mutation(id)?;
        self.ensure_pending(&mut mutation, MutationStatus::Validated, !dry_run, now)?;

        let organism = self.load_organism(mutation.organism_id)?;
        let lenses = self.lens_map()?;
        let constraints = self.current_constraints()?;
        let base = self.current_state(organism.id)?;
        let simulation = self.run_changes(&organism, &base, &mutation.changes, &lenses, &constraints, now)?;

        let existing = self.organism_conflicts(organism.id)?;
        let candidates = self.new_candidates(&organism, &simulation.state, &lenses, &constraints, &existing);
        let result = ValidationResult::new(id, simulation.results, &mutation.tradeoffs, candidates);

        if !dry_run {
            mutation.constraint_results = result.results.clone();
            mutation.transition(MutationStatus::Validated, None, now)?;
            self.store.put_mutation(&mutation)?;
        }

        info!(
            mutation = %id,
            dry_run,
            hard = result.hard_failures,
            soft = result.soft_failures,
            conflicts = result.conflicts_would_create.len(),
            "Mutation validated"
        );
        Ok(result)
    }

    /// Commit a mutation
    ///
    /// Re-validates against current state. A hard failure rejects the mutation
    /// and writes nothing. An uncovered soft failure returns
    /// [`LedgerError::TradeoffRequired`] and leaves it validated. Otherwise
    /// every claim is written in one compare-and-swap batch.
    pub fn commit(&self, id: MutationId, tradeoffs: Vec<Tradeoff>, comment: Option<String>) -> LedgerResult<Mutation> {
        self.commit_as(id, tradeoffs, comment, CommitMode::Normal)
    }

    pub(crate) fn commit_as(
        &self,
        id: MutationId,
        mut tradeoffs: Vec<Tradeoff>,
        comment: Option<String>,
        mode: CommitMode,
    ) -> LedgerResult<Mutation> {
        let now = self.now();
        let mut mutation = self.load_mutation(id)?;
        self.ensure_pending(&mut mutation, MutationStatus::Committed, true, now)?;
        if tradeoffs.iter().any(Tradeoff::is_empty) {
            return Err(LedgerError::InvalidOperation(
                "a tradeoff must name a lens and what was sacrificed or gained".into(),
            ));
        }

        let organism = self.writable_organism(mutation.organism_id)?;
        let base = self.current_state(organism.id)?;
        if let Err(err) = check_versions(&mutation, &base) {
            return Err(self.reject_stale(mutation, err, now));
        }
        if mode == CommitMode::Normal {
            self.check_blocking_conflicts(&mutation)?;
        }

        let lenses = self.lens_map()?;
        let constraints = self.current_constraints()?;
        let simulation = self.run_changes(&organism, &base, &mutation.changes, &lenses, &constraints, now)?;

        let hard: Vec<ConstraintResult> = simulation
            .results
            .iter()
            .filter(|r| r.is_hard_failure())
            .cloned()
            .collect();
        if !hard.is_empty() {
            let repair_hints: Vec<RepairHint> = hard.iter().flat_map(|r| r.repair_hints.iter().cloned()).collect();
            let reason = format!("{} hard constraint failure(s)", hard.len());
            mutation.constraint_results = simulation.results;
            mutation.transition(MutationStatus::Rejected, Some(reason.clone()), now)?;
            self.store.put_mutation(&mutation)?;
            self.emit_constraint_failures(&mutation, &constraints);
            self.events.publish(LedgerEvent::MutationRejected {
                organism_id: organism.id,
                mutation_id: id,
                reason: reason.clone(),
            });
            warn!(mutation = %id, organism = %organism.id, %reason, "Mutation rejected");
            return Err(LedgerError::ConstraintHardFail { results: hard, repair_hints });
        }

        let uncovered: Vec<ConstraintResult> = simulation
            .results
            .iter()
            .filter(|r| r.is_soft_failure() && !r.is_covered_by(&tradeoffs))
            .cloned()
            .collect();
        if !uncovered.is_empty() {
            let needed = primary_lenses(&uncovered);
            match mode {
                CommitMode::Normal => {
                    mutation.constraint_results = simulation.results;
                    mutation.transition(MutationStatus::Validated, None, now)?;
                    self.store.put_mutation(&mutation)?;
                    info!(mutation = %id, lenses = needed.len(), "Tradeoff required");
                    return Err(LedgerError::TradeoffRequired {
                        lenses: needed,
                        results: uncovered,
                    });
                }
                CommitMode::Compensating => tradeoffs.push(
                    Tradeoff::new(needed, "soft constraint conformance", "restored prior state")
                        .with_rationale(format!("accepted while committing {}", id))
                        .approved_by(mutation.actor.clone()),
                ),
            }
        }

        let pending = mutation.clone();
        let writes = self.build_writes(&mutation, &base, &simulation, now)?;
        mutation.changes = simulation.changes;
        mutation.tradeoffs = tradeoffs;
        mutation.constraint_results = simulation.results;
        if comment.is_some() {
            mutation.comment = comment;
        }
        if mutation.status == MutationStatus::Proposed {
            mutation.transition(MutationStatus::Validated, None, now)?;
        }
        mutation.transition(MutationStatus::Committed, None, now)?;

        let receipt = match self.store.apply_changes(CommitBatch {
            organism_id: organism.id,
            mutation,
            writes,
        }) {
            Ok(receipt) => receipt,
            Err(err @ StoreError::VersionConflict { .. }) => return Err(self.reject_stale(pending, err.into(), now)),
            Err(err) => return Err(err.into()),
        };

        info!(
            mutation = %id,
            organism = %organism.id,
            claims = receipt.claims.len(),
            tradeoffs = receipt.mutation.tradeoffs.len(),
            "Mutation committed"
        );
        self.after_commit(&organism, &receipt.mutation, &constraints, mode);
        Ok(receipt.mutation)
    }

    /// Claim versions to write, in first-touch order
    fn build_writes(
        &self,
        mutation: &Mutation,
        base: &OrganismState,
        simulation: &Simulation,
        now: u64,
    ) -> LedgerResult<Vec<ClaimWrite>> {
        let mut writes = Vec::new();
        for claim_id in mutation.touched_claims() {
            let settled = simulation.state.by_id(claim_id).ok_or_else(|| {
                LedgerError::Store(StoreError::InvalidData(format!(
                    "claim {} vanished during validation",
                    claim_id
                )))
            })?;
            let expected_version = mutation
                .changes
                .iter()
                .find(|c| c.claim_id == claim_id)
                .and_then(|c| c.expected_version);
            let claim = match base.by_id(claim_id) {
                Some(stored) => stored.advanced(settled.snapshot(), mutation.id, now),
                None => Claim::from_snapshot(
                    claim_id,
                    mutation.organism_id,
                    settled.lens.clone(),
                    settled.snapshot(),
                    mutation.id,
                    now,
                ),
            };
            writes.push(ClaimWrite {
                claim,
                expected_version,
            });
        }
        Ok(writes)
    }

    /// Post-commit work; failures are logged, never returned
    fn after_commit(&self, organism: &Organism, mutation: &Mutation, constraints: &[Constraint], mode: CommitMode) {
        self.events.publish(LedgerEvent::MutationCommitted {
            organism_id: organism.id,
            mutation_id: mutation.id,
            claims: mutation.touched_claims(),
        });
        self.emit_constraint_failures(mutation, constraints);

        let at = mutation.committed_at.unwrap_or(mutation.updated_at);
        let sweep = match self.detect_conflicts(organism, Some(mutation.id), at) {
            Ok(sweep) => sweep,
            Err(e) => {
                warn!(mutation = %mutation.id, error = %e, "Conflict detection failed after commit");
                self.invalidate_projections(organism.id);
                return;
            }
        };
        self.invalidate_projections(organism.id);

        if mode == CommitMode::Normal && self.config.auto_resolve.enabled {
            for conflict_id in &sweep.created {
                match self.auto_resolve(*conflict_id) {
                    Ok(Some(conflict)) => debug!(conflict = %conflict.id, "Conflict auto-resolved"),
                    Ok(None) => {}
                    Err(e) => warn!(conflict = %conflict_id, error = %e, "Auto-resolution failed"),
                }
            }
        }
    }

    fn emit_constraint_failures(&self, mutation: &Mutation, constraints: &[Constraint]) {
        for result in mutation.constraint_results.iter().filter(|r| r.blocks()) {
            let emits = constraints
                .iter()
                .any(|c| c.id == result.constraint_id && c.on_fail.emit_event);
            if emits {
                self.events.publish(LedgerEvent::ConstraintFailed {
                    organism_id: mutation.organism_id,
                    constraint_id: result.constraint_id,
                    subject: result.subject,
                    mutation_id: mutation.id,
                });
            }
        }
    }

    /// Refuse value or weight changes to claims held by an existential conflict
    fn check_blocking_conflicts(&self, mutation: &Mutation) -> LedgerResult<()> {
        let touched: Vec<ClaimId> = mutation
            .changes
            .iter()
            .filter(|c| c.op.touches_value_or_weight())
            .map(|c| c.claim_id)
            .collect();
        if touched.is_empty() {
            return Ok(());
        }
        let conflict_ids: Vec<_> = self
            .store
            .list_conflicts(&ConflictFilter {
                organism_id: Some(mutation.organism_id),
                status: Some(ConflictStatus::Active),
                severity: Some(ConflictSeverity::Existential),
                ..Default::default()
            })?
            .into_iter()
            .filter(|c| touched.iter().any(|id| c.involves(*id)))
            .map(|c| c.id)
            .collect();
        if conflict_ids.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::ConflictUnresolved { conflict_ids })
        }
    }

    /// Mark a mutation rejected after losing a version race; returns `err`
    fn reject_stale(&self, mut mutation: Mutation, err: LedgerError, now: u64) -> LedgerError {
        let reason = "version conflict".to_string();
        let recorded = mutation
            .transition(MutationStatus::Rejected, Some(reason.clone()), now)
            .map_err(LedgerError::from)
            .and_then(|_| self.store.put_mutation(&mutation).map_err(LedgerError::from));
        match recorded {
            Ok(()) => self.events.publish(LedgerEvent::MutationRejected {
                organism_id: mutation.organism_id,
                mutation_id: mutation.id,
                reason,
            }),
            Err(e) => warn!(mutation = %mutation.id, error = %e, "Could not record version conflict"),
        }
        warn!(mutation = %mutation.id, error = %err, "Mutation lost a version race");
        err
    }

    /// Pending and not expired; an expired proposal is recorded as such when
    /// `record_expiry` is set
    fn ensure_pending(
        &self,
        mutation: &mut Mutation,
        next: MutationStatus,
        record_expiry: bool,
        now: u64,
    ) -> LedgerResult<()> {
        if !mutation.status.is_pending() {
            return Err(TransitionError {
                entity: "mutation",
                from: mutation.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        if mutation.is_expired(now) {
            if record_expiry {
                self.expire(mutation, now)?;
            }
            return Err(LedgerError::MutationExpired(mutation.id));
        }
        Ok(())
    }

    fn expire(&self, mutation: &mut Mutation, now: u64) -> LedgerResult<()> {
        mutation.transition(MutationStatus::Expired, Some("proposal TTL elapsed".into()), now)?;
        self.store.put_mutation(mutation)?;
        info!(mutation = %mutation.id, organism = %mutation.organism_id, "Mutation expired");
        Ok(())
    }

    /// Reject a pending mutation
    pub fn reject(&self, id: MutationId, reason: &str) -> LedgerResult<Mutation> {
        let now = self.now();
        let mut mutation = self.load_mutation(id)?;
        mutation.transition(MutationStatus::Rejected, Some(reason.to_string()), now)?;
        self.store.put_mutation(&mutation)?;
        self.events.publish(LedgerEvent::MutationRejected {
            organism_id: mutation.organism_id,
            mutation_id: id,
            reason: reason.to_string(),
        });
        info!(mutation = %id, reason, "Mutation rejected");
        Ok(mutation)
    }

    /// Roll back a committed mutation with a compensating one
    ///
    /// The compensating mutation restores every touched claim to its recorded
    /// `before` snapshot (claims the mutation created are soft-deleted). It is
    /// refused with [`LedgerError::LineageViolation`] when a later mutation
    /// changed any of those claims.
    pub fn rollback(&self, id: MutationId, reason: &str, actor: &str) -> LedgerResult<Mutation> {
        self.check_actor(actor)?;
        let mut original = self.load_mutation(id)?;
        if original.status != MutationStatus::Committed {
            return Err(TransitionError {
                entity: "mutation",
                from: original.status.to_string(),
                to: MutationStatus::RolledBack.to_string(),
            }
            .into());
        }
        let organism = self.writable_organism(original.organism_id)?;

        let touched = original.touched_claims();
        let later: Vec<String> = self
            .store
            .chain(organism.id)?
            .iter()
            .skip_while(|m| m.id != id)
            .skip(1)
            .filter(|m| touched.iter().any(|c| m.touches(*c)))
            .map(|m| m.id.to_string())
            .collect();
        if !later.is_empty() {
            return Err(LedgerError::LineageViolation(format!(
                "claims written by {} were changed later by {}",
                id,
                later.join(", ")
            )));
        }

        let base = self.current_state(organism.id)?;
        let mut changes = Vec::new();
        for claim_id in touched {
            let Some(first) = original.changes.iter().find(|c| c.claim_id == claim_id) else {
                continue;
            };
            let current = base.by_id(claim_id).ok_or_else(|| {
                LedgerError::LineageViolation(format!("claim {} written by {} is missing", claim_id, id))
            })?;
            let op = match &first.before {
                Some(snapshot) => ChangeOp::Restore {
                    snapshot: snapshot.clone(),
                },
                None if current.deleted => continue,
                None => ChangeOp::Delete,
            };
            changes.push(Change {
                claim_id,
                lens: current.lens.clone(),
                op,
                expected_version: Some(current.version),
                before: None,
                after: None,
            });
        }

        let now = self.now();
        let mut compensating = Mutation::new(
            organism.id,
            actor,
            Some(format!("rollback of {}: {}", id, reason)),
            changes,
            now,
        )
        .with_ttl(self.config.proposal_ttl_ms);
        compensating.compensates = Some(id);
        self.store.put_mutation(&compensating)?;
        let committed = self.commit_as(compensating.id, Vec::new(), None, CommitMode::Compensating)?;

        original.compensated_by = Some(committed.id);
        original.transition(MutationStatus::RolledBack, Some(reason.to_string()), self.now())?;
        self.store.put_mutation(&original)?;
        self.events.publish(LedgerEvent::MutationRolledBack {
            organism_id: organism.id,
            mutation_id: id,
            compensating_id: committed.id,
        });
        info!(mutation = %id, compensating = %committed.id, actor, "Mutation rolled back");
        Ok(original)
    }

    /// Mark every pending proposal past its TTL as expired
    pub fn expire_stale(&self, now: u64) -> LedgerResult<Vec<MutationId>> {
        let mut expired = Vec::new();
        for status in [MutationStatus::Proposed, MutationStatus::Validated] {
            for mut mutation in self.store.list_mutations(None, Some(status))? {
                if mutation.is_expired(now) {
                    self.expire(&mut mutation, now)?;
                    expired.push(mutation.id);
                }
            }
        }
        Ok(expired)
    }

    /// Get a mutation
    pub fn get_mutation(&self, id: MutationId) -> LedgerResult<Mutation> {
        self.load_mutation(id)
    }

    /// Mutations, optionally by organism and status
    pub fn list_mutations(
        &self,
        organism_id: Option<OrganismId>,
        status: Option<MutationStatus>,
    ) -> LedgerResult<Vec<Mutation>> {
        Ok(self.store.list_mutations(organism_id, status)?)
    }

    /// An organism's committed chain, oldest first
    pub fn chain(&self, organism_id: OrganismId) -> LedgerResult<Vec<Mutation>> {
        Ok(self.store.chain(organism_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_domain::{BaselineMode, ClaimSnapshot, Baseline, Value};

    fn key(s: &str) -> LensKey {
        LensKey::parse(s).unwrap()
    }

    fn state_with(lens: &str, value: f64, version: u64) -> (OrganismState, Claim) {
        let org = OrganismId::new();
        let snapshot = ClaimSnapshot {
            value: Value::from(value),
            weight: 0.5,
            baseline: Baseline::new(BaselineMode::Snapshot, Value::from(value), 0),
            constraints: vec![],
            deleted: false,
        };
        let mut claim = Claim::from_snapshot(ClaimId::new(), org, key(lens), snapshot, MutationId::new(), 0);
        claim.version = version;
        (OrganismState::from_claims(org, vec![claim.clone()]), claim)
    }

    #[test]
    fn test_resolve_target_by_lens_and_id() {
        let (state, claim) = state_with("pricing.floor", 10.0, 1);

        let by_lens = ChangeRequest::on_lens(key("pricing.floor"), ChangeOp::Set { value: 11.0.into() });
        assert_eq!(resolve_target(&state, &by_lens).unwrap(), (claim.id, key("pricing.floor")));

        let by_id = ChangeRequest::on_claim(claim.id, ChangeOp::Delete);
        assert_eq!(resolve_target(&state, &by_id).unwrap().1, key("pricing.floor"));

        let missing = ChangeRequest::on_lens(key("pricing.ceiling"), ChangeOp::Set { value: 1.0.into() });
        assert!(matches!(
            resolve_target(&state, &missing),
            Err(LedgerError::NotFound { kind: "claim", .. })
        ));
    }

    #[test]
    fn test_apply_change_records_snapshots() {
        let (mut state, claim) = state_with("pricing.floor", 10.0, 3);
        let change = Change {
            claim_id: claim.id,
            lens: claim.lens.clone(),
            op: ChangeOp::Set { value: 12.0.into() },
            expected_version: Some(3),
            before: None,
            after: None,
        };

        let applied = apply_change(&mut state, &change, &BTreeMap::new(), 5).unwrap();
        assert_eq!(applied.before.unwrap().value, Value::from(10.0));
        assert_eq!(applied.after.unwrap().value, Value::from(12.0));
        assert_eq!(state.value(&claim.lens), Some(&Value::from(12.0)));
    }

    #[test]
    fn test_kind_check_on_set() {
        let (mut state, claim) = state_with("pricing.floor", 10.0, 1);
        let mut lenses = BTreeMap::new();
        lenses.insert(claim.lens.clone(), Lens::new(claim.lens.clone(), ledger_domain::ValueKind::Number));
        let change = Change {
            claim_id: claim.id,
            lens: claim.lens.clone(),
            op: ChangeOp::Set { value: "ten".into() },
            expected_version: Some(1),
            before: None,
            after: None,
        };
        assert!(matches!(
            apply_change(&mut state, &change, &lenses, 0),
            Err(LedgerError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_check_versions() {
        let (state, claim) = state_with("pricing.floor", 10.0, 4);
        let mut mutation = Mutation::new(state.organism_id, "alice", None, vec![], 0);
        mutation.changes.push(Change {
            claim_id: claim.id,
            lens: claim.lens.clone(),
            op: ChangeOp::Delete,
            expected_version: Some(3),
            before: None,
            after: None,
        });

        let err = check_versions(&mutation, &state).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::VersionConflict {
                current_version: 4,
                expected_version: 3,
                ..
            }
        ));

        mutation.changes[0].expected_version = Some(4);
        assert!(check_versions(&mutation, &state).is_ok());
    }
}
