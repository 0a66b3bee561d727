//! Integration tests for conflict detection, resolution and suppression

mod common;

use common::*;
use ledger_domain::traits::ConflictFilter;
use ledger_domain::{
    Clause, Conflict, ConflictSeverity, ConflictStatus, ConflictType, ProjectionData, ProjectionKind, ResolutionStrategy,
    Rule, Scope, Selector, Severity, Value,
};
use ledger_engine::{AutoResolvePolicy, ConstraintDraft, LedgerConfig, LedgerError, LedgerEvent, ResolveRequest};

fn register_exclusion(fx: &Fixture, severity: Severity) {
    fx.ledger
        .register_constraint(ConstraintDraft::new(
            "luxury never discounts heavily",
            severity,
            Scope::Global,
            Selector::default(),
            luxury_exclusion(),
        ))
        .unwrap();
}

fn conflicts(fx: &Fixture) -> Vec<Conflict> {
    fx.ledger
        .list_conflicts(&ConflictFilter {
            organism_id: Some(fx.org.id),
            ..Default::default()
        })
        .unwrap()
}

/// Commit the excluded pair; returns the recorded conflict
fn excluded_pair(fx: &Fixture, positioning: f64, discounting: f64) -> Conflict {
    register_exclusion(fx, Severity::Soft);
    let proposed = fx.propose(vec![
        create("brand.positioning", "luxury", positioning),
        create("brand.discounting.strategy", "discount-heavy", discounting),
    ]);
    let err = fx.ledger.commit(proposed.id, vec![], None).unwrap_err();
    assert!(matches!(err, LedgerError::TradeoffRequired { ref lenses, .. } if lenses.contains(&key("brand.positioning"))));

    fx.ledger
        .commit(proposed.id, vec![tradeoff("brand.positioning")], None)
        .unwrap();
    fx.clock.advance(10);
    conflicts(fx).remove(0)
}

#[test]
fn test_exclusion_records_scored_conflict() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);

    assert_eq!(conflict.conflict_type, ConflictType::ExclusionConstraint);
    assert_eq!(conflict.status, ConflictStatus::Active);
    assert!(approx(conflict.mean_weight, 0.715));
    assert!(approx(conflict.score, 0.715));
    assert_eq!(conflict.severity, ConflictSeverity::Medium);
    assert_eq!(conflict.claims.len(), 2);
    assert_eq!(conflict.prior_occurrences, 0);
    assert!(conflict.origin.constraint_id.is_some());
    assert!(conflict.origin.mutation_id.is_some());
    assert!(conflict.still_triggered);
}

#[test]
fn test_detection_is_idempotent() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);

    let sweep = fx.ledger.reevaluate(fx.org.id).unwrap();
    assert!(sweep.created.is_empty());
    assert_eq!(sweep.updated, vec![conflict.id]);
    assert_eq!(conflicts(&fx).len(), 1);
}

#[test]
fn test_baseline_violation_clears_when_drift_returns() {
    let fx = Fixture::new();
    fx.commit(vec![create_declared("pricing.floor", 10.0, 0.5, 10.0)]);
    fx.ledger
        .register_constraint(ConstraintDraft::new(
            "floor drift",
            Severity::Soft,
            Scope::Lens,
            Selector::lens(key("pricing.floor")),
            ledger_domain::Rule::WeightedDriftLte { max: 0.15 },
        ))
        .unwrap();
    fx.commit_with(vec![set("pricing.floor", 14.0)], vec![tradeoff("pricing.floor")]);

    let conflict = conflicts(&fx).remove(0);
    assert_eq!(conflict.conflict_type, ConflictType::BaselineViolation);
    assert!(approx(conflict.score, 0.65));
    assert_eq!(conflict.severity, ConflictSeverity::Medium);

    fx.commit(vec![set("pricing.floor", 10.0)]);
    let conflict = fx.ledger.get_conflict(conflict.id).unwrap();
    assert_eq!(conflict.status, ConflictStatus::Active);
    assert!(!conflict.still_triggered);
}

#[test]
fn test_disjoint_obligations_record_derived_conflict() {
    let fx = Fixture::new();
    fx.commit(vec![create("brand.positioning", "luxury", 0.6)]);
    let positioning = fx.claim("brand.positioning");

    let packaging = |name: &str, value: &str| {
        fx.ledger
            .register_constraint(ConstraintDraft::new(
                name,
                Severity::Soft,
                Scope::Global,
                Selector::default(),
                Rule::Implies {
                    when: Clause::new(key("brand.positioning"), vec!["luxury".into()]),
                    then: Clause::new(key("brand.packaging"), vec![value.into()]),
                },
            ))
            .unwrap()
    };
    packaging("luxury ships premium", "premium");
    assert!(conflicts(&fx).is_empty());
    packaging("luxury ships recycled", "recycled");

    let recorded = conflicts(&fx);
    assert_eq!(recorded.len(), 1);
    let derived = &recorded[0];
    assert_eq!(derived.conflict_type, ConflictType::Derived);
    assert_eq!(derived.status, ConflictStatus::Active);
    assert_eq!(derived.claims, vec![positioning.id]);
    assert_eq!(derived.lenses, vec![key("brand.packaging")]);
    assert!(approx(derived.score, 0.6));
    assert_eq!(derived.severity, ConflictSeverity::Medium);

    let sweep = fx.ledger.reevaluate(fx.org.id).unwrap();
    assert!(sweep.created.is_empty());
    assert_eq!(sweep.updated, vec![derived.id]);
    assert_eq!(conflicts(&fx).len(), 1);
}

#[test]
fn test_resolve_prefers_chosen_claim() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);
    let positioning = fx.claim("brand.positioning");
    let discounting = fx.claim("brand.discounting.strategy");

    let resolved = fx
        .ledger
        .resolve(
            conflict.id,
            ResolveRequest {
                strategy: ResolutionStrategy::Prefer,
                chosen_claim_id: Some(positioning.id),
                sacrificed: vec![],
                tradeoff: tradeoff("brand.positioning"),
                actor: "bob".into(),
            },
        )
        .unwrap();

    assert_eq!(resolved.status, ConflictStatus::Resolved);
    let resolution = resolved.resolution.unwrap();
    assert_eq!(resolution.sacrificed, vec![discounting.id]);
    assert!(!resolution.automatic);
    assert_eq!(resolution.resolved_by, "bob");

    let compensating = fx.ledger.get_mutation(resolution.mutation_id).unwrap();
    assert!(compensating.touches(discounting.id));
    assert_eq!(compensating.tradeoffs.len(), 1);
    assert!(!fx.claim("brand.discounting.strategy").is_live());
    assert!(fx.claim("brand.positioning").is_live());

    let err = fx
        .ledger
        .suppress(conflict.id, "too late", None, "alice")
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition(_)));
}

#[test]
fn test_resolve_requires_matching_tradeoff() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);
    let positioning = fx.claim("brand.positioning");

    let err = fx
        .ledger
        .resolve(
            conflict.id,
            ResolveRequest {
                strategy: ResolutionStrategy::Prefer,
                chosen_claim_id: Some(positioning.id),
                sacrificed: vec![],
                tradeoff: tradeoff("pricing.floor"),
                actor: "bob".into(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::TradeoffRequired { .. }));
    assert_eq!(fx.ledger.get_conflict(conflict.id).unwrap().status, ConflictStatus::Active);
    assert!(fx.claim("brand.discounting.strategy").is_live());
}

#[test]
fn test_demote_zeroes_weight() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);
    let discounting = fx.claim("brand.discounting.strategy");

    fx.ledger
        .resolve(
            conflict.id,
            ResolveRequest {
                strategy: ResolutionStrategy::Demote,
                chosen_claim_id: None,
                sacrificed: vec![discounting.id],
                tradeoff: tradeoff("brand.discounting.strategy"),
                actor: "alice".into(),
            },
        )
        .unwrap();
    let demoted = fx.claim("brand.discounting.strategy");
    assert_eq!(demoted.weight, 0.0);
    assert_eq!(demoted.value, Value::from("discount-heavy"));
}

#[test]
fn test_existential_conflict_blocks_dependent_commits() {
    let fx = Fixture::new();
    fx.commit(vec![
        create_declared("brand.positioning", "luxury", 0.9, "luxury"),
        create("brand.discounting.strategy", "discount-heavy", 0.9),
    ]);
    register_exclusion(&fx, Severity::Hard);

    let conflict = conflicts(&fx).remove(0);
    // 0.9 × 1.5 (hard) × 1.3 (declared)
    assert!(approx(conflict.score, 1.755));
    assert_eq!(conflict.severity, ConflictSeverity::Existential);

    let proposed = fx.propose(vec![reweight("brand.discounting.strategy", 0.5)]);
    let err = fx.ledger.commit(proposed.id, vec![], None).unwrap_err();
    match err {
        LedgerError::ConflictUnresolved { conflict_ids } => assert_eq!(conflict_ids, vec![conflict.id]),
        other => panic!("expected an unresolved conflict, got {:?}", other),
    }

    let positioning = fx.claim("brand.positioning");
    fx.ledger
        .resolve(
            conflict.id,
            ResolveRequest {
                strategy: ResolutionStrategy::Prefer,
                chosen_claim_id: Some(positioning.id),
                sacrificed: vec![],
                tradeoff: tradeoff("brand.positioning"),
                actor: "alice".into(),
            },
        )
        .unwrap();
    assert!(!fx.claim("brand.discounting.strategy").is_live());
}

#[test]
fn test_suppression_expires() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);
    let mut rx = fx.ledger.subscribe();

    let until = fx.ledger.now() + 1_000;
    let suppressed = fx
        .ledger
        .suppress(conflict.id, "holiday clearance", Some(until), "alice")
        .unwrap();
    assert_eq!(suppressed.status, ConflictStatus::Suppressed);
    assert_eq!(suppressed.suppression.as_ref().unwrap().approved_by, "alice");

    assert!(fx.ledger.reactivate_expired(fx.ledger.now()).unwrap().is_empty());
    fx.clock.advance(2_000);
    let reactivated = fx.ledger.reactivate_expired(fx.ledger.now()).unwrap();
    assert_eq!(reactivated, vec![conflict.id]);

    let conflict = fx.ledger.get_conflict(conflict.id).unwrap();
    assert_eq!(conflict.status, ConflictStatus::Active);
    assert!(conflict.suppression.is_none());
    assert_eq!(conflict.history.len(), 2);

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(LedgerEvent::ConflictSuppressed { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LedgerEvent::ConflictReactivated { conflict_id, .. } if *conflict_id == conflict.id)));
}

fn matrix_conflicts(fx: &Fixture) -> (u64, usize) {
    let projection = fx.ledger.projection(fx.org.id, ProjectionKind::Matrix, None).unwrap();
    assert!(!projection.stale);
    match projection.data {
        ProjectionData::Matrix(rows) => (projection.version, rows.iter().map(|r| r.active_conflicts).sum()),
        other => panic!("expected a matrix, got {:?}", other),
    }
}

#[test]
fn test_conflict_status_changes_refresh_projections() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);
    let (before, counted) = matrix_conflicts(&fx);
    assert_eq!(counted, 2);

    let until = fx.ledger.now() + 1_000;
    fx.ledger
        .suppress(conflict.id, "holiday clearance", Some(until), "alice")
        .unwrap();
    assert!(fx.ledger.cached_projection(fx.org.id, ProjectionKind::Matrix).unwrap().stale);
    let (suppressed, counted) = matrix_conflicts(&fx);
    assert!(suppressed > before);
    assert_eq!(counted, 0);

    fx.clock.advance(2_000);
    fx.ledger.reactivate_expired(fx.ledger.now()).unwrap();
    assert!(fx.ledger.cached_projection(fx.org.id, ProjectionKind::Matrix).unwrap().stale);
    let (reactivated, counted) = matrix_conflicts(&fx);
    assert!(reactivated > suppressed);
    assert_eq!(counted, 2);

    let chosen = fx.claim("brand.positioning").id;
    fx.ledger
        .resolve(
            conflict.id,
            ResolveRequest {
                strategy: ResolutionStrategy::Prefer,
                chosen_claim_id: Some(chosen),
                sacrificed: vec![],
                tradeoff: tradeoff("brand.positioning"),
                actor: "bob".into(),
            },
        )
        .unwrap();
    let (_, counted) = matrix_conflicts(&fx);
    assert_eq!(counted, 0);
}

#[test]
fn test_suppressed_conflict_reactivates_when_trigger_fires() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);
    fx.ledger
        .suppress(conflict.id, "under review", None, "alice")
        .unwrap();

    let sweep = fx.ledger.reevaluate(fx.org.id).unwrap();
    assert_eq!(sweep.reactivated, vec![conflict.id]);

    let conflict = fx.ledger.get_conflict(conflict.id).unwrap();
    assert_eq!(conflict.status, ConflictStatus::Active);
    assert_eq!(conflict.prior_occurrences, 1);
    assert!(approx(conflict.score, 0.715 * 1.1));
}

#[test]
fn test_weight_change_rescores_conflict() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);

    fx.commit_with(
        vec![reweight("brand.discounting.strategy", 0.1)],
        vec![tradeoff("brand.discounting.strategy")],
    );
    let conflict = fx.ledger.get_conflict(conflict.id).unwrap();
    assert!(approx(conflict.score, 0.465));
    assert_eq!(conflict.severity, ConflictSeverity::Low);
    assert!(fx.ledger.rescore_active(fx.org.id, fx.ledger.now()).unwrap().is_empty());
}

#[test]
fn test_auto_resolution_by_weight_delta() {
    let config = LedgerConfig {
        auto_resolve: AutoResolvePolicy {
            enabled: true,
            ..Default::default()
        },
        ..LedgerConfig::default()
    };
    let fx = Fixture::with_config(config);
    let conflict = excluded_pair(&fx, 0.9, 0.4);

    assert_eq!(conflict.status, ConflictStatus::Resolved);
    let resolution = conflict.resolution.unwrap();
    assert!(resolution.automatic);
    assert_eq!(resolution.resolved_by, "system");
    assert_eq!(resolution.strategy, ResolutionStrategy::Prefer);
    assert_eq!(resolution.chosen_claim_id, Some(fx.claim("brand.positioning").id));
    assert!(resolution.tradeoff.rationale.unwrap().contains("weight delta"));

    assert!(!fx.claim("brand.discounting.strategy").is_live());
    let chain = fx.ledger.chain(fx.org.id).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].actor, "system");
    assert!(!chain[1].tradeoffs.is_empty());
}

#[test]
fn test_conflict_filters() {
    let fx = Fixture::new();
    let conflict = excluded_pair(&fx, 0.83, 0.6);

    let medium = fx
        .ledger
        .list_conflicts(&ConflictFilter {
            severity: Some(ConflictSeverity::Medium),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(medium.len(), 1);

    let by_claim = fx
        .ledger
        .list_conflicts(&ConflictFilter {
            claim_id: Some(conflict.claims[0]),
            status: Some(ConflictStatus::Active),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_claim[0].id, conflict.id);

    assert!(matches!(
        fx.ledger.get_conflict(ledger_domain::ConflictId::new()),
        Err(LedgerError::NotFound { kind: "conflict", .. })
    ));
}
