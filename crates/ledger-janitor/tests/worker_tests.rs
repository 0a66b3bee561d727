//! Janitor worker driving a ledger on a hand-driven clock

use ledger_domain::traits::ConflictFilter;
use ledger_domain::{
    ChangeOp, ChangeRequest, Clause, ConflictStatus, LensKey, MutationStatus, Rule, Scope, Selector, Severity,
    Tradeoff, Value,
};
use ledger_engine::{Clock, ConstraintDraft, Ledger, LedgerConfig, ManualClock};
use ledger_janitor::{JanitorConfig, JanitorWorker};
use std::sync::Arc;

fn key(s: &str) -> LensKey {
    LensKey::parse(s).unwrap()
}

fn create(lens: &str, value: &str, weight: f64) -> ChangeRequest {
    ChangeRequest::on_lens(
        key(lens),
        ChangeOp::Create {
            value: Value::from(value),
            weight,
            baseline: None,
            constraints: vec![],
        },
    )
}

fn setup() -> (Arc<Ledger>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let config = LedgerConfig {
        proposal_ttl_ms: 1_000,
        ..LedgerConfig::lenient()
    };
    let ledger = Ledger::in_memory(config).with_clock(clock.clone());
    (Arc::new(ledger), clock)
}

fn worker(ledger: &Arc<Ledger>) -> JanitorWorker {
    JanitorWorker::new(
        ledger.clone(),
        JanitorConfig {
            sweep_interval_ms: 5,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_worker_expires_proposals() {
    let (ledger, clock) = setup();
    let organism = ledger.create_organism("Maison Verre", "brand", vec![]).unwrap();
    let proposed = ledger
        .propose(organism.id, "alice", vec![create("brand.tone", "warm", 0.4)], None)
        .unwrap();
    let mut worker = worker(&ledger);

    clock.advance(5_000);
    worker.run_cycles(1).await.unwrap();

    assert_eq!(worker.metrics().expired_proposals, 1);
    assert_eq!(ledger.get_mutation(proposed.id).unwrap().status, MutationStatus::Expired);
}

#[tokio::test]
async fn test_worker_reactivates_lapsed_suppression() {
    let (ledger, clock) = setup();
    let organism = ledger.create_organism("Maison Verre", "brand", vec![]).unwrap();
    ledger
        .register_constraint(ConstraintDraft::new(
            "luxury never discounts heavily",
            Severity::Soft,
            Scope::Global,
            Selector::default(),
            Rule::Exclusion {
                left: Clause::new(key("brand.positioning"), vec!["luxury".into()]),
                right: Clause::new(key("brand.discounting.strategy"), vec!["discount-heavy".into()]),
            },
        ))
        .unwrap();

    let proposed = ledger
        .propose(
            organism.id,
            "alice",
            vec![
                create("brand.positioning", "luxury", 0.83),
                create("brand.discounting.strategy", "discount-heavy", 0.6),
            ],
            None,
        )
        .unwrap();
    let tradeoff = Tradeoff::new(vec![key("brand.positioning")], "price accessibility", "premium perception");
    ledger.commit(proposed.id, vec![tradeoff], None).unwrap();

    let filter = ConflictFilter {
        organism_id: Some(organism.id),
        ..Default::default()
    };
    let conflict = ledger.list_conflicts(&filter).unwrap().remove(0);
    ledger
        .suppress(conflict.id, "seasonal clearance", Some(clock.now() + 100), "alice")
        .unwrap();

    let mut worker = worker(&ledger);
    worker.run_cycles(1).await.unwrap();
    assert_eq!(worker.metrics().reactivated_conflicts, 0);
    assert_eq!(ledger.get_conflict(conflict.id).unwrap().status, ConflictStatus::Suppressed);

    clock.advance(200);
    worker.run_cycles(1).await.unwrap();
    assert_eq!(worker.metrics().reactivated_conflicts, 1);
    let conflict = ledger.get_conflict(conflict.id).unwrap();
    assert_eq!(conflict.status, ConflictStatus::Active);
    assert!(conflict.suppression.is_none());
}

#[tokio::test]
async fn test_worker_follows_commits() {
    let (ledger, _clock) = setup();
    let organism = ledger.create_organism("Maison Verre", "brand", vec![]).unwrap();
    let mut worker = worker(&ledger);

    let proposed = ledger
        .propose(organism.id, "alice", vec![create("brand.tone", "warm", 0.4)], None)
        .unwrap();
    ledger.commit(proposed.id, vec![], None).unwrap();

    worker.run_cycles(1).await.unwrap();
    assert!(worker.metrics().events_handled >= 1);
    assert_eq!(worker.metrics().rescored_conflicts, 0);
}
