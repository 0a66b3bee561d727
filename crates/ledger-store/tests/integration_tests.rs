//! Integration tests for ledger-store
//!
//! Every scenario runs against both backends through the shared traits.

use ledger_domain::traits::{
    Catalog, ClaimFilter, ClaimStore, ClaimWrite, CommitBatch, ConflictFilter, ConflictLedger, LedgerStore,
    MutationLog,
};
use ledger_domain::{
    Baseline, BaselineMode, Claim, ClaimId, ClaimSnapshot, Conflict, ConflictOrigin, ConflictStatus, ConflictType,
    Constraint, Lens, LensKey, Mutation, MutationStatus, Organism, OrganismId, Rule, Scope, Selector,
    SeverityInputs, Severity, StoreError, Value, ValueKind,
};
use ledger_store::{MemoryStore, SqliteStore};
use tempfile::TempDir;

fn key(s: &str) -> LensKey {
    LensKey::parse(s).unwrap()
}

fn backends() -> Vec<(&'static str, Box<dyn LedgerStore>, Option<TempDir>)> {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteStore::new(dir.path().join("ledger.db")).unwrap();
    vec![
        ("memory", Box::new(MemoryStore::new()), None),
        ("sqlite", Box::new(sqlite), Some(dir)),
    ]
}

fn snapshot(value: f64) -> ClaimSnapshot {
    ClaimSnapshot {
        value: Value::from(value),
        weight: 0.5,
        baseline: Baseline::new(BaselineMode::Declared, Value::from(10.0), 0),
        constraints: vec![],
        deleted: false,
    }
}

/// Commit a mutation creating one claim; returns the claim
fn create_claim(store: &dyn LedgerStore, org: OrganismId, lens: &str, value: f64) -> Claim {
    let mut mutation = Mutation::new(org, "alice", None, vec![], 1);
    mutation.status = MutationStatus::Committed;
    let claim = Claim::from_snapshot(ClaimId::new(), org, key(lens), snapshot(value), mutation.id, 1);
    let receipt = store
        .apply_changes(CommitBatch {
            organism_id: org,
            mutation,
            writes: vec![ClaimWrite {
                claim: claim.clone(),
                expected_version: None,
            }],
        })
        .unwrap();
    receipt.claims[0].clone()
}

fn update_batch(org: OrganismId, claim: &Claim, value: f64, expected: u64) -> CommitBatch {
    let mut mutation = Mutation::new(org, "bob", None, vec![], 2);
    mutation.status = MutationStatus::Committed;
    let next = claim.advanced(snapshot(value), mutation.id, 2);
    CommitBatch {
        organism_id: org,
        mutation,
        writes: vec![ClaimWrite {
            claim: next,
            expected_version: Some(expected),
        }],
    }
}

#[test]
fn test_store_initialization() {
    assert!(SqliteStore::in_memory().is_ok(), "Store should initialize successfully");
}

#[test]
fn test_commit_and_read_back() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let claim = create_claim(store.as_ref(), org, "pricing.floor", 14.0);

        let by_id = store.get_claim(claim.id).unwrap().unwrap();
        assert_eq!(by_id, claim, "{name}");

        let by_lens = store.find_claim(org, &key("pricing.floor")).unwrap().unwrap();
        assert_eq!(by_lens.id, claim.id, "{name}");
        assert_eq!(by_lens.version, 1, "{name}");

        assert!(store.find_claim(org, &key("pricing.ceiling")).unwrap().is_none(), "{name}");
        assert_eq!(store.head(org).unwrap(), claim.last_mutation_id, "{name}");
    }
}

#[test]
fn test_compare_and_swap() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let claim = create_claim(store.as_ref(), org, "pricing.floor", 14.0);

        let receipt = store.apply_changes(update_batch(org, &claim, 15.0, 1)).unwrap();
        assert_eq!(receipt.claims[0].version, 2, "{name}");

        // Stale writer loses
        let err = store.apply_changes(update_batch(org, &claim, 16.0, 1)).unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                claim_id: claim.id,
                current_version: 2,
                expected_version: 1,
            },
            "{name}"
        );

        let current = store.get_claim(claim.id).unwrap().unwrap();
        assert_eq!(current.value, Value::from(15.0), "{name}");
    }
}

#[test]
fn test_failed_batch_writes_nothing() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let a = create_claim(store.as_ref(), org, "pricing.floor", 1.0);
        let b = create_claim(store.as_ref(), org, "pricing.ceiling", 2.0);
        let head_before = store.head(org).unwrap();

        let mut batch = update_batch(org, &a, 100.0, 1);
        let mut stale_b = b.advanced(snapshot(200.0), batch.mutation.id, 3);
        stale_b.version = 9;
        batch.writes.push(ClaimWrite {
            claim: stale_b,
            expected_version: Some(7),
        });
        let mutation_id = batch.mutation.id;

        assert!(store.apply_changes(batch).is_err(), "{name}");
        assert_eq!(store.get_claim(a.id).unwrap().unwrap().value, Value::from(1.0), "{name}");
        assert_eq!(store.get_claim(b.id).unwrap().unwrap().version, 1, "{name}");
        assert_eq!(store.head(org).unwrap(), head_before, "{name}");
        assert!(store.get_mutation(mutation_id).unwrap().is_none(), "{name}");
    }
}

#[test]
fn test_second_create_of_lens_is_version_conflict() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let first = create_claim(store.as_ref(), org, "brand.positioning", 1.0);

        let mut mutation = Mutation::new(org, "alice", None, vec![], 1);
        mutation.status = MutationStatus::Committed;
        let dup = Claim::from_snapshot(ClaimId::new(), org, key("brand.positioning"), snapshot(2.0), mutation.id, 1);
        let err = store
            .apply_changes(CommitBatch {
                organism_id: org,
                mutation,
                writes: vec![ClaimWrite {
                    claim: dup,
                    expected_version: None,
                }],
            })
            .unwrap_err();
        match err {
            StoreError::VersionConflict {
                claim_id,
                current_version,
                expected_version,
            } => {
                assert_eq!(claim_id, first.id, "{name}");
                assert_eq!(current_version, first.version, "{name}");
                assert_eq!(expected_version, 0, "{name}");
            }
            other => panic!("{name}: expected version conflict, got {other:?}"),
        }
        assert_eq!(store.find_claim(org, &key("brand.positioning")).unwrap().unwrap().id, first.id, "{name}");
    }
}

#[test]
fn test_reused_claim_id_is_duplicate() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let first = create_claim(store.as_ref(), org, "brand.positioning", 1.0);

        let mut mutation = Mutation::new(org, "alice", None, vec![], 1);
        mutation.status = MutationStatus::Committed;
        let reused = Claim::from_snapshot(first.id, org, key("brand.tone"), snapshot(2.0), mutation.id, 1);
        let err = store
            .apply_changes(CommitBatch {
                organism_id: org,
                mutation,
                writes: vec![ClaimWrite {
                    claim: reused,
                    expected_version: None,
                }],
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { kind: "claim", .. }), "{name}: {err:?}");
    }
}

#[test]
fn test_chain_links_in_commit_order() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let claim = create_claim(store.as_ref(), org, "pricing.floor", 1.0);
        let second = store.apply_changes(update_batch(org, &claim, 2.0, 1)).unwrap();

        let chain = store.chain(org).unwrap();
        assert_eq!(chain.len(), 2, "{name}");
        assert_eq!(chain[0].prev_mutation_id, None, "{name}");
        assert_eq!(chain[1].prev_mutation_id, Some(chain[0].id), "{name}");
        assert_eq!(chain[1].id, second.mutation.id, "{name}");
        assert_eq!(store.head(org).unwrap(), Some(second.mutation.id), "{name}");
    }
}

#[test]
fn test_mutation_log_is_append_only() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let mut rejected = Mutation::new(org, "alice", None, vec![], 1);
        store.put_mutation(&rejected).unwrap();

        rejected.status = MutationStatus::Rejected;
        store.put_mutation(&rejected).unwrap();

        rejected.status = MutationStatus::Validated;
        let err = store.put_mutation(&rejected).unwrap_err();
        assert!(matches!(err, StoreError::Immutable(_)), "{name}");

        let listed = store.list_mutations(Some(org), Some(MutationStatus::Rejected)).unwrap();
        assert_eq!(listed.len(), 1, "{name}");
    }
}

#[test]
fn test_soft_deleted_claims_filtered() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let kept = create_claim(store.as_ref(), org, "brand.tone", 1.0);
        let gone = create_claim(store.as_ref(), org, "pricing.floor", 1.0);

        let mut batch = update_batch(org, &gone, 1.0, 1);
        batch.writes[0].claim.deleted = true;
        store.apply_changes(batch).unwrap();

        let live = store.list_claims(org, &ClaimFilter::default()).unwrap();
        assert_eq!(live.iter().map(|c| c.id).collect::<Vec<_>>(), vec![kept.id], "{name}");

        let all = store
            .list_claims(
                org,
                &ClaimFilter {
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(all.len(), 2, "{name}");

        let brand = store
            .list_claims(
                org,
                &ClaimFilter {
                    cluster: Some("brand".into()),
                    include_deleted: true,
                },
            )
            .unwrap();
        assert_eq!(brand.len(), 1, "{name}");
    }
}

#[test]
fn test_conflicts_filter_and_update() {
    for (name, store, _dir) in backends() {
        let org = OrganismId::new();
        let claim = ClaimId::new();
        let mut conflict = Conflict::new(
            org,
            ConflictType::ExclusionConstraint,
            vec![claim],
            vec![key("brand.positioning")],
            ConflictOrigin::default(),
            SeverityInputs {
                mean_weight: 0.7,
                hard: false,
                reference_baseline: false,
                prior_occurrences: 0,
            },
            "exclusion",
            1,
        );
        store.put_conflict(&conflict).unwrap();

        conflict.transition(ConflictStatus::Suppressed, "noise", 2).unwrap();
        store.put_conflict(&conflict).unwrap();

        let active = store
            .list_conflicts(&ConflictFilter {
                organism_id: Some(org),
                status: Some(ConflictStatus::Active),
                ..Default::default()
            })
            .unwrap();
        assert!(active.is_empty(), "{name}");

        let by_claim = store
            .list_conflicts(&ConflictFilter {
                claim_id: Some(claim),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_claim.len(), 1, "{name}");
        assert_eq!(by_claim[0].history.len(), 1, "{name}");
    }
}

#[test]
fn test_catalog_versions() {
    for (name, store, _dir) in backends() {
        let organism = Organism::new("Maison", "brand", 1);
        store.put_organism(&organism).unwrap();
        assert_eq!(store.get_organism(organism.id).unwrap(), Some(organism.clone()), "{name}");

        let lens = Lens::new(key("brand.positioning"), ValueKind::Enumeration);
        store.put_lens(&lens).unwrap();
        assert_eq!(store.list_lenses().unwrap().len(), 1, "{name}");

        let mut constraint = Constraint::new(
            "floor",
            Severity::Hard,
            Scope::Lens,
            Selector::lens(key("pricing.floor")),
            Rule::DriftLte { max: 0.3 },
            1,
        );
        store.put_constraint(&constraint).unwrap();
        constraint.version = 2;
        constraint.rule = Rule::DriftLte { max: 0.2 };
        store.put_constraint(&constraint).unwrap();

        let current = store.get_constraint(constraint.id).unwrap().unwrap();
        assert_eq!(current.version, 2, "{name}");
        assert_eq!(store.constraint_history(constraint.id).unwrap().len(), 2, "{name}");
        assert_eq!(store.list_constraints().unwrap().len(), 1, "{name}");
    }
}

#[test]
fn test_sqlite_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let org = OrganismId::new();

    let claim = {
        let store = SqliteStore::new(&path).unwrap();
        create_claim(&store, org, "pricing.floor", 14.0)
    };

    let reopened = SqliteStore::new(&path).unwrap();
    assert_eq!(reopened.get_claim(claim.id).unwrap(), Some(claim.clone()));
    assert_eq!(reopened.chain(org).unwrap().len(), 1);
}
