//! Shared fixtures for ledger-engine integration tests

#![allow(dead_code)]

use ledger_domain::{
    BaselineDraft, BaselineMode, ChangeOp, ChangeRequest, Claim, Clause, LensKey, Mutation, Organism, Rule,
    Tradeoff, Value,
};
use ledger_engine::{Ledger, LedgerConfig, ManualClock};
use std::sync::Arc;

pub const START: u64 = 1_000_000;

pub fn key(s: &str) -> LensKey {
    LensKey::parse(s).unwrap()
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// A ledger on a hand-driven clock with one organism and two known actors
pub struct Fixture {
    pub ledger: Arc<Ledger>,
    pub clock: Arc<ManualClock>,
    pub org: Organism,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let ledger = Ledger::in_memory(config).with_clock(clock.clone());
        Self::around(ledger, clock)
    }

    pub fn around(ledger: Ledger, clock: Arc<ManualClock>) -> Self {
        ledger.register_actor("alice").unwrap();
        ledger.register_actor("bob").unwrap();
        let org = ledger.create_organism("Maison Verre", "brand", vec!["retail".into()]).unwrap();
        Self {
            ledger: Arc::new(ledger),
            clock,
            org,
        }
    }

    pub fn propose(&self, changes: Vec<ChangeRequest>) -> Mutation {
        self.ledger.propose(self.org.id, "alice", changes, None).unwrap()
    }

    /// Propose and commit, then move the clock on
    pub fn commit_with(&self, changes: Vec<ChangeRequest>, tradeoffs: Vec<Tradeoff>) -> Mutation {
        let proposed = self.propose(changes);
        let committed = self.ledger.commit(proposed.id, tradeoffs, None).unwrap();
        self.clock.advance(10);
        committed
    }

    pub fn commit(&self, changes: Vec<ChangeRequest>) -> Mutation {
        self.commit_with(changes, vec![])
    }

    pub fn claim(&self, lens: &str) -> Claim {
        self.ledger.explain(self.org.id, &key(lens)).unwrap().claim.unwrap()
    }
}

pub fn create(lens: &str, value: impl Into<Value>, weight: f64) -> ChangeRequest {
    ChangeRequest::on_lens(
        key(lens),
        ChangeOp::Create {
            value: value.into(),
            weight,
            baseline: None,
            constraints: vec![],
        },
    )
}

pub fn create_declared(lens: &str, value: impl Into<Value>, weight: f64, baseline: impl Into<Value>) -> ChangeRequest {
    ChangeRequest::on_lens(
        key(lens),
        ChangeOp::Create {
            value: value.into(),
            weight,
            baseline: Some(BaselineDraft {
                mode: BaselineMode::Declared,
                value: Some(baseline.into()),
            }),
            constraints: vec![],
        },
    )
}

pub fn set(lens: &str, value: impl Into<Value>) -> ChangeRequest {
    ChangeRequest::on_lens(key(lens), ChangeOp::Set { value: value.into() })
}

pub fn reweight(lens: &str, weight: f64) -> ChangeRequest {
    ChangeRequest::on_lens(key(lens), ChangeOp::Reweight { weight })
}

/// Luxury positioning excludes heavy discounting
pub fn luxury_exclusion() -> Rule {
    Rule::Exclusion {
        left: Clause::new(key("brand.positioning"), vec!["luxury".into()]),
        right: Clause::new(key("brand.discounting.strategy"), vec!["discount-heavy".into()]),
    }
}

pub fn tradeoff(lens: &str) -> Tradeoff {
    Tradeoff::new(vec![key(lens)], "price accessibility", "premium perception")
}
