//! The ledger facade and the reads shared by its operations

use crate::clock::{Clock, SystemClock};
use crate::projections::ProjectionCache;
use crate::{EventBus, LedgerConfig, LedgerError, LedgerEvent, LedgerResult};
use ledger_domain::drift::{self, CoherenceBreakdown};
use ledger_domain::traits::{ClaimFilter, ConflictFilter, LedgerStore};
use ledger_domain::{
    Conflict, ConflictId, Constraint, ConstraintResult, Lens, LensKey, Mutation, MutationId, Organism,
    OrganismId, OrganismState, StoreError,
};
use ledger_gatekeeper::{ConstraintEvaluator, EvaluationContext, EvaluatorConfig};
use ledger_store::MemoryStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Actor used for automatic work; always known
pub const SYSTEM_ACTOR: &str = "system";

/// The versioned claim ledger
///
/// All operations take `&self`; share a ledger across threads and tasks with
/// an `Arc`. Commits touching the same claims race on the store's
/// compare-and-swap, commits on disjoint claims proceed in parallel.
///
/// # Examples
///
/// ```no_run
/// use ledger_engine::{Ledger, LedgerConfig};
/// use ledger_store::SqliteStore;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(SqliteStore::new("ledger.db")?);
/// let ledger = Ledger::new(store, LedgerConfig::default());
/// ledger.register_actor("alice")?;
/// # Ok(())
/// # }
/// ```
pub struct Ledger {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) evaluator: ConstraintEvaluator,
    pub(crate) config: LedgerConfig,
    pub(crate) events: EventBus,
    pub(crate) projections: ProjectionCache,
    actors: RwLock<BTreeSet<String>>,
    clock: Arc<dyn Clock>,
}

/// Constraint results and coherence of one state
pub(crate) struct Assessment {
    pub results: Vec<ConstraintResult>,
    pub breakdown: CoherenceBreakdown,
}

impl Ledger {
    /// Create a ledger over `store`
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        let mut actors: BTreeSet<String> = config.actors.iter().cloned().collect();
        actors.insert(SYSTEM_ACTOR.to_string());
        Self {
            store,
            evaluator: ConstraintEvaluator::default_config(),
            events: EventBus::new(config.event_capacity),
            projections: ProjectionCache::new(config.projection_capacity),
            actors: RwLock::new(actors),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Create a ledger over a fresh in-memory store
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Replace the evaluator configuration
    pub fn with_evaluator(mut self, config: EvaluatorConfig) -> Self {
        self.evaluator = ConstraintEvaluator::new(config);
        self
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Underlying store (read access for callers that page through records)
    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Current time according to the ledger clock (ms)
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Register an actor allowed to propose
    pub fn register_actor(&self, name: &str) -> LedgerResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::InvalidOperation("actor name is empty".into()));
        }
        self.actors
            .write()
            .map_err(|_| LedgerError::Store(StoreError::Poisoned))?
            .insert(name.to_string());
        Ok(())
    }

    /// Whether `actor` may act on the ledger
    pub fn is_known_actor(&self, actor: &str) -> bool {
        self.actors.read().map(|a| a.contains(actor)).unwrap_or(false)
    }

    pub(crate) fn check_actor(&self, actor: &str) -> LedgerResult<()> {
        if actor.trim().is_empty() {
            return Err(LedgerError::InvalidOperation("actor is required".into()));
        }
        if self.config.reject_unknown_actors && !self.is_known_actor(actor) {
            return Err(LedgerError::UnknownActor(actor.to_string()));
        }
        Ok(())
    }

    pub(crate) fn load_organism(&self, id: OrganismId) -> LedgerResult<Organism> {
        self.store
            .get_organism(id)?
            .ok_or_else(|| LedgerError::not_found("organism", id))
    }

    /// Organism that may still receive mutations
    pub(crate) fn writable_organism(&self, id: OrganismId) -> LedgerResult<Organism> {
        let organism = self.load_organism(id)?;
        if organism.archived {
            return Err(LedgerError::InvalidOperation(format!("organism {} is archived", id)));
        }
        Ok(organism)
    }

    pub(crate) fn lens_map(&self) -> LedgerResult<BTreeMap<LensKey, Lens>> {
        Ok(self
            .store
            .list_lenses()?
            .into_iter()
            .map(|lens| (lens.key.clone(), lens))
            .collect())
    }

    pub(crate) fn current_constraints(&self) -> LedgerResult<Vec<Constraint>> {
        Ok(self.store.list_constraints()?)
    }

    /// Constraint versions in force at `as_of` (current versions when `None`)
    pub(crate) fn constraints_at(&self, as_of: Option<u64>) -> LedgerResult<Vec<Constraint>> {
        let Some(at) = as_of else {
            return self.current_constraints();
        };
        let mut constraints = Vec::new();
        for current in self.store.list_constraints()? {
            let history = self.store.constraint_history(current.id)?;
            if let Some(version) = history.into_iter().rev().find(|c| c.updated_at <= at) {
                constraints.push(version);
            }
        }
        Ok(constraints)
    }

    /// Stored claims of an organism, soft-deleted ones included
    pub(crate) fn current_state(&self, organism_id: OrganismId) -> LedgerResult<OrganismState> {
        let claims = self.store.list_claims(
            organism_id,
            &ClaimFilter {
                include_deleted: true,
                ..Default::default()
            },
        )?;
        Ok(OrganismState::from_claims(organism_id, claims))
    }

    /// State at `as_of` rebuilt from the log, or current state
    pub(crate) fn state_at(&self, organism_id: OrganismId, as_of: Option<u64>) -> LedgerResult<OrganismState> {
        match as_of {
            None => self.current_state(organism_id),
            Some(_) => self.replay(organism_id, as_of),
        }
    }

    pub(crate) fn load_mutation(&self, id: MutationId) -> LedgerResult<Mutation> {
        self.store
            .get_mutation(id)?
            .ok_or_else(|| LedgerError::not_found("mutation", id))
    }

    pub(crate) fn load_conflict(&self, id: ConflictId) -> LedgerResult<Conflict> {
        self.store
            .get_conflict(id)?
            .ok_or_else(|| LedgerError::not_found("conflict", id))
    }

    pub(crate) fn organism_conflicts(&self, organism_id: OrganismId) -> LedgerResult<Vec<Conflict>> {
        Ok(self.store.list_conflicts(&ConflictFilter {
            organism_id: Some(organism_id),
            ..Default::default()
        })?)
    }

    /// Conflicts that were active at `as_of` (currently active when `None`)
    pub(crate) fn active_conflicts_at(&self, organism_id: OrganismId, as_of: Option<u64>) -> LedgerResult<Vec<Conflict>> {
        Ok(self
            .organism_conflicts(organism_id)?
            .into_iter()
            .filter(|c| match as_of {
                None => c.is_active(),
                Some(at) => c.status_at(at) == Some(ledger_domain::ConflictStatus::Active),
            })
            .collect())
    }

    /// Evaluate every constraint over `state` and compute coherence
    pub(crate) fn assess(
        &self,
        organism: &Organism,
        state: &OrganismState,
        lenses: &BTreeMap<LensKey, Lens>,
        constraints: &[Constraint],
        conflicts: &[Conflict],
    ) -> Assessment {
        let ctx = EvaluationContext::new(organism, state, lenses);
        let results = self.evaluator.evaluate_organism(constraints, &ctx);

        let total_drift = drift::total_drift(
            state
                .live_claims()
                .map(|claim| (drift::drift(claim, ctx.scale(&claim.lens)), claim.weight)),
        );

        let failures = results.iter().filter(|r| r.blocks()).map(|r| {
            let weights: Vec<f64> = match r.subject.and_then(|id| state.by_id(id)) {
                Some(subject) => vec![subject.weight],
                None => r
                    .involved_claims
                    .iter()
                    .filter_map(|id| state.by_id(*id))
                    .map(|c| c.weight)
                    .collect(),
            };
            let weight = if weights.is_empty() {
                1.0
            } else {
                ledger_domain::conflict::mean_weight(&weights)
            };
            (r.effective_penalty(), weight)
        });
        let constraint_burden = drift::constraint_burden(failures);
        let conflict_burden = drift::conflict_burden(conflicts);

        Assessment {
            breakdown: drift::coherence(conflict_burden, constraint_burden, total_drift, self.config.coherence_weights),
            results,
        }
    }
}
