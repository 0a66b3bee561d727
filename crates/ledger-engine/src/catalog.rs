//! Organisms, lenses, constraints

use crate::{ConflictSweep, Ledger, LedgerError, LedgerResult};
use ledger_domain::{
    Constraint, ConstraintId, Lens, LensKey, OnFail, Organism, OrganismId, Resolver, Rule, Scope, Selector,
    Severity, ValueKind, ValueSchema,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Lens registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LensDraft {
    /// `cluster.path` key
    pub key: LensKey,
    /// Value kind
    pub kind: ValueKind,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Enumeration variants
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Validation schema
    #[serde(default)]
    pub schema: Option<ValueSchema>,
    /// Makes the lens computed
    #[serde(default)]
    pub resolver: Option<Resolver>,
    /// Numeric drift scale
    #[serde(default)]
    pub scale: Option<f64>,
}

impl LensDraft {
    /// Draft with only a key and a kind
    pub fn new(key: LensKey, kind: ValueKind) -> Self {
        Self {
            key,
            kind,
            description: None,
            allowed: Vec::new(),
            schema: None,
            resolver: None,
            scale: None,
        }
    }
}

/// Constraint registration request
///
/// Without `id` a new constraint is created. With the id of an existing one,
/// a new version replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDraft {
    /// Constraint to re-version
    #[serde(default)]
    pub id: Option<ConstraintId>,
    /// Human name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Hard or soft
    pub severity: Severity,
    /// Precedence tier
    pub scope: Scope,
    /// Target selector
    #[serde(default)]
    pub selector: Selector,
    /// Guard
    #[serde(default)]
    pub guard: Option<Rule>,
    /// Rule expression
    pub rule: Rule,
    /// Failure directives
    #[serde(default)]
    pub on_fail: OnFail,
    /// Penalty per unit weight; the configured default when absent
    #[serde(default)]
    pub soft_penalty: Option<f64>,
    /// Whether the version is in force
    #[serde(default = "active")]
    pub active: bool,
}

fn active() -> bool {
    true
}

impl ConstraintDraft {
    /// Draft of a new active constraint
    pub fn new(name: impl Into<String>, severity: Severity, scope: Scope, selector: Selector, rule: Rule) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            severity,
            scope,
            selector,
            guard: None,
            rule,
            on_fail: OnFail::default(),
            soft_penalty: None,
            active: true,
        }
    }
}

impl Ledger {
    /// Create an organism
    pub fn create_organism(&self, name: &str, organism_type: &str, tags: Vec<String>) -> LedgerResult<Organism> {
        if name.trim().is_empty() || organism_type.trim().is_empty() {
            return Err(LedgerError::InvalidOperation(
                "organism needs a name and a type".into(),
            ));
        }
        let organism = Organism::new(name.trim(), organism_type.trim(), self.now()).with_tags(tags);
        self.store.put_organism(&organism)?;
        info!(organism = %organism.id, name = %organism.name, "Organism created");
        Ok(organism)
    }

    /// Get an organism
    pub fn get_organism(&self, id: OrganismId) -> LedgerResult<Organism> {
        self.load_organism(id)
    }

    /// Every organism, oldest first
    pub fn list_organisms(&self) -> LedgerResult<Vec<Organism>> {
        Ok(self.store.list_organisms()?)
    }

    /// Archive an organism; its history stays readable, new mutations are refused
    pub fn archive_organism(&self, id: OrganismId) -> LedgerResult<Organism> {
        let mut organism = self.load_organism(id)?;
        if !organism.archived {
            organism.archived = true;
            self.store.put_organism(&organism)?;
            info!(organism = %id, "Organism archived");
        }
        Ok(organism)
    }

    /// Register a lens, or re-version the lens with the same key
    pub fn register_lens(&self, draft: LensDraft) -> LedgerResult<Lens> {
        if !draft.allowed.is_empty() && draft.kind != ValueKind::Enumeration {
            return Err(LedgerError::InvalidOperation(format!(
                "lens {} declares variants but is not an enumeration",
                draft.key
            )));
        }
        if let Some(resolver) = &draft.resolver {
            if resolver.formula.inputs().contains(&draft.key) {
                return Err(LedgerError::InvalidOperation(format!(
                    "lens {} cannot be computed from itself",
                    draft.key
                )));
            }
            if draft.kind != ValueKind::Number {
                return Err(LedgerError::InvalidOperation(format!(
                    "computed lens {} must be numeric",
                    draft.key
                )));
            }
        }
        if draft.scale.is_some_and(|s| !s.is_finite() || s <= 0.0) {
            return Err(LedgerError::InvalidOperation(format!(
                "lens {} has a non-positive scale",
                draft.key
            )));
        }

        let existing = self.store.get_lens(&draft.key)?;
        let mut lens = Lens::new(draft.key, draft.kind).with_allowed(draft.allowed);
        lens.description = draft.description;
        lens.schema = draft.schema;
        lens.resolver = draft.resolver;
        lens.scale = draft.scale;
        if let Some(previous) = existing {
            lens.id = previous.id;
            lens.version = previous.version + 1;
        }

        self.store.put_lens(&lens)?;
        info!(lens = %lens.key, version = lens.version, "Lens registered");
        Ok(lens)
    }

    /// Get a lens by key
    pub fn get_lens(&self, key: &LensKey) -> LedgerResult<Lens> {
        self.store
            .get_lens(key)?
            .ok_or_else(|| LedgerError::not_found("lens", key))
    }

    /// Every lens, ordered by key
    pub fn list_lenses(&self) -> LedgerResult<Vec<Lens>> {
        Ok(self.store.list_lenses()?)
    }

    /// Register a constraint (or a new version of one) and re-evaluate the
    /// organisms it applies to
    pub fn register_constraint(&self, draft: ConstraintDraft) -> LedgerResult<Constraint> {
        draft
            .selector
            .check_scope(draft.scope)
            .map_err(LedgerError::InvalidOperation)?;

        let now = self.now();
        let mut constraint = Constraint::new(draft.name, draft.severity, draft.scope, draft.selector, draft.rule, now);
        constraint.description = draft.description;
        constraint.guard = draft.guard;
        constraint.on_fail = draft.on_fail;
        constraint.soft_penalty = draft.soft_penalty.unwrap_or_else(|| self.config.soft_penalty());
        constraint.active = draft.active;

        if let Some(id) = draft.id {
            let previous = self
                .store
                .get_constraint(id)?
                .ok_or_else(|| LedgerError::not_found("constraint", id))?;
            constraint.id = id;
            constraint.version = previous.version + 1;
            constraint.created_at = previous.created_at;
        }

        let constraint = constraint.normalized();
        self.store.put_constraint(&constraint)?;
        info!(
            constraint = %constraint.id,
            version = constraint.version,
            severity = %constraint.severity,
            scope = %constraint.scope,
            "Constraint registered"
        );

        self.reevaluate_matching(&constraint);
        Ok(constraint)
    }

    /// Current version of a constraint
    pub fn get_constraint(&self, id: ConstraintId) -> LedgerResult<Constraint> {
        self.store
            .get_constraint(id)?
            .ok_or_else(|| LedgerError::not_found("constraint", id))
    }

    /// Current versions of every constraint
    pub fn list_constraints(&self) -> LedgerResult<Vec<Constraint>> {
        self.current_constraints()
    }

    /// Every version of a constraint, oldest first
    pub fn constraint_history(&self, id: ConstraintId) -> LedgerResult<Vec<Constraint>> {
        let history = self.store.constraint_history(id)?;
        if history.is_empty() {
            return Err(LedgerError::not_found("constraint", id));
        }
        Ok(history)
    }

    /// Retire a constraint by storing an inactive version
    pub fn retire_constraint(&self, id: ConstraintId) -> LedgerResult<Constraint> {
        let mut constraint = self.get_constraint(id)?;
        if !constraint.active {
            return Ok(constraint);
        }
        constraint.version += 1;
        constraint.active = false;
        constraint.updated_at = self.now();
        self.store.put_constraint(&constraint)?;
        info!(constraint = %id, version = constraint.version, "Constraint retired");

        self.reevaluate_matching(&constraint);
        Ok(constraint)
    }

    /// Re-run conflict detection for one organism against its current state
    pub fn reevaluate(&self, organism_id: OrganismId) -> LedgerResult<ConflictSweep> {
        let organism = self.load_organism(organism_id)?;
        let sweep = self.detect_conflicts(&organism, None, self.now())?;
        self.invalidate_projections(organism_id);
        Ok(sweep)
    }

    fn reevaluate_matching(&self, constraint: &Constraint) {
        let organisms = match self.store.list_organisms() {
            Ok(organisms) => organisms,
            Err(e) => {
                warn!(constraint = %constraint.id, error = %e, "Could not list organisms for re-evaluation");
                return;
            }
        };
        for organism in organisms
            .into_iter()
            .filter(|o| !o.archived && constraint.selector.matches_organism(o))
        {
            if let Err(e) = self.reevaluate(organism.id) {
                warn!(organism = %organism.id, error = %e, "Re-evaluation failed");
            }
        }
    }
}
