//! Constraint module - declarative rules as data
//!
//! A constraint is a versioned rule object. The rule itself is a tagged-union
//! AST ([`Rule`]) evaluated by the gatekeeper crate; nothing here executes.

use crate::lens::{LensKey, ValueSchema};
use crate::mutation::ChangeOp;
use crate::organism::Organism;
use crate::value::Value;
use crate::{Claim, ClaimId, ConstraintId, OrganismId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Soft penalty bounds used by constraint burden
pub const SOFT_PENALTY_RANGE: (f64, f64) = (0.1, 0.5);

/// Hard constraints block commit; soft ones require a tradeoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks commit
    Hard,
    /// Requires a tradeoff
    Soft,
}

impl Severity {
    /// Get the severity name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Hard => "hard",
            Severity::Soft => "soft",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precedence tier of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One specific claim
    Claim,
    /// One organism (or organism type)
    Organism,
    /// One lens across organisms
    Lens,
    /// A lens cluster
    Cluster,
    /// Everything
    Global,
}

impl Scope {
    /// Resolution order: claim > organism > lens > cluster > global
    pub fn precedence(&self) -> u8 {
        match self {
            Scope::Claim => 5,
            Scope::Organism => 4,
            Scope::Lens => 3,
            Scope::Cluster => 2,
            Scope::Global => 1,
        }
    }

    /// Get the scope name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Claim => "claim",
            Scope::Organism => "organism",
            Scope::Lens => "lens",
            Scope::Cluster => "cluster",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target selector; every present field must match
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Specific claim
    #[serde(default)]
    pub claim: Option<ClaimId>,

    /// Specific organism
    #[serde(default)]
    pub organism: Option<OrganismId>,

    /// Organism category
    #[serde(default)]
    pub organism_type: Option<String>,

    /// Specific lens
    #[serde(default)]
    pub lens: Option<LensKey>,

    /// Lens cluster
    #[serde(default)]
    pub cluster: Option<String>,
}

impl Selector {
    /// Selector matching every claim of one lens
    pub fn lens(lens: LensKey) -> Self {
        Self {
            lens: Some(lens),
            ..Default::default()
        }
    }

    /// Selector matching one organism
    pub fn organism(organism: OrganismId) -> Self {
        Self {
            organism: Some(organism),
            ..Default::default()
        }
    }

    /// Subject-bound selectors are evaluated once per matching claim
    pub fn is_subject_bound(&self) -> bool {
        self.claim.is_some() || self.lens.is_some() || self.cluster.is_some()
    }

    /// Whether the organism-level fields match
    pub fn matches_organism(&self, organism: &Organism) -> bool {
        self.organism.is_none_or(|id| id == organism.id)
            && self
                .organism_type
                .as_ref()
                .is_none_or(|t| *t == organism.organism_type)
    }

    /// Whether the claim-level fields match
    pub fn matches_claim(&self, claim: &Claim) -> bool {
        self.claim.is_none_or(|id| id == claim.id)
            && self.organism.is_none_or(|id| id == claim.organism_id)
            && self.lens.as_ref().is_none_or(|l| *l == claim.lens)
            && self.cluster.as_ref().is_none_or(|c| c == claim.lens.cluster())
    }

    /// Check that the selector carries what `scope` needs
    pub fn check_scope(&self, scope: Scope) -> Result<(), String> {
        let ok = match scope {
            Scope::Claim => self.claim.is_some(),
            Scope::Organism => self.organism.is_some() || self.organism_type.is_some(),
            Scope::Lens => self.lens.is_some(),
            Scope::Cluster => self.cluster.is_some(),
            Scope::Global => true,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("{} scope needs a matching selector field", scope))
        }
    }
}

/// What to do when a constraint fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFail {
    /// Require a tradeoff (always true for soft constraints)
    #[serde(default = "yes")]
    pub require_tradeoff: bool,

    /// Publish a `constraint_failed` event
    #[serde(default)]
    pub emit_event: bool,

    /// Allow the conflict detector to record a conflict
    #[serde(default = "yes")]
    pub create_conflict: bool,
}

fn yes() -> bool {
    true
}

impl Default for OnFail {
    fn default() -> Self {
        Self {
            require_tradeoff: true,
            emit_event: false,
            create_conflict: true,
        }
    }
}

/// Value source for comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum Operand {
    /// A constant
    Literal {
        /// The constant
        value: Value,
    },
    /// The subject claim's value
    Value,
    /// The subject's value before the change under validation
    Previous,
    /// The subject's baseline value
    Baseline,
    /// The subject's weight
    Weight,
    /// Another claim of the same organism
    Lens {
        /// Lens to read
        key: LensKey,
    },
    /// A dotted path into the subject's structured value
    Field {
        /// Path to read
        path: String,
    },
}

impl Operand {
    /// Shorthand for a literal
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal { value: value.into() }
    }

    /// Shorthand for another lens
    pub fn lens(key: LensKey) -> Self {
        Operand::Lens { key }
    }

    /// Whether reading this operand needs a subject claim
    pub fn needs_subject(&self) -> bool {
        matches!(
            self,
            Operand::Value | Operand::Previous | Operand::Baseline | Operand::Weight | Operand::Field { .. }
        )
    }

    /// Short label used in evidence
    pub fn label(&self) -> String {
        match self {
            Operand::Literal { value } => value.to_string(),
            Operand::Value => "value".to_string(),
            Operand::Previous => "previous".to_string(),
            Operand::Baseline => "baseline".to_string(),
            Operand::Weight => "weight".to_string(),
            Operand::Lens { key } => format!("lens({})", key),
            Operand::Field { path } => format!("field({})", path),
        }
    }
}

/// "lens holds one of values"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    /// Lens to inspect
    pub lens: LensKey,

    /// Matching values
    pub values: Vec<Value>,
}

impl Clause {
    /// Create a clause
    pub fn new(lens: LensKey, values: Vec<Value>) -> Self {
        Self { lens, values }
    }
}

/// One row of a `compatible_with` matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compatibility {
    /// Subject value this row applies to
    pub when: Value,

    /// Values the other lens may hold
    pub allowed: Vec<Value>,
}

/// Rule expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Rule {
    /// All hold
    And {
        /// Sub-rules
        rules: Vec<Rule>,
    },
    /// Any holds
    Or {
        /// Sub-rules
        rules: Vec<Rule>,
    },
    /// Negation
    Not {
        /// Sub-rule
        rule: Box<Rule>,
    },
    /// Exactly one holds
    Xor {
        /// Sub-rules
        rules: Vec<Rule>,
    },
    /// left == right
    Eq {
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// left != right
    Neq {
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// left > right
    Gt {
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// left >= right
    Gte {
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// left < right
    Lt {
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// left <= right
    Lte {
        /// Left operand
        left: Operand,
        /// Right operand
        right: Operand,
    },
    /// operand ∈ values
    In {
        /// Operand
        operand: Operand,
        /// Allowed values
        values: Vec<Value>,
    },
    /// operand ∉ values
    NotIn {
        /// Operand
        operand: Operand,
        /// Forbidden values
        values: Vec<Value>,
    },
    /// min <= operand <= max
    Between {
        /// Operand
        operand: Operand,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
    /// |operand - target| <= tolerance
    WithinTolerance {
        /// Operand
        operand: Operand,
        /// Target
        target: Operand,
        /// Allowed absolute difference
        tolerance: f64,
    },
    /// |value - previous| <= max
    MaxDelta {
        /// Largest allowed step
        max: f64,
    },
    /// Operand is present and non-empty
    Exists {
        /// Operand
        operand: Operand,
    },
    /// Operand is absent or empty
    Missing {
        /// Operand
        operand: Operand,
    },
    /// cardinality(operand) >= count
    CountGte {
        /// Operand
        operand: Operand,
        /// Minimum cardinality
        count: usize,
    },
    /// cardinality(operand) <= count
    CountLte {
        /// Operand
        operand: Operand,
        /// Maximum cardinality
        count: usize,
    },
    /// Fails when both clauses hold at once
    Exclusion {
        /// First clause
        left: Clause,
        /// Second clause
        right: Clause,
    },
    /// The organism must hold a live claim for `lens`
    Requires {
        /// Required lens
        lens: LensKey,
    },
    /// When `when` holds, `then` must hold
    Implies {
        /// Antecedent
        when: Clause,
        /// Consequent
        then: Clause,
    },
    /// Subject value constrains another lens through a matrix
    CompatibleWith {
        /// Other lens
        lens: LensKey,
        /// Compatibility rows
        matrix: Vec<Compatibility>,
    },
    /// Subject value satisfies a schema (inline, or the lens's own)
    Schema {
        /// Inline schema
        #[serde(default)]
        schema: Option<ValueSchema>,
    },
    /// drift(subject) <= max
    DriftLte {
        /// Threshold
        max: f64,
    },
    /// drift(subject) × weight <= max
    WeightedDriftLte {
        /// Threshold
        max: f64,
    },
}

impl Rule {
    /// Operator name, also the rule "family" for precedence shadowing
    pub fn operator(&self) -> &'static str {
        match self {
            Rule::And { .. } => "and",
            Rule::Or { .. } => "or",
            Rule::Not { .. } => "not",
            Rule::Xor { .. } => "xor",
            Rule::Eq { .. } => "eq",
            Rule::Neq { .. } => "neq",
            Rule::Gt { .. } => "gt",
            Rule::Gte { .. } => "gte",
            Rule::Lt { .. } => "lt",
            Rule::Lte { .. } => "lte",
            Rule::In { .. } => "in",
            Rule::NotIn { .. } => "not_in",
            Rule::Between { .. } => "between",
            Rule::WithinTolerance { .. } => "within_tolerance",
            Rule::MaxDelta { .. } => "max_delta",
            Rule::Exists { .. } => "exists",
            Rule::Missing { .. } => "missing",
            Rule::CountGte { .. } => "count_gte",
            Rule::CountLte { .. } => "count_lte",
            Rule::Exclusion { .. } => "exclusion",
            Rule::Requires { .. } => "requires",
            Rule::Implies { .. } => "implies",
            Rule::CompatibleWith { .. } => "compatible_with",
            Rule::Schema { .. } => "schema",
            Rule::DriftLte { .. } => "drift_lte",
            Rule::WeightedDriftLte { .. } => "weighted_drift_lte",
        }
    }

    /// Sub-rules of a boolean combinator
    pub fn children(&self) -> Vec<&Rule> {
        match self {
            Rule::And { rules } | Rule::Or { rules } | Rule::Xor { rules } => rules.iter().collect(),
            Rule::Not { rule } => vec![rule.as_ref()],
            _ => Vec::new(),
        }
    }

    fn operands(&self) -> Vec<&Operand> {
        match self {
            Rule::Eq { left, right }
            | Rule::Neq { left, right }
            | Rule::Gt { left, right }
            | Rule::Gte { left, right }
            | Rule::Lt { left, right }
            | Rule::Lte { left, right } => vec![left, right],
            Rule::In { operand, .. }
            | Rule::NotIn { operand, .. }
            | Rule::Between { operand, .. }
            | Rule::Exists { operand }
            | Rule::Missing { operand }
            | Rule::CountGte { operand, .. }
            | Rule::CountLte { operand, .. } => vec![operand],
            Rule::WithinTolerance { operand, target, .. } => vec![operand, target],
            _ => Vec::new(),
        }
    }

    /// Every lens the rule reads other than its subject's, recursively
    pub fn referenced_lenses(&self) -> Vec<LensKey> {
        let mut lenses = Vec::new();
        self.collect_lenses(&mut lenses);
        lenses
    }

    fn collect_lenses(&self, out: &mut Vec<LensKey>) {
        let mut push = |key: &LensKey| {
            if !out.contains(key) {
                out.push(key.clone());
            }
        };
        for operand in self.operands() {
            if let Operand::Lens { key } = operand {
                push(key);
            }
        }
        match self {
            Rule::Exclusion { left, right } => {
                push(&left.lens);
                push(&right.lens);
            }
            Rule::Implies { when, then } => {
                push(&when.lens);
                push(&then.lens);
            }
            Rule::Requires { lens } | Rule::CompatibleWith { lens, .. } => push(lens),
            _ => {}
        }
        for child in self.children() {
            child.collect_lenses(out);
        }
    }

    /// Whether evaluating the rule needs a subject claim
    pub fn needs_subject(&self) -> bool {
        let direct = match self {
            Rule::MaxDelta { .. }
            | Rule::CompatibleWith { .. }
            | Rule::Schema { .. }
            | Rule::DriftLte { .. }
            | Rule::WeightedDriftLte { .. } => true,
            _ => self.operands().iter().any(|o| o.needs_subject()),
        };
        direct || self.children().iter().any(|c| c.needs_subject())
    }
}

/// A versioned rule object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    /// Unique identifier (stable across versions)
    pub id: ConstraintId,

    /// Human name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Version, bumped on re-registration
    pub version: u32,

    /// Hard or soft
    pub severity: Severity,

    /// Precedence tier
    pub scope: Scope,

    /// Target selector
    #[serde(default)]
    pub selector: Selector,

    /// Optional guard; the rule is skipped when the guard does not hold
    #[serde(default)]
    pub guard: Option<Rule>,

    /// Rule expression
    pub rule: Rule,

    /// Failure directives
    #[serde(default)]
    pub on_fail: OnFail,

    /// Penalty per unit weight used by constraint burden
    #[serde(default = "default_soft_penalty")]
    pub soft_penalty: f64,

    /// Retired constraints are kept but not evaluated
    #[serde(default = "yes")]
    pub active: bool,

    /// Creation time (ms)
    pub created_at: u64,

    /// Last version time (ms)
    pub updated_at: u64,
}

fn default_soft_penalty() -> f64 {
    0.25
}

impl Constraint {
    /// Create a constraint at version 1
    pub fn new(name: impl Into<String>, severity: Severity, scope: Scope, selector: Selector, rule: Rule, now: u64) -> Self {
        Self {
            id: ConstraintId::new(),
            name: name.into(),
            description: None,
            version: 1,
            severity,
            scope,
            selector,
            guard: None,
            rule,
            on_fail: OnFail::default(),
            soft_penalty: default_soft_penalty(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a guard
    pub fn with_guard(mut self, guard: Rule) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Set failure directives
    pub fn with_on_fail(mut self, on_fail: OnFail) -> Self {
        self.on_fail = on_fail;
        self
    }

    /// Clamp the penalty and force `require_tradeoff` for soft rules
    pub fn normalized(mut self) -> Self {
        let (lo, hi) = SOFT_PENALTY_RANGE;
        self.soft_penalty = if self.soft_penalty.is_finite() {
            self.soft_penalty.clamp(lo, hi)
        } else {
            default_soft_penalty()
        };
        if self.severity == Severity::Soft {
            self.on_fail.require_tradeoff = true;
        }
        self
    }

    /// Whether this is a hard constraint
    pub fn is_hard(&self) -> bool {
        self.severity == Severity::Hard
    }

    /// Whether the constraint is evaluated once per matching claim
    pub fn is_subject_bound(&self) -> bool {
        self.selector.is_subject_bound()
    }

    /// Penalty per unit weight when failing: infinite for hard constraints
    pub fn penalty(&self) -> f64 {
        match self.severity {
            Severity::Hard => f64::INFINITY,
            Severity::Soft => self.soft_penalty,
        }
    }
}

/// Machine-readable evidence for one evaluation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    /// Operator evaluated
    pub operator: String,

    /// Expected value or bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,

    /// Observed value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,

    /// Human-readable detail
    pub detail: String,

    /// Numbers computed along the way (drift, delta, count, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,

    /// Evidence of sub-rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Evidence>,
}

impl Evidence {
    /// Evidence with a detail line
    pub fn new(operator: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            detail: detail.into(),
            ..Default::default()
        }
    }

    /// Record expected and actual values
    pub fn with_values(mut self, expected: Option<Value>, actual: Option<Value>) -> Self {
        self.expected = expected;
        self.actual = actual;
        self
    }

    /// Record a metric
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// A concrete follow-up change that would repair a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairHint {
    /// Claim to change (absent when the fix creates a claim)
    #[serde(default)]
    pub claim_id: Option<ClaimId>,

    /// Lens to change
    pub lens: LensKey,

    /// Op to submit
    pub op: ChangeOp,

    /// Why this helps
    pub reason: String,
}

/// An obligation recorded by a passing rule (`implies` with an absent consequent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpliedState {
    /// Lens the obligation is about
    pub lens: LensKey,

    /// Values the lens must take
    pub values: Vec<Value>,

    /// Constraint that implied it
    pub constraint_id: ConstraintId,

    /// Claim that triggered the antecedent
    #[serde(default)]
    pub because: Option<ClaimId>,
}

/// Outcome of one constraint against one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintResult {
    /// Constraint evaluated
    pub constraint_id: ConstraintId,

    /// Version that produced this result
    pub constraint_version: u32,

    /// Constraint name
    pub constraint_name: String,

    /// Precedence tier
    pub scope: Scope,

    /// Hard or soft
    pub severity: Severity,

    /// Subject claim (absent for organism-bound constraints)
    #[serde(default)]
    pub subject: Option<ClaimId>,

    /// Lens the result is about
    #[serde(default)]
    pub lens: Option<LensKey>,

    /// Every lens the outcome depends on; a covering tradeoff names one of them
    #[serde(default)]
    pub lenses: Vec<LensKey>,

    /// Whether the rule held
    pub passed: bool,

    /// Guard did not hold; the rule was not evaluated
    #[serde(default)]
    pub skipped: bool,

    /// Higher-precedence constraint whose passing result overrides this failure
    #[serde(default)]
    pub shadowed_by: Option<ConstraintId>,

    /// Evidence
    pub evidence: Evidence,

    /// Suggested fixes
    #[serde(default)]
    pub repair_hints: Vec<RepairHint>,

    /// Claims the outcome depends on
    #[serde(default)]
    pub involved_claims: Vec<ClaimId>,

    /// Obligations recorded by a passing rule
    #[serde(default)]
    pub implied: Vec<ImpliedState>,

    /// Soft penalty per unit weight
    pub penalty: f64,

    /// Change index after which this result was computed
    #[serde(default)]
    pub step: usize,
}

impl ConstraintResult {
    /// A failing result that is not shadowed counts against the mutation
    pub fn blocks(&self) -> bool {
        !self.passed && self.shadowed_by.is_none()
    }

    /// Blocking hard failure
    pub fn is_hard_failure(&self) -> bool {
        self.blocks() && self.severity == Severity::Hard
    }

    /// Blocking soft failure
    pub fn is_soft_failure(&self) -> bool {
        self.blocks() && self.severity == Severity::Soft
    }

    /// Penalty used by constraint burden: infinite for hard failures
    pub fn effective_penalty(&self) -> f64 {
        match self.severity {
            Severity::Hard => f64::INFINITY,
            Severity::Soft => self.penalty,
        }
    }

    /// Whether a tradeoff covering one of `self.lenses` was supplied
    pub fn is_covered_by(&self, tradeoffs: &[crate::Tradeoff]) -> bool {
        tradeoffs.iter().any(|t| {
            self.constraint_is(t.constraint_id) && self.lenses.iter().any(|l| t.references(l))
        })
    }

    fn constraint_is(&self, id: Option<ConstraintId>) -> bool {
        id.is_none_or(|id| id == self.constraint_id)
    }
}
