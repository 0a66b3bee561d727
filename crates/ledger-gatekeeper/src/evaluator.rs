//! Constraint evaluation logic

use crate::{EvaluationError, EvaluatorConfig};
use ledger_domain::drift;
use ledger_domain::{
    Claim, ClaimId, Clause, Constraint, ConstraintResult, Evidence, ImpliedState, Lens, LensKey, Operand, Organism,
    OrganismState, RepairHint, Rule, ChangeOp, Value,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// Everything a rule may read
///
/// `state` is the state under test (current, or a what-if copy during
/// validation). `previous` is the state before the change being validated and
/// backs the `previous` operand.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    /// Organism the claims belong to
    pub organism: &'a Organism,

    /// State under test
    pub state: &'a OrganismState,

    /// State before the change under validation
    pub previous: Option<&'a OrganismState>,

    /// Lens catalog (scales, schemas, resolvers)
    pub lenses: &'a BTreeMap<LensKey, Lens>,

    /// Change index recorded on every result
    pub step: usize,
}

impl<'a> EvaluationContext<'a> {
    /// Context over a settled state
    pub fn new(organism: &'a Organism, state: &'a OrganismState, lenses: &'a BTreeMap<LensKey, Lens>) -> Self {
        Self {
            organism,
            state,
            previous: None,
            lenses,
            step: 0,
        }
    }

    /// Attach the pre-change state
    pub fn with_previous(mut self, previous: &'a OrganismState) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Tag results with a change index
    pub fn at_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Numeric drift scale declared for a lens
    pub fn scale(&self, lens: &LensKey) -> Option<f64> {
        self.lenses.get(lens).and_then(Lens::distance_scale)
    }

    /// Value a lens holds: the live claim's value, else the resolver result
    pub fn lens_value(&self, key: &LensKey) -> Option<Value> {
        if let Some(value) = self.state.value(key) {
            return Some(value.clone());
        }
        let resolver = self.lenses.get(key)?.resolver.as_ref()?;
        resolver
            .formula
            .evaluate(|input| self.state.numeric(input))
            .map(Value::Number)
    }
}

/// One constraint paired with the claim it is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct Target<'c> {
    /// Constraint
    pub constraint: &'c Constraint,

    /// Subject claim; `None` for organism-level evaluation
    pub subject: Option<ClaimId>,
}

#[derive(Debug)]
struct Outcome {
    passed: bool,
    evidence: Evidence,
    involved: Vec<ClaimId>,
    implied: Vec<(LensKey, Vec<Value>, Option<ClaimId>)>,
    hints: Vec<RepairHint>,
}

impl Outcome {
    fn new(passed: bool, evidence: Evidence) -> Self {
        Self {
            passed,
            evidence,
            involved: Vec::new(),
            implied: Vec::new(),
            hints: Vec::new(),
        }
    }

    fn involving(mut self, claim: Option<&Claim>) -> Self {
        if let Some(claim) = claim {
            if !self.involved.contains(&claim.id) {
                self.involved.push(claim.id);
            }
        }
        self
    }

    fn hint(mut self, claim_id: Option<ClaimId>, lens: &LensKey, op: ChangeOp, reason: impl Into<String>) -> Self {
        if !self.passed {
            self.hints.push(RepairHint {
                claim_id,
                lens: lens.clone(),
                op,
                reason: reason.into(),
            });
        }
        self
    }

    fn absorb(&mut self, child: &Outcome) {
        for id in &child.involved {
            if !self.involved.contains(id) {
                self.involved.push(*id);
            }
        }
    }
}

/// Constraint evaluator
pub struct ConstraintEvaluator {
    config: EvaluatorConfig,
}

impl ConstraintEvaluator {
    /// Create a new evaluator with configuration
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    /// Create an evaluator with default configuration
    pub fn default_config() -> Self {
        Self::new(EvaluatorConfig::default())
    }

    /// Active configuration
    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Whether `constraint` applies to `claim` as its subject
    ///
    /// A constraint applies when its selector matches the claim, or when the
    /// claim has the constraint attached.
    pub fn applies_to(constraint: &Constraint, claim: &Claim, organism: &Organism) -> bool {
        if !constraint.active || !claim.is_live() || !constraint.selector.matches_organism(organism) {
            return false;
        }
        let selected = constraint.is_subject_bound() && constraint.selector.matches_claim(claim);
        selected || claim.constraints.contains(&constraint.id)
    }

    /// Every (constraint, subject) pair that applies to the organism
    ///
    /// Ordered by scope precedence (highest first), then constraint id, then
    /// subject lens.
    pub fn targets<'c>(&self, constraints: &'c [Constraint], ctx: &EvaluationContext<'_>) -> Vec<Target<'c>> {
        let mut ordered: Vec<&Constraint> = constraints
            .iter()
            .filter(|c| c.active && c.selector.matches_organism(ctx.organism))
            .collect();
        ordered.sort_by(|a, b| {
            b.scope
                .precedence()
                .cmp(&a.scope.precedence())
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut targets = Vec::new();
        for constraint in ordered {
            let organism_level = !constraint.is_subject_bound() && !constraint.rule.needs_subject();
            if organism_level {
                // attached copies of an organism-level rule would only repeat it
                targets.push(Target {
                    constraint,
                    subject: None,
                });
                continue;
            }
            for claim in ctx.state.live_claims() {
                if Self::applies_to(constraint, claim, ctx.organism) {
                    targets.push(Target {
                        constraint,
                        subject: Some(claim.id),
                    });
                }
            }
        }
        targets
    }

    /// Targets whose outcome can change when `changed` lenses change
    ///
    /// Keeps constraints on the changed claims themselves plus any constraint
    /// whose rule or guard reads a changed lens.
    pub fn impacted<'c>(
        &self,
        constraints: &'c [Constraint],
        ctx: &EvaluationContext<'_>,
        changed: &[LensKey],
    ) -> Vec<Target<'c>> {
        self.targets(constraints, ctx)
            .into_iter()
            .filter(|target| {
                let on_subject = target
                    .subject
                    .and_then(|id| ctx.state.by_id(id))
                    .is_some_and(|claim| changed.contains(&claim.lens));
                on_subject || reads_any(target.constraint, changed)
            })
            .collect()
    }

    /// Evaluate every constraint applicable to `claim`
    ///
    /// Covers constraints with `claim` as subject and organism-level
    /// constraints that read its lens. Precedence is resolved on the output.
    pub fn evaluate(&self, claim: &Claim, constraints: &[Constraint], ctx: &EvaluationContext<'_>) -> Vec<ConstraintResult> {
        let changed = [claim.lens.clone()];
        let targets: Vec<Target<'_>> = self
            .targets(constraints, ctx)
            .into_iter()
            .filter(|t| match t.subject {
                Some(id) => id == claim.id,
                None => reads_any(t.constraint, &changed),
            })
            .collect();
        self.evaluate_targets(&targets, ctx)
    }

    /// Evaluate every applicable constraint over the whole organism
    pub fn evaluate_organism(&self, constraints: &[Constraint], ctx: &EvaluationContext<'_>) -> Vec<ConstraintResult> {
        let targets = self.targets(constraints, ctx);
        self.evaluate_targets(&targets, ctx)
    }

    /// Evaluate a list of targets and resolve precedence among the results
    pub fn evaluate_targets(&self, targets: &[Target<'_>], ctx: &EvaluationContext<'_>) -> Vec<ConstraintResult> {
        let mut results: Vec<ConstraintResult> = targets.iter().map(|t| self.evaluate_target(*t, ctx)).collect();
        resolve_precedence(&mut results);

        let failed = results.iter().filter(|r| r.blocks()).count();
        debug!(
            organism = %ctx.organism.id,
            step = ctx.step,
            evaluated = results.len(),
            failed,
            "Constraints evaluated"
        );
        results
    }

    /// Evaluate one constraint against one subject
    pub fn evaluate_target(&self, target: Target<'_>, ctx: &EvaluationContext<'_>) -> ConstraintResult {
        let constraint = target.constraint;
        let subject = target.subject.and_then(|id| ctx.state.by_id(id)).filter(|c| c.is_live());

        let mut lenses: Vec<LensKey> = subject.map(|s| s.lens.clone()).into_iter().collect();
        for lens in constraint.rule.referenced_lenses() {
            if !lenses.contains(&lens) {
                lenses.push(lens);
            }
        }

        let mut result = ConstraintResult {
            constraint_id: constraint.id,
            constraint_version: constraint.version,
            constraint_name: constraint.name.clone(),
            scope: constraint.scope,
            severity: constraint.severity,
            subject: subject.map(|s| s.id),
            lens: lenses.first().cloned(),
            lenses,
            passed: true,
            skipped: false,
            shadowed_by: None,
            evidence: Evidence::new(constraint.rule.operator(), ""),
            repair_hints: Vec::new(),
            involved_claims: subject.map(|s| s.id).into_iter().collect(),
            implied: Vec::new(),
            penalty: constraint.soft_penalty,
            step: ctx.step,
        };

        if let Some(guard) = &constraint.guard {
            match self.eval(guard, subject, ctx, 0) {
                Ok(outcome) if outcome.passed => {}
                Ok(outcome) => {
                    result.skipped = true;
                    result.evidence = Evidence::new("guard", "guard did not hold; rule not evaluated");
                    result.evidence.children.push(outcome.evidence);
                    return result;
                }
                Err(err) => return self.errored(result, err),
            }
        }

        let outcome = match self.eval(&constraint.rule, subject, ctx, 0) {
            Ok(outcome) => outcome,
            Err(err) => return self.errored(result, err),
        };

        result.passed = outcome.passed;
        result.evidence = outcome.evidence;
        for id in outcome.involved {
            if !result.involved_claims.contains(&id) {
                result.involved_claims.push(id);
            }
        }
        if outcome.passed {
            result.implied = outcome
                .implied
                .into_iter()
                .map(|(lens, values, because)| ImpliedState {
                    lens,
                    values,
                    constraint_id: constraint.id,
                    because,
                })
                .collect();
        } else if self.config.repair_hints {
            result.repair_hints = outcome.hints;
        }
        result
    }

    fn errored(&self, mut result: ConstraintResult, err: EvaluationError) -> ConstraintResult {
        debug!(constraint = %result.constraint_id, error = %err, "Rule could not be evaluated");
        result.evidence = Evidence::new(result.evidence.operator.clone(), err.to_string());
        if self.config.errors_as_failures {
            result.passed = false;
        } else {
            result.skipped = true;
        }
        result
    }

    fn eval(
        &self,
        rule: &Rule,
        subject: Option<&Claim>,
        ctx: &EvaluationContext<'_>,
        depth: usize,
    ) -> Result<Outcome, EvaluationError> {
        if depth > self.config.max_depth {
            return Err(EvaluationError::TooDeep(self.config.max_depth));
        }
        if rule.needs_subject() && subject.is_none() && rule.children().is_empty() {
            return Err(EvaluationError::MissingSubject {
                operator: rule.operator(),
            });
        }

        let op = rule.operator();
        match rule {
            Rule::And { rules } | Rule::Or { rules } | Rule::Xor { rules } => {
                if rules.is_empty() {
                    return Err(EvaluationError::InvalidRule(format!("{} needs at least one rule", op)));
                }
                let children = rules
                    .iter()
                    .map(|r| self.eval(r, subject, ctx, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.combine(rule, children))
            }
            Rule::Not { rule: inner } => {
                let child = self.eval(inner, subject, ctx, depth + 1)?;
                let mut evidence = Evidence::new(op, if child.passed { "sub-rule held" } else { "sub-rule did not hold" });
                let mut outcome = Outcome::new(!child.passed, Evidence::default());
                outcome.absorb(&child);
                evidence.children.push(child.evidence);
                outcome.evidence = evidence;
                Ok(outcome)
            }
            Rule::Eq { left, right }
            | Rule::Neq { left, right }
            | Rule::Gt { left, right }
            | Rule::Gte { left, right }
            | Rule::Lt { left, right }
            | Rule::Lte { left, right } => self.comparison(rule, left, right, subject, ctx),
            Rule::In { operand, values } | Rule::NotIn { operand, values } => {
                let negate = matches!(rule, Rule::NotIn { .. });
                let expected = Some(Value::List(values.clone()));
                let Some(actual) = self.resolve(operand, subject, ctx, op)? else {
                    return Ok(self.missing(op, operand, expected, subject, ctx));
                };
                let member = actual.is_in(values, self.config.epsilon);
                let passed = member != negate;
                let detail = match (member, negate) {
                    (true, false) => format!("{} is an allowed value", actual),
                    (false, false) => format!("{} is not in the allowed set", actual),
                    (true, true) => format!("{} is a forbidden value", actual),
                    (false, true) => format!("{} is not forbidden", actual),
                };
                let outcome = Outcome::new(passed, Evidence::new(op, detail).with_values(expected, Some(actual)))
                    .involving(self.operand_claim(operand, subject, ctx));
                Ok(match (subject, operand, negate) {
                    (Some(s), Operand::Value, false) => match values.first() {
                        Some(first) => outcome.hint(
                            Some(s.id),
                            &s.lens,
                            ChangeOp::Set { value: first.clone() },
                            "use an allowed value",
                        ),
                        None => outcome,
                    },
                    (Some(s), Operand::Value, true) if !s.baseline.value.is_in(values, self.config.epsilon) => outcome
                        .hint(
                            Some(s.id),
                            &s.lens,
                            ChangeOp::Set {
                                value: s.baseline.value.clone(),
                            },
                            "return to the baseline value",
                        ),
                    _ => outcome,
                })
            }
            Rule::Between { operand, min, max } => {
                if min > max {
                    return Err(EvaluationError::InvalidRule(format!("between bounds {} > {}", min, max)));
                }
                let expected = Some(Value::List(vec![Value::Number(*min), Value::Number(*max)]));
                let Some(actual) = self.resolve(operand, subject, ctx, op)? else {
                    return Ok(self.missing(op, operand, expected, subject, ctx));
                };
                let Some(n) = actual.as_f64() else {
                    return Ok(not_numeric(op, &actual, expected));
                };
                let eps = self.config.epsilon;
                let passed = n >= min - eps && n <= max + eps;
                let detail = if passed {
                    format!("{} is within [{}, {}]", n, min, max)
                } else {
                    format!("{} is outside [{}, {}]", n, min, max)
                };
                let outcome = Outcome::new(passed, Evidence::new(op, detail).with_values(expected, Some(actual)))
                    .involving(self.operand_claim(operand, subject, ctx));
                Ok(match (subject, operand) {
                    (Some(s), Operand::Value) => outcome.hint(
                        Some(s.id),
                        &s.lens,
                        ChangeOp::Set {
                            value: Value::Number(n.clamp(*min, *max)),
                        },
                        "move the value into range",
                    ),
                    _ => outcome,
                })
            }
            Rule::WithinTolerance {
                operand,
                target,
                tolerance,
            } => {
                let tolerance = if tolerance.is_finite() && *tolerance >= 0.0 {
                    *tolerance
                } else {
                    self.config.default_tolerance
                };
                let Some(target_value) = self.resolve(target, subject, ctx, op)? else {
                    return Ok(self.missing(op, target, None, subject, ctx));
                };
                let Some(actual) = self.resolve(operand, subject, ctx, op)? else {
                    return Ok(self.missing(op, operand, Some(target_value), subject, ctx));
                };
                let (Some(a), Some(t)) = (actual.as_f64(), target_value.as_f64()) else {
                    return Ok(not_numeric(op, &actual, Some(target_value)));
                };
                let difference = (a - t).abs();
                let passed = difference <= tolerance + self.config.epsilon;
                let detail = format!("|{} - {}| = {} against tolerance {}", a, t, difference, tolerance);
                let outcome = Outcome::new(
                    passed,
                    Evidence::new(op, detail)
                        .with_values(Some(target_value.clone()), Some(actual))
                        .with_metric("difference", difference)
                        .with_metric("tolerance", tolerance),
                )
                .involving(self.operand_claim(operand, subject, ctx))
                .involving(self.operand_claim(target, subject, ctx));
                Ok(match (subject, operand) {
                    (Some(s), Operand::Value) => outcome.hint(
                        Some(s.id),
                        &s.lens,
                        ChangeOp::Set { value: target_value },
                        "match the target value",
                    ),
                    _ => outcome,
                })
            }
            Rule::MaxDelta { max } => {
                let s = require_subject(subject, op)?;
                let expected = Some(Value::Number(*max));
                let Some(previous) = self.resolve(&Operand::Previous, subject, ctx, op)? else {
                    return Ok(Outcome::new(true, Evidence::new(op, "no previous value to compare")));
                };
                let (Some(v), Some(p)) = (s.value.as_f64(), previous.as_f64()) else {
                    return Ok(not_numeric(op, &s.value, expected));
                };
                let delta = (v - p).abs();
                let passed = delta <= max + self.config.epsilon;
                let detail = format!("moved {} from {} (limit {})", delta, p, max);
                let limit = if v >= p { p + max } else { p - max };
                Ok(Outcome::new(
                    passed,
                    Evidence::new(op, detail)
                        .with_values(expected, Some(Value::Number(delta)))
                        .with_metric("delta", delta),
                )
                .hint(
                    Some(s.id),
                    &s.lens,
                    ChangeOp::Set {
                        value: Value::Number(limit),
                    },
                    "take the largest allowed step",
                ))
            }
            Rule::Exists { operand } | Rule::Missing { operand } => {
                let want_present = matches!(rule, Rule::Exists { .. });
                let actual = self.resolve(operand, subject, ctx, op)?;
                let present = actual.as_ref().is_some_and(|v| !v.is_empty());
                let detail = if present {
                    format!("{} is present", operand.label())
                } else {
                    format!("{} is absent or empty", operand.label())
                };
                Ok(Outcome::new(present == want_present, Evidence::new(op, detail).with_values(None, actual))
                    .involving(self.operand_claim(operand, subject, ctx)))
            }
            Rule::CountGte { operand, count } | Rule::CountLte { operand, count } => {
                let actual = self.resolve(operand, subject, ctx, op)?;
                let n = actual.as_ref().map(Value::cardinality).unwrap_or(0);
                let passed = match rule {
                    Rule::CountGte { .. } => n >= *count,
                    _ => n <= *count,
                };
                let detail = format!("{} has {} element(s), bound {}", operand.label(), n, count);
                Ok(Outcome::new(
                    passed,
                    Evidence::new(op, detail)
                        .with_values(Some(Value::Number(*count as f64)), actual)
                        .with_metric("count", n as f64),
                )
                .involving(self.operand_claim(operand, subject, ctx)))
            }
            Rule::Exclusion { left, right } => Ok(self.exclusion(left, right, ctx)),
            Rule::Requires { lens } => {
                let present = ctx.lens_value(lens).is_some();
                let detail = if present {
                    format!("{} is held", lens)
                } else {
                    format!("organism holds no live claim for {}", lens)
                };
                Ok(Outcome::new(present, Evidence::new(op, detail))
                    .involving(ctx.state.live(lens))
                    .hint(None, lens, create_op(Value::Null), format!("create a claim for {}", lens)))
            }
            Rule::Implies { when, then } => Ok(self.implies(when, then, ctx)),
            Rule::CompatibleWith { lens, matrix } => {
                let s = require_subject(subject, op)?;
                let Some(row) = matrix.iter().find(|r| s.value.loosely_eq(&r.when, self.config.epsilon)) else {
                    return Ok(Outcome::new(
                        true,
                        Evidence::new(op, format!("no compatibility row for {}", s.value)),
                    ));
                };
                let expected = Some(Value::List(row.allowed.clone()));
                let other = ctx.state.live(lens);
                let Some(actual) = ctx.lens_value(lens) else {
                    let outcome = Outcome::new(false, Evidence::new(op, format!("{} has no value", lens)).with_values(expected, None));
                    return Ok(match row.allowed.first() {
                        Some(first) => outcome.hint(None, lens, create_op(first.clone()), "hold a compatible value"),
                        None => outcome,
                    });
                };
                let passed = actual.is_in(&row.allowed, self.config.epsilon);
                let detail = if passed {
                    format!("{} = {} is compatible with {}", lens, actual, s.value)
                } else {
                    format!("{} = {} is incompatible with {}", lens, actual, s.value)
                };
                let outcome = Outcome::new(passed, Evidence::new(op, detail).with_values(expected, Some(actual)))
                    .involving(other);
                Ok(match (other, row.allowed.first()) {
                    (Some(o), Some(first)) => outcome.hint(
                        Some(o.id),
                        lens,
                        ChangeOp::Set { value: first.clone() },
                        "switch to a compatible value",
                    ),
                    _ => outcome,
                })
            }
            Rule::Schema { schema } => {
                let s = require_subject(subject, op)?;
                // Lens::check already covers the lens's own schema
                let lens = ctx.lenses.get(&s.lens);
                let schema = schema.as_ref();
                if schema.is_none() && lens.is_none() {
                    return Ok(Outcome::new(true, Evidence::new(op, "no schema declared")));
                }
                let check = |value: &Value| -> Vec<String> {
                    let mut problems = lens.map(|l| l.check(value)).unwrap_or_default();
                    if let Some(schema) = schema {
                        problems.extend(schema.violations(value));
                    }
                    problems
                };
                let problems = check(&s.value);
                let passed = problems.is_empty();
                let detail = if passed {
                    "value satisfies the schema".to_string()
                } else {
                    problems.join("; ")
                };
                let outcome = Outcome::new(passed, Evidence::new(op, detail).with_values(None, Some(s.value.clone())));
                Ok(if check(&s.baseline.value).is_empty() {
                    outcome.hint(
                        Some(s.id),
                        &s.lens,
                        ChangeOp::Set {
                            value: s.baseline.value.clone(),
                        },
                        "return to the baseline value, which satisfies the schema",
                    )
                } else {
                    outcome
                })
            }
            Rule::DriftLte { max } => {
                let s = require_subject(subject, op)?;
                let d = drift::drift(s, ctx.scale(&s.lens));
                let passed = d <= max + self.config.epsilon;
                let detail = format!("drift {:.4} against limit {} ({} baseline)", d, max, s.baseline.mode);
                Ok(Outcome::new(
                    passed,
                    Evidence::new(op, detail)
                        .with_values(Some(Value::Number(*max)), Some(Value::Number(d)))
                        .with_metric("drift", d),
                )
                .hint(
                    Some(s.id),
                    &s.lens,
                    ChangeOp::Set {
                        value: s.baseline.value.clone(),
                    },
                    "return to the baseline value",
                )
                .hint(
                    Some(s.id),
                    &s.lens,
                    ChangeOp::Rebaseline {
                        mode: s.baseline.mode,
                        value: None,
                    },
                    "adopt the current value as the baseline",
                ))
            }
            Rule::WeightedDriftLte { max } => {
                let s = require_subject(subject, op)?;
                let d = drift::drift(s, ctx.scale(&s.lens));
                let weighted = d * s.weight;
                let passed = weighted <= max + self.config.epsilon;
                let detail = format!(
                    "weighted drift {:.4} (drift {:.4} x weight {}) against limit {} ({} baseline)",
                    weighted, d, s.weight, max, s.baseline.mode
                );
                let outcome = Outcome::new(
                    passed,
                    Evidence::new(op, detail)
                        .with_values(Some(Value::Number(*max)), Some(Value::Number(weighted)))
                        .with_metric("drift", d)
                        .with_metric("weight", s.weight)
                        .with_metric("weighted_drift", weighted),
                )
                .hint(
                    Some(s.id),
                    &s.lens,
                    ChangeOp::Set {
                        value: s.baseline.value.clone(),
                    },
                    "return to the baseline value",
                );
                Ok(if d > 0.0 {
                    outcome.hint(
                        Some(s.id),
                        &s.lens,
                        ChangeOp::Reweight {
                            weight: (max / d).clamp(0.0, 1.0),
                        },
                        "lower the claim's weight",
                    )
                } else {
                    outcome
                })
            }
        }
    }

    fn combine(&self, rule: &Rule, children: Vec<Outcome>) -> Outcome {
        let held = children.iter().filter(|c| c.passed).count();
        let total = children.len();
        let passed = match rule {
            Rule::And { .. } => held == total,
            Rule::Or { .. } => held > 0,
            _ => held == 1,
        };

        let mut outcome = Outcome::new(
            passed,
            Evidence::new(rule.operator(), format!("{}/{} sub-rules held", held, total)),
        );
        for child in children {
            outcome.absorb(&child);
            let keep_implied = match rule {
                Rule::And { .. } => true,
                _ => child.passed,
            };
            if keep_implied {
                outcome.implied.extend(child.implied);
            }
            if !passed {
                match rule {
                    Rule::And { .. } if !child.passed => outcome.hints.extend(child.hints),
                    Rule::Or { .. } => outcome.hints.extend(child.hints),
                    _ => {}
                }
            }
            outcome.evidence.children.push(child.evidence);
        }
        outcome
    }

    fn comparison(
        &self,
        rule: &Rule,
        left: &Operand,
        right: &Operand,
        subject: Option<&Claim>,
        ctx: &EvaluationContext<'_>,
    ) -> Result<Outcome, EvaluationError> {
        let op = rule.operator();
        let r = self.resolve(right, subject, ctx, op)?;
        let Some(l) = self.resolve(left, subject, ctx, op)? else {
            return Ok(self.missing(op, left, r, subject, ctx));
        };
        let Some(r) = r else {
            return Ok(self.missing(op, right, None, subject, ctx));
        };

        let eps = self.config.epsilon;
        let verdict = match rule {
            Rule::Eq { .. } => Some(l.loosely_eq(&r, eps)),
            Rule::Neq { .. } => Some(!l.loosely_eq(&r, eps)),
            _ => ordering(&l, &r, eps).map(|ord| match rule {
                Rule::Gt { .. } => ord == Ordering::Greater,
                Rule::Gte { .. } => ord != Ordering::Less,
                Rule::Lt { .. } => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }),
        };

        let mut evidence = Evidence::new(op, "").with_values(Some(r.clone()), Some(l.clone()));
        if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
            evidence = evidence.with_metric("difference", a - b);
        }
        let passed = match verdict {
            Some(passed) => {
                evidence.detail = format!(
                    "{} {} {} {}",
                    left.label(),
                    if passed { "satisfies" } else { "fails" },
                    op,
                    right.label()
                );
                passed
            }
            None => {
                evidence.detail = format!("{} and {} are not comparable", l.type_name(), r.type_name());
                false
            }
        };

        let outcome = Outcome::new(passed, evidence)
            .involving(self.operand_claim(left, subject, ctx))
            .involving(self.operand_claim(right, subject, ctx));
        let settable = matches!(rule, Rule::Eq { .. } | Rule::Gte { .. } | Rule::Lte { .. });
        Ok(match (subject, left, right) {
            (Some(s), Operand::Value, Operand::Literal { value }) | (Some(s), Operand::Literal { value }, Operand::Value)
                if settable =>
            {
                outcome.hint(
                    Some(s.id),
                    &s.lens,
                    ChangeOp::Set { value: value.clone() },
                    format!("set the value to {}", value),
                )
            }
            _ => outcome,
        })
    }

    fn exclusion(&self, left: &Clause, right: &Clause, ctx: &EvaluationContext<'_>) -> Outcome {
        let (left_holds, left_claim, left_value) = self.clause(left, ctx);
        let (right_holds, right_claim, right_value) = self.clause(right, ctx);
        let passed = !(left_holds && right_holds);
        let detail = if passed {
            format!("{} and {} do not both hold excluded values", left.lens, right.lens)
        } else {
            format!(
                "{} = {} excludes {} = {}",
                left.lens,
                left_value.clone().unwrap_or_default(),
                right.lens,
                right_value.clone().unwrap_or_default()
            )
        };
        let actual = Value::List(vec![left_value.unwrap_or_default(), right_value.unwrap_or_default()]);
        let mut outcome = Outcome::new(passed, Evidence::new("exclusion", detail).with_values(None, Some(actual)))
            .involving(left_claim)
            .involving(right_claim);

        for (clause, claim) in [(right, right_claim), (left, left_claim)] {
            let Some(claim) = claim else {
                continue;
            };
            outcome = if claim.baseline.value.is_in(&clause.values, self.config.epsilon) {
                outcome.hint(Some(claim.id), &clause.lens, ChangeOp::Delete, format!("withdraw {}", clause.lens))
            } else {
                outcome.hint(
                    Some(claim.id),
                    &clause.lens,
                    ChangeOp::Set {
                        value: claim.baseline.value.clone(),
                    },
                    format!("return {} to its baseline", clause.lens),
                )
            };
        }
        outcome
    }

    fn implies(&self, when: &Clause, then: &Clause, ctx: &EvaluationContext<'_>) -> Outcome {
        let (when_holds, when_claim, when_value) = self.clause(when, ctx);
        if !when_holds {
            return Outcome::new(
                true,
                Evidence::new("implies", format!("{} does not hold the antecedent", when.lens))
                    .with_values(None, when_value),
            );
        }

        let then_claim = ctx.state.live(&then.lens);
        let expected = Some(Value::List(then.values.clone()));
        let Some(then_value) = ctx.lens_value(&then.lens) else {
            let mut outcome = Outcome::new(
                true,
                Evidence::new(
                    "implies",
                    format!("{} is not held; recorded as an obligation", then.lens),
                )
                .with_values(expected, None),
            )
            .involving(when_claim);
            outcome
                .implied
                .push((then.lens.clone(), then.values.clone(), when_claim.map(|c| c.id)));
            return outcome;
        };

        let passed = then_value.is_in(&then.values, self.config.epsilon);
        let detail = if passed {
            format!("{} holds the implied value {}", then.lens, then_value)
        } else {
            format!("{} implies {} in the required set, found {}", when.lens, then.lens, then_value)
        };
        let outcome = Outcome::new(passed, Evidence::new("implies", detail).with_values(expected, Some(then_value)))
            .involving(when_claim)
            .involving(then_claim);
        match (then_claim, then.values.first()) {
            (Some(claim), Some(first)) => outcome.hint(
                Some(claim.id),
                &then.lens,
                ChangeOp::Set { value: first.clone() },
                format!("set {} to an implied value", then.lens),
            ),
            _ => outcome,
        }
    }

    fn clause<'s>(&self, clause: &Clause, ctx: &EvaluationContext<'s>) -> (bool, Option<&'s Claim>, Option<Value>) {
        let claim = ctx.state.live(&clause.lens);
        let value = ctx.lens_value(&clause.lens);
        let holds = value.as_ref().is_some_and(|v| v.is_in(&clause.values, self.config.epsilon));
        (holds, claim, value)
    }

    fn resolve(
        &self,
        operand: &Operand,
        subject: Option<&Claim>,
        ctx: &EvaluationContext<'_>,
        operator: &'static str,
    ) -> Result<Option<Value>, EvaluationError> {
        if let Operand::Literal { value } = operand {
            return Ok(Some(value.clone()));
        }
        if let Operand::Lens { key } = operand {
            return Ok(ctx.lens_value(key));
        }

        let s = require_subject(subject, operator)?;
        Ok(match operand {
            Operand::Value => Some(s.value.clone()),
            Operand::Previous => ctx
                .previous
                .and_then(|p| p.by_id(s.id))
                .filter(|c| c.is_live())
                .map(|c| c.value.clone()),
            Operand::Baseline => Some(s.baseline.value.clone()),
            Operand::Weight => Some(Value::Number(s.weight)),
            Operand::Field { path } => s.value.get_path(path).cloned(),
            Operand::Literal { .. } | Operand::Lens { .. } => None,
        })
    }

    fn operand_claim<'s>(
        &self,
        operand: &Operand,
        subject: Option<&'s Claim>,
        ctx: &EvaluationContext<'s>,
    ) -> Option<&'s Claim> {
        match operand {
            Operand::Lens { key } => ctx.state.live(key),
            Operand::Literal { .. } => None,
            _ => subject,
        }
    }

    fn missing(
        &self,
        operator: &'static str,
        operand: &Operand,
        expected: Option<Value>,
        subject: Option<&Claim>,
        ctx: &EvaluationContext<'_>,
    ) -> Outcome {
        Outcome::new(
            false,
            Evidence::new(operator, format!("operand {} is missing", operand.label())).with_values(expected, None),
        )
        .involving(self.operand_claim(operand, subject, ctx))
    }
}

impl Default for ConstraintEvaluator {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Mark failures overridden by a passing, higher-precedence constraint
///
/// Two results genuinely conflict when they judge the same subject and lens
/// with the same operator and disagree. The lower-precedence failure keeps
/// its result but records `shadowed_by`; nothing is dropped.
pub fn resolve_precedence(results: &mut [ConstraintResult]) {
    let winners: Vec<(usize, ConstraintResult)> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.passed && !r.skipped)
        .map(|(i, r)| (i, r.clone()))
        .collect();

    for (i, result) in results.iter_mut().enumerate() {
        if result.passed || result.skipped {
            continue;
        }
        let winner = winners
            .iter()
            .filter(|(j, w)| {
                *j != i
                    && w.subject == result.subject
                    && w.lens == result.lens
                    && w.step == result.step
                    && w.evidence.operator == result.evidence.operator
                    && w.scope.precedence() > result.scope.precedence()
            })
            .max_by_key(|(_, w)| w.scope.precedence());
        if let Some((_, w)) = winner {
            result.shadowed_by = Some(w.constraint_id);
        }
    }
}

/// Pairs of implied states from different constraints that cannot both hold
///
/// Two obligations on the same lens contradict when their value sets share
/// no member.
pub fn contradictions(results: &[ConstraintResult], epsilon: f64) -> Vec<(ImpliedState, ImpliedState)> {
    let implied: Vec<&ImpliedState> = results
        .iter()
        .filter(|r| r.passed && !r.skipped)
        .flat_map(|r| r.implied.iter())
        .collect();

    let mut pairs = Vec::new();
    for (i, a) in implied.iter().enumerate() {
        for b in &implied[i + 1..] {
            if a.lens != b.lens || a.constraint_id == b.constraint_id {
                continue;
            }
            let overlap = a.values.iter().any(|v| v.is_in(&b.values, epsilon));
            let seen = pairs.iter().any(|(x, y): &(ImpliedState, ImpliedState)| {
                x.constraint_id == a.constraint_id && y.constraint_id == b.constraint_id && x.lens == a.lens
            });
            if !overlap && !seen {
                pairs.push(((*a).clone(), (*b).clone()));
            }
        }
    }
    pairs
}

fn reads_any(constraint: &Constraint, changed: &[LensKey]) -> bool {
    let mut read = constraint.rule.referenced_lenses();
    if let Some(guard) = &constraint.guard {
        read.extend(guard.referenced_lenses());
    }
    read.iter().any(|lens| changed.contains(lens))
}

fn require_subject<'s>(subject: Option<&'s Claim>, operator: &'static str) -> Result<&'s Claim, EvaluationError> {
    subject.ok_or(EvaluationError::MissingSubject { operator })
}

fn ordering(a: &Value, b: &Value, epsilon: f64) -> Option<Ordering> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if (x - y).abs() <= epsilon => Some(Ordering::Equal),
        _ => a.compare(b),
    }
}

fn not_numeric(operator: &'static str, actual: &Value, expected: Option<Value>) -> Outcome {
    Outcome::new(
        false,
        Evidence::new(operator, format!("expected a number, found {}", actual.type_name()))
            .with_values(expected, Some(actual.clone())),
    )
}

fn create_op(value: Value) -> ChangeOp {
    ChangeOp::Create {
        value,
        weight: 0.5,
        baseline: None,
        constraints: Vec::new(),
    }
}
