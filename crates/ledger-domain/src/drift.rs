//! Drift and coherence - computed at read time, never stored
//!
//! ```text
//! drift(claim)         = distance(claim.value, claim.baseline.value)
//! weightedDrift(claim) = drift × weight
//! totalDrift           = Σ(drift_i × weight_i) / Σ(weight_i)
//! conflictBurden       = Σ(score_c × meanWeight_c) over active conflicts
//! constraintBurden     = Σ(penalty × weight) over failing constraints
//! coherence            = clamp(1 − (0.4·conflict + 0.3·constraint + 0.3·drift), 0, 1)
//! ```
//!
//! ## Distance
//!
//! - Numbers: `|a − b| / scale`, clamped to [0, 1]. The scale is the lens's
//!   declared scale, else `|baseline|` when non-zero, else 1.
//! - Text, enumeration, boolean: 0 when equal, 1 otherwise.
//! - Structured: mean per-key distance over the union of keys. A key present
//!   on one side only scores 1. Nested numbers use `max(|a|, |b|, 1)` as scale.
//! - Lists: positional comparison over the longer length; a missing position
//!   scores 1.
//! - Mismatched shapes score 1; null against null scores 0.

use crate::claim::Claim;
use crate::conflict::Conflict;
use crate::value::{Value, DEFAULT_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Relative weights of the three burdens in the coherence formula
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoherenceWeights {
    /// Weight of conflict burden
    pub conflict: f64,
    /// Weight of constraint burden
    pub constraint: f64,
    /// Weight of total drift
    pub drift: f64,
}

impl Default for CoherenceWeights {
    fn default() -> Self {
        Self {
            conflict: 0.4,
            constraint: 0.3,
            drift: 0.3,
        }
    }
}

/// Everything coherence was computed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoherenceBreakdown {
    /// Final score in [0, 1]
    pub coherence: f64,
    /// Σ(score × mean weight) over active conflicts
    pub conflict_burden: f64,
    /// Σ(penalty × weight) over failing constraints; `None` when infinite
    pub constraint_burden: Option<f64>,
    /// Weighted mean drift
    pub total_drift: f64,
    /// Weights used
    pub weights: CoherenceWeights,
}

/// Type-dispatched distance between a value and its reference
///
/// `scale` is the numeric normalisation for top-level numbers.
pub fn distance(value: &Value, reference: &Value, scale: Option<f64>) -> f64 {
    match (value, reference) {
        (Value::Null, Value::Null) => 0.0,
        (Value::Number(a), Value::Number(b)) => {
            let scale = scale
                .filter(|s| *s > 0.0 && s.is_finite())
                .unwrap_or_else(|| if b.abs() > DEFAULT_EPSILON { b.abs() } else { 1.0 });
            ((a - b).abs() / scale).clamp(0.0, 1.0)
        }
        (Value::Text(a), Value::Text(b)) => mismatch(a == b),
        (Value::Boolean(a), Value::Boolean(b)) => mismatch(a == b),
        (Value::Structured(a), Value::Structured(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            if keys.is_empty() {
                return 0.0;
            }
            let total: f64 = keys
                .iter()
                .map(|k| match (a.get(*k), b.get(*k)) {
                    (Some(x), Some(y)) => nested_distance(x, y),
                    _ => 1.0,
                })
                .sum();
            total / keys.len() as f64
        }
        (Value::List(a), Value::List(b)) => {
            let len = a.len().max(b.len());
            if len == 0 {
                return 0.0;
            }
            let total: f64 = (0..len)
                .map(|i| match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => nested_distance(x, y),
                    _ => 1.0,
                })
                .sum();
            total / len as f64
        }
        _ => 1.0,
    }
}

fn nested_distance(a: &Value, b: &Value) -> f64 {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => distance(a, b, Some(x.abs().max(y.abs()).max(1.0))),
        _ => distance(a, b, None),
    }
}

fn mismatch(equal: bool) -> f64 {
    if equal {
        0.0
    } else {
        1.0
    }
}

/// Drift of a claim from its baseline
pub fn drift(claim: &Claim, scale: Option<f64>) -> f64 {
    distance(&claim.value, &claim.baseline.value, scale)
}

/// Drift × weight
pub fn weighted_drift(claim: &Claim, scale: Option<f64>) -> f64 {
    drift(claim, scale) * claim.weight
}

/// Weighted mean of `(drift, weight)` pairs; zero when total weight is zero
pub fn total_drift<I>(rows: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let (num, den) = rows
        .into_iter()
        .fold((0.0, 0.0), |(num, den), (d, w)| (num + d * w, den + w));
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Σ(score × mean weight) over active conflicts
pub fn conflict_burden<'a, I>(conflicts: I) -> f64
where
    I: IntoIterator<Item = &'a Conflict>,
{
    conflicts
        .into_iter()
        .filter(|c| c.is_active())
        .map(Conflict::burden)
        .sum()
}

/// Σ(penalty × weight) over `(penalty, weight)` pairs of failing constraints
///
/// Any infinite penalty (a hard failure present in stored state) makes the
/// burden infinite regardless of weight.
pub fn constraint_burden<I>(failures: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut burden = 0.0;
    for (penalty, weight) in failures {
        if penalty.is_infinite() {
            return f64::INFINITY;
        }
        burden += penalty * weight;
    }
    burden
}

/// Combine burdens into a coherence score
pub fn coherence(
    conflict_burden: f64,
    constraint_burden: f64,
    total_drift: f64,
    weights: CoherenceWeights,
) -> CoherenceBreakdown {
    let penalty = weights.conflict * conflict_burden
        + weights.constraint * constraint_burden
        + weights.drift * total_drift;
    let coherence = if penalty.is_nan() || penalty.is_infinite() {
        0.0
    } else {
        (1.0 - penalty).clamp(0.0, 1.0)
    };
    CoherenceBreakdown {
        coherence,
        conflict_burden,
        constraint_burden: constraint_burden.is_finite().then_some(constraint_burden),
        total_drift,
        weights,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Baseline, BaselineMode, ClaimSnapshot};
    use crate::lens::LensKey;
    use crate::{ClaimId, MutationId, OrganismId};
    use std::collections::BTreeMap;

    fn claim(value: Value, baseline: Value, weight: f64) -> Claim {
        Claim::from_snapshot(
            ClaimId::new(),
            OrganismId::new(),
            LensKey::parse("pricing.floor").unwrap(),
            ClaimSnapshot {
                value,
                weight,
                baseline: Baseline::new(BaselineMode::Declared, baseline, 0),
                constraints: vec![],
                deleted: false,
            },
            MutationId::new(),
            0,
        )
    }

    #[test]
    fn test_numeric_drift_scenario() {
        let c = claim(Value::from(14.0), Value::from(10.0), 0.5);
        assert!((drift(&c, Some(10.0)) - 0.4).abs() < 1e-9);
        assert!((weighted_drift(&c, Some(10.0)) - 0.2).abs() < 1e-9);
        // Without a declared scale the baseline magnitude is used
        assert!((drift(&c, None) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_numeric_drift_clamped() {
        assert_eq!(distance(&Value::from(100.0), &Value::from(1.0), None), 1.0);
        assert_eq!(distance(&Value::from(0.5), &Value::from(0.0), None), 0.5);
    }

    #[test]
    fn test_categorical_distance() {
        assert_eq!(distance(&Value::from("a"), &Value::from("a"), None), 0.0);
        assert_eq!(distance(&Value::from("a"), &Value::from("b"), None), 1.0);
        assert_eq!(distance(&Value::from(true), &Value::from(false), None), 1.0);
        assert_eq!(distance(&Value::from(1.0), &Value::from("1"), None), 1.0);
        assert_eq!(distance(&Value::Null, &Value::Null, None), 0.0);
    }

    #[test]
    fn test_structured_distance() {
        let mut a = BTreeMap::new();
        a.insert("tier".to_string(), Value::from("gold"));
        a.insert("seats".to_string(), Value::from(4.0));
        let mut b = BTreeMap::new();
        b.insert("tier".to_string(), Value::from("gold"));
        b.insert("seats".to_string(), Value::from(2.0));
        b.insert("extra".to_string(), Value::from(true));

        // tier: 0, seats: |4-2|/4 = 0.5, extra: missing = 1 → 1.5 / 3
        let d = distance(&Value::Structured(a), &Value::Structured(b), None);
        assert!((d - 0.5).abs() < 1e-9);
        assert_eq!(
            distance(&Value::Structured(BTreeMap::new()), &Value::Structured(BTreeMap::new()), None),
            0.0
        );
    }

    #[test]
    fn test_list_distance() {
        let a = Value::List(vec![Value::from("x"), Value::from("y")]);
        let b = Value::List(vec![Value::from("x")]);
        assert!((distance(&a, &b, None) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_total_drift_weighted_mean() {
        assert!((total_drift(vec![(0.4, 0.5), (0.0, 0.5)]) - 0.2).abs() < 1e-9);
        assert_eq!(total_drift(vec![(0.4, 0.0)]), 0.0);
        assert_eq!(total_drift(Vec::new()), 0.0);
    }

    #[test]
    fn test_coherence() {
        let weights = CoherenceWeights::default();
        let perfect = coherence(0.0, 0.0, 0.0, weights);
        assert_eq!(perfect.coherence, 1.0);

        let some = coherence(0.5, 0.2, 0.2, weights);
        assert!((some.coherence - (1.0 - (0.2 + 0.06 + 0.06))).abs() < 1e-9);

        let blocked = coherence(0.0, constraint_burden(vec![(f64::INFINITY, 0.0)]), 0.0, weights);
        assert_eq!(blocked.coherence, 0.0);
        assert_eq!(blocked.constraint_burden, None);

        let floor = coherence(5.0, 0.0, 0.0, weights);
        assert_eq!(floor.coherence, 0.0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            (-1.0e6f64..1.0e6).prop_map(Value::Number),
            "[a-z]{0,6}".prop_map(Value::Text),
        ]
    }

    proptest! {
        /// Property: distance is deterministic across repeated calls
        #[test]
        fn test_distance_deterministic(a in scalar(), b in scalar()) {
            let first = distance(&a, &b, None);
            let second = distance(&a, &b, None);
            prop_assert_eq!(first.to_bits(), second.to_bits());
        }

        /// Property: distance stays in [0, 1]
        #[test]
        fn test_distance_bounded(a in scalar(), b in scalar(), scale in proptest::option::of(0.001f64..1000.0)) {
            let d = distance(&a, &b, scale);
            prop_assert!((0.0..=1.0).contains(&d));
        }

        /// Property: a value never drifts from itself
        #[test]
        fn test_distance_identity(a in scalar()) {
            prop_assert_eq!(distance(&a, &a, None), 0.0);
        }
    }
}
