//! Mutation module - the append-only, atomic change set
//!
//! A mutation is the only way claim state changes. It moves through a small
//! state machine:
//!
//! ```text
//! proposed -> validated -> committed -> rolled_back
//!     |           |
//!     +-----------+--> rejected | expired
//! ```
//!
//! Once committed or rejected a mutation is never edited; corrections are new
//! mutations that point back through `prev_mutation_id`.

use crate::claim::{Baseline, BaselineMode, ClaimSnapshot};
use crate::constraint::ConstraintResult;
use crate::error::TransitionError;
use crate::lens::LensKey;
use crate::tradeoff::Tradeoff;
use crate::value::Value;
use crate::{ClaimId, ConstraintId, MutationId, OrganismId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors produced when applying a single change op
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChangeError {
    /// Op targets a claim that does not exist
    #[error("Claim does not exist")]
    ClaimMissing,

    /// `create` targets a claim that already exists
    #[error("Claim already exists")]
    AlreadyExists,

    /// Op targets a soft-deleted claim
    #[error("Claim is deleted")]
    Deleted,

    /// Weight outside [0, 1]
    #[error("Weight {0} is outside [0, 1]")]
    InvalidWeight(f64),

    /// `merge` on a value that is not structured
    #[error("Cannot merge into a {0} value")]
    NotStructured(&'static str),
}

/// Baseline declared alongside a `create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineDraft {
    /// Frame kind
    pub mode: BaselineMode,

    /// Reference value; defaults to the created value
    #[serde(default)]
    pub value: Option<Value>,
}

fn default_weight() -> f64 {
    0.5
}

/// A single claim operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Bring a claim into existence
    Create {
        /// Initial value
        value: Value,
        /// Initial weight
        #[serde(default = "default_weight")]
        weight: f64,
        /// Initial baseline (snapshot of the value when absent)
        #[serde(default)]
        baseline: Option<BaselineDraft>,
        /// Constraints to attach
        #[serde(default)]
        constraints: Vec<ConstraintId>,
    },
    /// Replace the value
    Set {
        /// New value
        value: Value,
    },
    /// Shallow-merge keys into a structured value; a null deletes the key
    Merge {
        /// Keys to merge
        value: BTreeMap<String, Value>,
    },
    /// Soft-delete the claim
    Delete,
    /// Change the weight
    Reweight {
        /// New weight in [0, 1]
        weight: f64,
    },
    /// Replace the baseline
    Rebaseline {
        /// New frame kind
        mode: BaselineMode,
        /// Reference value; the claim's current value when absent
        #[serde(default)]
        value: Option<Value>,
    },
    /// Attach and detach constraints
    Constrain {
        /// Constraint ids to attach
        #[serde(default)]
        attach: Vec<ConstraintId>,
        /// Constraint ids to detach
        #[serde(default)]
        detach: Vec<ConstraintId>,
    },
    /// Reinstate a recorded snapshot (compensating mutations only)
    Restore {
        /// Snapshot to reinstate
        snapshot: ClaimSnapshot,
    },
}

fn check_weight(weight: f64) -> Result<f64, ChangeError> {
    if weight.is_finite() && (0.0..=1.0).contains(&weight) {
        Ok(weight)
    } else {
        Err(ChangeError::InvalidWeight(weight))
    }
}

impl ChangeOp {
    /// Op name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ChangeOp::Create { .. } => "create",
            ChangeOp::Set { .. } => "set",
            ChangeOp::Merge { .. } => "merge",
            ChangeOp::Delete => "delete",
            ChangeOp::Reweight { .. } => "reweight",
            ChangeOp::Rebaseline { .. } => "rebaseline",
            ChangeOp::Constrain { .. } => "constrain",
            ChangeOp::Restore { .. } => "restore",
        }
    }

    /// Whether the op can change the claim's value or weight
    pub fn touches_value_or_weight(&self) -> bool {
        !matches!(self, ChangeOp::Rebaseline { .. } | ChangeOp::Constrain { .. })
    }

    /// Apply the op to the current snapshot (or to nothing, for `create`)
    ///
    /// This is the single transition function used by validation, commit,
    /// simulation and replay.
    pub fn apply(&self, current: Option<&ClaimSnapshot>, now: u64) -> Result<ClaimSnapshot, ChangeError> {
        if let ChangeOp::Create {
            value,
            weight,
            baseline,
            constraints,
        } = self
        {
            if current.is_some() {
                return Err(ChangeError::AlreadyExists);
            }
            let (mode, reference) = match baseline {
                Some(draft) => (draft.mode, draft.value.clone().unwrap_or_else(|| value.clone())),
                None => (BaselineMode::Snapshot, value.clone()),
            };
            let mut attached = Vec::new();
            for id in constraints {
                if !attached.contains(id) {
                    attached.push(*id);
                }
            }
            return Ok(ClaimSnapshot {
                value: value.clone(),
                weight: check_weight(*weight)?,
                baseline: Baseline::new(mode, reference, now),
                constraints: attached,
                deleted: false,
            });
        }

        let current = current.ok_or(ChangeError::ClaimMissing)?;
        if current.deleted && !matches!(self, ChangeOp::Restore { .. }) {
            return Err(ChangeError::Deleted);
        }

        let mut next = current.clone();
        match self {
            ChangeOp::Create { .. } => return Err(ChangeError::AlreadyExists),
            ChangeOp::Set { value } => next.value = value.clone(),
            ChangeOp::Merge { value } => {
                let mut map = match &current.value {
                    Value::Structured(m) => m.clone(),
                    Value::Null => BTreeMap::new(),
                    other => return Err(ChangeError::NotStructured(other.type_name())),
                };
                for (key, v) in value {
                    if matches!(v, Value::Null) {
                        map.remove(key);
                    } else {
                        map.insert(key.clone(), v.clone());
                    }
                }
                next.value = Value::Structured(map);
            }
            ChangeOp::Delete => next.deleted = true,
            ChangeOp::Reweight { weight } => next.weight = check_weight(*weight)?,
            ChangeOp::Rebaseline { mode, value } => {
                let reference = value.clone().unwrap_or_else(|| current.value.clone());
                next.baseline = Baseline::new(*mode, reference, now);
            }
            ChangeOp::Constrain { attach, detach } => {
                next.constraints.retain(|id| !detach.contains(id));
                for id in attach {
                    if !next.constraints.contains(id) {
                        next.constraints.push(*id);
                    }
                }
            }
            ChangeOp::Restore { snapshot } => next = snapshot.clone(),
        }
        Ok(next)
    }
}

/// A caller's description of one change, before its target is resolved
///
/// Either `claim_id` or `lens` must be given. `create` needs `lens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    /// Target claim
    #[serde(default)]
    pub claim_id: Option<ClaimId>,

    /// Target lens (looked up on the organism)
    #[serde(default)]
    pub lens: Option<LensKey>,

    /// Operation
    #[serde(flatten)]
    pub op: ChangeOp,
}

impl ChangeRequest {
    /// Change addressed by lens
    pub fn on_lens(lens: LensKey, op: ChangeOp) -> Self {
        Self {
            claim_id: None,
            lens: Some(lens),
            op,
        }
    }

    /// Change addressed by claim id
    pub fn on_claim(claim_id: ClaimId, op: ChangeOp) -> Self {
        Self {
            claim_id: Some(claim_id),
            lens: None,
            op,
        }
    }
}

/// A resolved change inside a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Target claim
    pub claim_id: ClaimId,

    /// Target lens
    pub lens: LensKey,

    /// Operation
    pub op: ChangeOp,

    /// Claim version observed at proposal; `None` for a claim being created
    pub expected_version: Option<u64>,

    /// State before this change
    #[serde(default)]
    pub before: Option<ClaimSnapshot>,

    /// State after this change
    #[serde(default)]
    pub after: Option<ClaimSnapshot>,
}

/// Mutation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Constructed, not validated
    Proposed,
    /// Validated at least once (non-dry-run)
    Validated,
    /// Applied to claim state
    Committed,
    /// Refused; terminal
    Rejected,
    /// Compensated by a later mutation
    RolledBack,
    /// Proposal outlived its TTL; terminal
    Expired,
}

impl MutationStatus {
    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Proposed => "proposed",
            MutationStatus::Validated => "validated",
            MutationStatus::Committed => "committed",
            MutationStatus::Rejected => "rejected",
            MutationStatus::RolledBack => "rolled_back",
            MutationStatus::Expired => "expired",
        }
    }

    /// Parse a status name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(MutationStatus::Proposed),
            "validated" => Some(MutationStatus::Validated),
            "committed" => Some(MutationStatus::Committed),
            "rejected" => Some(MutationStatus::Rejected),
            "rolled_back" => Some(MutationStatus::RolledBack),
            "expired" => Some(MutationStatus::Expired),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Proposed, Validated | Rejected | Expired)
                | (Validated, Validated | Committed | Rejected | Expired)
                | (Committed, RolledBack)
        )
    }

    /// Still open for validation and commit
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationStatus::Proposed | MutationStatus::Validated)
    }

    /// Whether the mutation's changes are part of claim history
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationStatus::Committed | MutationStatus::RolledBack)
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic, append-only change set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Unique identifier
    pub id: MutationId,

    /// Organism whose chain this mutation joins
    pub organism_id: OrganismId,

    /// Who proposed it
    pub actor: String,

    /// Optional intent
    #[serde(default)]
    pub intent: Option<String>,

    /// Ordered changes
    pub changes: Vec<Change>,

    /// Tradeoffs supplied at commit
    #[serde(default)]
    pub tradeoffs: Vec<Tradeoff>,

    /// Results of the latest validation
    #[serde(default)]
    pub constraint_results: Vec<ConstraintResult>,

    /// Previous committed mutation in this organism's chain
    #[serde(default)]
    pub prev_mutation_id: Option<MutationId>,

    /// Lifecycle state
    pub status: MutationStatus,

    /// Creation time (ms)
    pub created_at: u64,

    /// Last status change (ms)
    pub updated_at: u64,

    /// Commit time (ms)
    #[serde(default)]
    pub committed_at: Option<u64>,

    /// Proposal expiry (ms)
    #[serde(default)]
    pub expires_at: Option<u64>,

    /// Reason for the latest status change
    #[serde(default)]
    pub status_reason: Option<String>,

    /// Mutation this one compensates
    #[serde(default)]
    pub compensates: Option<MutationId>,

    /// Mutation that compensated this one
    #[serde(default)]
    pub compensated_by: Option<MutationId>,

    /// Commit comment
    #[serde(default)]
    pub comment: Option<String>,
}

impl Mutation {
    /// Create a proposed mutation
    pub fn new(
        organism_id: OrganismId,
        actor: impl Into<String>,
        intent: Option<String>,
        changes: Vec<Change>,
        now: u64,
    ) -> Self {
        Self {
            id: MutationId::new(),
            organism_id,
            actor: actor.into(),
            intent,
            changes,
            tradeoffs: Vec::new(),
            constraint_results: Vec::new(),
            prev_mutation_id: None,
            status: MutationStatus::Proposed,
            created_at: now,
            updated_at: now,
            committed_at: None,
            expires_at: None,
            status_reason: None,
            compensates: None,
            compensated_by: None,
            comment: None,
        }
    }

    /// Set the proposal expiry
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.expires_at = Some(self.created_at.saturating_add(ttl_ms));
        self
    }

    /// Move to `next`, recording the reason
    pub fn transition(
        &mut self,
        next: MutationStatus,
        reason: Option<String>,
        now: u64,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "mutation",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if reason.is_some() {
            self.status_reason = reason;
        }
        if next == MutationStatus::Committed {
            self.committed_at = Some(now);
        }
        Ok(())
    }

    /// Distinct claims touched, in first-touch order
    pub fn touched_claims(&self) -> Vec<ClaimId> {
        let mut ids = Vec::new();
        for change in &self.changes {
            if !ids.contains(&change.claim_id) {
                ids.push(change.claim_id);
            }
        }
        ids
    }

    /// Whether any change targets `claim_id`
    pub fn touches(&self, claim_id: ClaimId) -> bool {
        self.changes.iter().any(|c| c.claim_id == claim_id)
    }

    /// Distinct lenses touched
    pub fn touched_lenses(&self) -> Vec<LensKey> {
        let mut lenses = Vec::new();
        for change in &self.changes {
            if !lenses.contains(&change.lens) {
                lenses.push(change.lens.clone());
            }
        }
        lenses
    }

    /// Whether the proposal has outlived its TTL
    pub fn is_expired(&self, now: u64) -> bool {
        self.status.is_pending() && self.expires_at.is_some_and(|t| now >= t)
    }

    /// Whether this is a compensating mutation
    pub fn is_compensating(&self) -> bool {
        self.compensates.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(value: Value) -> ClaimSnapshot {
        ClaimSnapshot {
            value: value.clone(),
            weight: 0.5,
            baseline: Baseline::new(BaselineMode::Snapshot, value, 0),
            constraints: vec![],
            deleted: false,
        }
    }

    #[test]
    fn test_create_requires_absence() {
        let op = ChangeOp::Create {
            value: Value::from("luxury"),
            weight: 0.83,
            baseline: Some(BaselineDraft {
                mode: BaselineMode::Declared,
                value: None,
            }),
            constraints: vec![],
        };
        let created = op.apply(None, 5).unwrap();
        assert_eq!(created.weight, 0.83);
        assert_eq!(created.baseline.mode, BaselineMode::Declared);
        assert_eq!(created.baseline.value, Value::from("luxury"));

        assert_eq!(op.apply(Some(&created), 6), Err(ChangeError::AlreadyExists));
    }

    #[test]
    fn test_ops_require_existing_claim() {
        let op = ChangeOp::Set { value: Value::from(1.0) };
        assert_eq!(op.apply(None, 0), Err(ChangeError::ClaimMissing));
    }

    #[test]
    fn test_merge() {
        let mut base = BTreeMap::new();
        base.insert("tier".to_string(), Value::from("gold"));
        base.insert("seats".to_string(), Value::from(4.0));
        let current = snapshot(Value::Structured(base));

        let mut patch = BTreeMap::new();
        patch.insert("tier".to_string(), Value::from("silver"));
        patch.insert("seats".to_string(), Value::Null);
        let next = ChangeOp::Merge { value: patch }.apply(Some(&current), 1).unwrap();

        let map = next.value.as_map().unwrap();
        assert_eq!(map.get("tier"), Some(&Value::from("silver")));
        assert!(!map.contains_key("seats"));

        let scalar = snapshot(Value::from(3.0));
        let err = ChangeOp::Merge { value: BTreeMap::new() }.apply(Some(&scalar), 1);
        assert_eq!(err, Err(ChangeError::NotStructured("number")));
    }

    #[test]
    fn test_reweight_bounds() {
        let current = snapshot(Value::from(1.0));
        assert!(ChangeOp::Reweight { weight: 1.0 }.apply(Some(&current), 0).is_ok());
        assert_eq!(
            ChangeOp::Reweight { weight: 1.5 }.apply(Some(&current), 0),
            Err(ChangeError::InvalidWeight(1.5))
        );
        assert!(ChangeOp::Reweight { weight: f64::NAN }.apply(Some(&current), 0).is_err());
    }

    #[test]
    fn test_delete_then_only_restore() {
        let current = snapshot(Value::from(1.0));
        let deleted = ChangeOp::Delete.apply(Some(&current), 0).unwrap();
        assert!(deleted.deleted);

        let set = ChangeOp::Set { value: Value::from(2.0) };
        assert_eq!(set.apply(Some(&deleted), 0), Err(ChangeError::Deleted));

        let restored = ChangeOp::Restore {
            snapshot: current.clone(),
        }
        .apply(Some(&deleted), 0)
        .unwrap();
        assert_eq!(restored, current);
    }

    #[test]
    fn test_rebaseline_captures_current_value() {
        let mut current = snapshot(Value::from(10.0));
        current.value = Value::from(14.0);
        let next = ChangeOp::Rebaseline {
            mode: BaselineMode::Declared,
            value: None,
        }
        .apply(Some(&current), 99)
        .unwrap();
        assert_eq!(next.baseline.value, Value::from(14.0));
        assert_eq!(next.baseline.captured_at, 99);
    }

    #[test]
    fn test_change_request_wire_shape() {
        let json = r#"{"lens": "brand.positioning", "op": "set", "value": "luxury"}"#;
        let request: ChangeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.lens, Some(LensKey::parse("brand.positioning").unwrap()));
        assert_eq!(
            request.op,
            ChangeOp::Set {
                value: Value::from("luxury")
            }
        );
    }

    #[test]
    fn test_status_transitions() {
        use MutationStatus::*;
        assert!(Proposed.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Committed));
        assert!(Committed.can_transition_to(RolledBack));
        assert!(!Proposed.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Validated));
        assert!(!RolledBack.can_transition_to(Committed));
    }

    #[test]
    fn test_transition_records_commit_time() {
        let mut mutation = Mutation::new(OrganismId::new(), "alice", None, vec![], 10).with_ttl(100);
        assert_eq!(mutation.expires_at, Some(110));
        assert!(mutation.is_expired(110));

        mutation.transition(MutationStatus::Validated, None, 20).unwrap();
        mutation.transition(MutationStatus::Committed, None, 30).unwrap();
        assert_eq!(mutation.committed_at, Some(30));
        assert!(!mutation.is_expired(500));

        let err = mutation.transition(MutationStatus::Proposed, None, 40).unwrap_err();
        assert_eq!(err.from, "committed");
    }
}
