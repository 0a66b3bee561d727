//! Tradeoff module - explicit record of what a change gave up

use crate::lens::LensKey;
use crate::ConstraintId;
use serde::{Deserialize, Serialize};

/// What was sacrificed and what was gained when a soft constraint was grazed
/// or a conflict was resolved
///
/// A tradeoff "covers" a lens when that lens appears in `lenses`. Commits
/// with soft failures need a covering tradeoff for every failing lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tradeoff {
    /// Lenses this tradeoff speaks for
    pub lenses: Vec<LensKey>,

    /// What is given up
    pub sacrificed: String,

    /// What is gained
    pub gained: String,

    /// Free-form rationale
    #[serde(default)]
    pub rationale: Option<String>,

    /// Constraint being traded against, if any
    #[serde(default)]
    pub constraint_id: Option<ConstraintId>,

    /// Who signed off
    #[serde(default)]
    pub approved_by: Option<String>,
}

impl Tradeoff {
    /// Create a tradeoff covering `lenses`
    pub fn new(lenses: Vec<LensKey>, sacrificed: impl Into<String>, gained: impl Into<String>) -> Self {
        Self {
            lenses,
            sacrificed: sacrificed.into(),
            gained: gained.into(),
            rationale: None,
            constraint_id: None,
            approved_by: None,
        }
    }

    /// Attach a rationale
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Name the constraint being traded against
    pub fn against(mut self, constraint_id: ConstraintId) -> Self {
        self.constraint_id = Some(constraint_id);
        self
    }

    /// Record the approver
    pub fn approved_by(mut self, actor: impl Into<String>) -> Self {
        self.approved_by = Some(actor.into());
        self
    }

    /// A tradeoff with no lenses, or nothing stated on either side, says nothing
    pub fn is_empty(&self) -> bool {
        self.lenses.is_empty() || (self.sacrificed.trim().is_empty() && self.gained.trim().is_empty())
    }

    /// Whether this tradeoff covers `lens`
    pub fn references(&self, lens: &LensKey) -> bool {
        !self.is_empty() && self.lenses.contains(lens)
    }
}
