//! Projection module - cached, derivable, read-only views

use crate::claim::BaselineMode;
use crate::lens::LensKey;
use crate::mutation::MutationStatus;
use crate::value::Value;
use crate::{ClaimId, MutationId, OrganismId, ProjectionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Projection flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionKind {
    /// Per-lens value, weight and drift grid
    Matrix,
    /// Mutation chain entries
    Timeline,
    /// Value against baseline per claim
    Diff,
    /// Coherence and counts
    Summary,
}

impl ProjectionKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionKind::Matrix => "matrix",
            ProjectionKind::Timeline => "timeline",
            ProjectionKind::Diff => "diff",
            ProjectionKind::Summary => "summary",
        }
    }

    /// Parse a kind name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "matrix" => Some(ProjectionKind::Matrix),
            "timeline" => Some(ProjectionKind::Timeline),
            "diff" => Some(ProjectionKind::Diff),
            "summary" => Some(ProjectionKind::Summary),
            _ => None,
        }
    }
}

impl fmt::Display for ProjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a matrix projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixRow {
    /// Lens
    pub lens: LensKey,
    /// Claim
    pub claim_id: ClaimId,
    /// Current value
    pub value: Value,
    /// Weight
    pub weight: f64,
    /// Drift from baseline
    pub drift: f64,
    /// Drift × weight
    pub weighted_drift: f64,
    /// Active conflicts involving the claim
    pub active_conflicts: usize,
}

/// One entry of a timeline projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// Mutation
    pub mutation_id: MutationId,
    /// Actor
    pub actor: String,
    /// Intent
    pub intent: Option<String>,
    /// Status
    pub status: MutationStatus,
    /// Commit time
    pub committed_at: Option<u64>,
    /// Lenses touched
    pub lenses: Vec<LensKey>,
    /// Number of tradeoffs recorded
    pub tradeoffs: usize,
}

/// One row of a baseline diff projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineDiffRow {
    /// Lens
    pub lens: LensKey,
    /// Current value
    pub value: Value,
    /// Baseline value
    pub baseline: Value,
    /// Baseline mode
    pub mode: BaselineMode,
    /// Drift
    pub drift: f64,
}

/// Summary projection body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryData {
    /// Coherence
    pub coherence: f64,
    /// Weighted mean drift
    pub total_drift: f64,
    /// Live claims
    pub claims: usize,
    /// Active conflicts
    pub active_conflicts: usize,
    /// Committed mutations in the chain
    pub mutations: usize,
}

/// Projection body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "lowercase")]
pub enum ProjectionData {
    /// Matrix rows
    Matrix(Vec<MatrixRow>),
    /// Timeline entries, oldest first
    Timeline(Vec<TimelineEntry>),
    /// Baseline diff rows
    Diff(Vec<BaselineDiffRow>),
    /// Summary
    Summary(SummaryData),
}

impl ProjectionData {
    /// Kind of the body
    pub fn kind(&self) -> ProjectionKind {
        match self {
            ProjectionData::Matrix(_) => ProjectionKind::Matrix,
            ProjectionData::Timeline(_) => ProjectionKind::Timeline,
            ProjectionData::Diff(_) => ProjectionKind::Diff,
            ProjectionData::Summary(_) => ProjectionKind::Summary,
        }
    }
}

/// A cached, versioned, read-only view
///
/// Projections have no write authority. `epoch` is the organism epoch the
/// view was built at; a reader comparing it with the current epoch can tell
/// whether the view is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    /// Unique identifier
    pub id: ProjectionId,
    /// Organism
    pub organism_id: OrganismId,
    /// Flavour
    pub kind: ProjectionKind,
    /// Monotonic version
    pub version: u64,
    /// Organism epoch at build time
    pub epoch: u64,
    /// Historical instant, when built from replay
    #[serde(default)]
    pub as_of: Option<u64>,
    /// Build time (ms)
    pub generated_at: u64,
    /// Whether the organism changed since build
    #[serde(default)]
    pub stale: bool,
    /// Body
    pub data: ProjectionData,
}
