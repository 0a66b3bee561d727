//! Organism module - the anchor entity that owns claims

use crate::OrganismId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An anchor entity
///
/// No primitives live on an organism; it exists so that claims have an owner.
/// Identity is immutable and organisms are never deleted, only archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organism {
    /// Unique identifier
    pub id: OrganismId,

    /// Category tag (e.g. "brand", "portfolio")
    pub organism_type: String,

    /// Human-readable name
    pub name: String,

    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Free-form key/value labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Soft archive marker
    #[serde(default)]
    pub archived: bool,

    /// Creation time (ms)
    pub created_at: u64,
}

impl Organism {
    /// Create a new organism
    pub fn new(name: impl Into<String>, organism_type: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: OrganismId::new(),
            organism_type: organism_type.into(),
            name: name.into(),
            tags: Vec::new(),
            labels: BTreeMap::new(),
            archived: false,
            created_at,
        }
    }

    /// Attach tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Attach a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}
