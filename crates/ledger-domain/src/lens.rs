//! Lens module - typed schema keys that give claim values their meaning

use crate::value::{Value, ValueKind};
use crate::LensId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A dotted lens key: `cluster.path`
///
/// The first segment is the cluster, the rest is the path within it, so
/// `brand.discounting.strategy` lives in cluster `brand` at path
/// `discounting.strategy`. At least two segments are required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LensKey {
    cluster: String,
    path: String,
}

impl LensKey {
    /// Parse a dotted key
    ///
    /// # Errors
    /// Returns an error if the key has fewer than two segments or a segment
    /// is empty or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(key: &str) -> Result<Self, String> {
        let (cluster, path) = key
            .split_once('.')
            .ok_or_else(|| format!("Lens key '{}' must look like cluster.path", key))?;

        let valid_segment =
            |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

        if !valid_segment(cluster) || !path.split('.').all(valid_segment) {
            return Err(format!("Lens key '{}' has an invalid segment", key));
        }

        Ok(Self {
            cluster: cluster.to_string(),
            path: path.to_string(),
        })
    }

    /// Cluster (first segment)
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Path within the cluster
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for LensKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.path)
    }
}

impl FromStr for LensKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for LensKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LensKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Self::parse(&key).map_err(serde::de::Error::custom)
    }
}

/// Declarative validation schema for a lens's values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSchema {
    /// Required kind
    #[serde(default)]
    pub kind: Option<ValueKind>,

    /// Keys that must be present in structured values
    #[serde(default)]
    pub required_keys: Vec<String>,

    /// Inclusive numeric lower bound
    #[serde(default)]
    pub min: Option<f64>,

    /// Inclusive numeric upper bound
    #[serde(default)]
    pub max: Option<f64>,

    /// Maximum cardinality (text length, list length, key count)
    #[serde(default)]
    pub max_len: Option<usize>,

    /// Allowed values
    #[serde(default)]
    pub allowed: Vec<Value>,
}

impl ValueSchema {
    /// Validate a value, returning every violation found
    ///
    /// Null passes every check: presence is the job of `exists`/`requires`.
    pub fn violations(&self, value: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        if matches!(value, Value::Null) {
            return violations;
        }

        if let Some(kind) = self.kind {
            if !kind.accepts(value) {
                violations.push(format!("expected {} value, found {}", kind, value.type_name()));
            }
        }

        if let Value::Structured(map) = value {
            for key in &self.required_keys {
                if !map.contains_key(key) {
                    violations.push(format!("missing required key '{}'", key));
                }
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    violations.push(format!("{} is below minimum {}", n, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    violations.push(format!("{} is above maximum {}", n, max));
                }
            }
        }

        if let Some(max_len) = self.max_len {
            if value.cardinality() > max_len {
                violations.push(format!(
                    "cardinality {} exceeds maximum {}",
                    value.cardinality(),
                    max_len
                ));
            }
        }

        if !self.allowed.is_empty() && !self.allowed.contains(value) {
            violations.push(format!("{} is not an allowed value", value));
        }

        violations
    }
}

/// Formula over other lenses, used by computed lenses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum Formula {
    /// Σ inputs
    Sum {
        /// Input lenses
        inputs: Vec<LensKey>,
    },
    /// Arithmetic mean of inputs
    Mean {
        /// Input lenses
        inputs: Vec<LensKey>,
    },
    /// Minimum of inputs
    Min {
        /// Input lenses
        inputs: Vec<LensKey>,
    },
    /// Maximum of inputs
    Max {
        /// Input lenses
        inputs: Vec<LensKey>,
    },
    /// Π inputs
    Product {
        /// Input lenses
        inputs: Vec<LensKey>,
    },
    /// numerator / denominator
    Ratio {
        /// Numerator lens
        numerator: LensKey,
        /// Denominator lens
        denominator: LensKey,
    },
    /// Σ coefficient × input
    WeightedSum {
        /// (lens, coefficient) terms
        terms: Vec<(LensKey, f64)>,
    },
}

impl Formula {
    /// Every lens the formula reads
    pub fn inputs(&self) -> Vec<LensKey> {
        match self {
            Formula::Sum { inputs }
            | Formula::Mean { inputs }
            | Formula::Min { inputs }
            | Formula::Max { inputs }
            | Formula::Product { inputs } => inputs.clone(),
            Formula::Ratio { numerator, denominator } => vec![numerator.clone(), denominator.clone()],
            Formula::WeightedSum { terms } => terms.iter().map(|(k, _)| k.clone()).collect(),
        }
    }

    /// Evaluate with a numeric lookup; `None` when any input is missing or
    /// non-numeric, or when a ratio's denominator is zero
    pub fn evaluate<F>(&self, lookup: F) -> Option<f64>
    where
        F: Fn(&LensKey) -> Option<f64>,
    {
        let collect = |inputs: &[LensKey]| -> Option<Vec<f64>> { inputs.iter().map(&lookup).collect() };

        match self {
            Formula::Sum { inputs } => collect(inputs).map(|v| v.iter().sum()),
            Formula::Mean { inputs } => collect(inputs)
                .filter(|v| !v.is_empty())
                .map(|v| v.iter().sum::<f64>() / v.len() as f64),
            Formula::Min { inputs } => collect(inputs)?.into_iter().reduce(f64::min),
            Formula::Max { inputs } => collect(inputs)?.into_iter().reduce(f64::max),
            Formula::Product { inputs } => collect(inputs).map(|v| v.iter().product()),
            Formula::Ratio { numerator, denominator } => {
                let d = lookup(denominator)?;
                if d == 0.0 {
                    return None;
                }
                Some(lookup(numerator)? / d)
            }
            Formula::WeightedSum { terms } => terms
                .iter()
                .map(|(k, c)| lookup(k).map(|v| v * c))
                .sum::<Option<f64>>(),
        }
    }
}

/// Declared formula that makes a lens computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolver {
    /// The formula
    pub formula: Formula,

    /// Optional human description
    #[serde(default)]
    pub description: Option<String>,
}

/// A named, typed schema key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lens {
    /// Unique identifier (stable across versions)
    pub id: LensId,

    /// Dotted key
    pub key: LensKey,

    /// Kind of value
    pub kind: ValueKind,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Allowed variants for enumeration lenses
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Optional validation schema
    #[serde(default)]
    pub schema: Option<ValueSchema>,

    /// Optional resolver; makes the lens computed
    #[serde(default)]
    pub resolver: Option<Resolver>,

    /// Normalisation scale for numeric drift
    #[serde(default)]
    pub scale: Option<f64>,

    /// Lens version, bumped on re-registration
    #[serde(default = "first_version")]
    pub version: u32,
}

fn first_version() -> u32 {
    1
}

impl Lens {
    /// Create a new lens
    pub fn new(key: LensKey, kind: ValueKind) -> Self {
        Self {
            id: LensId::new(),
            key,
            kind,
            description: None,
            allowed: Vec::new(),
            schema: None,
            resolver: None,
            scale: None,
            version: 1,
        }
    }

    /// Declare enumeration variants
    pub fn with_allowed(mut self, allowed: Vec<String>) -> Self {
        self.allowed = allowed;
        self
    }

    /// Attach a validation schema
    pub fn with_schema(mut self, schema: ValueSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Make the lens computed
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the numeric drift scale
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Set a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this lens is computed from other lenses
    pub fn is_computed(&self) -> bool {
        self.resolver.is_some()
    }

    /// Numeric drift scale if one is declared and positive
    pub fn distance_scale(&self) -> Option<f64> {
        self.scale.filter(|s| *s > 0.0)
    }

    /// Check that a value fits the lens's kind, variants and schema
    pub fn check(&self, value: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.kind.accepts(value) {
            problems.push(format!(
                "lens {} expects {} values, found {}",
                self.key,
                self.kind,
                value.type_name()
            ));
            return problems;
        }
        if self.kind == ValueKind::Enumeration && !self.allowed.is_empty() {
            if let Value::Text(variant) = value {
                if !self.allowed.iter().any(|a| a == variant) {
                    problems.push(format!("'{}' is not a variant of {}", variant, self.key));
                }
            }
        }
        if let Some(schema) = &self.schema {
            problems.extend(schema.violations(value));
        }
        problems
    }
}
