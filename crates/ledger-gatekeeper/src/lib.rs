//! Claim Ledger Gatekeeper
//!
//! Evaluates constraints against organism state.
//!
//! The gatekeeper provides:
//! - Applicability resolution (which constraints apply to which claims)
//! - Scope precedence (claim > organism > lens > cluster > global)
//! - Rule evaluation with machine-readable evidence
//! - Concrete repair hints for failures
//! - Implied-state extraction for derived conflicts
//!
//! It never writes: callers hand it a state (current or what-if) and get
//! [`ConstraintResult`](ledger_domain::ConstraintResult)s back.
//!
//! # Examples
//!
//! ```no_run
//! use ledger_gatekeeper::{ConstraintEvaluator, EvaluatorConfig};
//!
//! let evaluator = ConstraintEvaluator::new(EvaluatorConfig::default());
//!
//! // let results = evaluator.evaluate_organism(&constraints, &context);
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod evaluator;

pub use config::EvaluatorConfig;
pub use error::EvaluationError;
pub use evaluator::{contradictions, resolve_precedence, ConstraintEvaluator, EvaluationContext, Target};
