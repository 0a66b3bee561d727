//! Evaluator error types

use thiserror::Error;

/// Errors raised while evaluating a single rule
///
/// These never escape the evaluator: they become failing (or skipped)
/// results with the message as evidence, depending on configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// A subject-bound operand or operator ran without a subject claim
    #[error("operator {operator} needs a subject claim")]
    MissingSubject {
        /// Operator that needed it
        operator: &'static str,
    },

    /// Rule nesting is deeper than the configured limit
    #[error("rule nesting exceeds {0} levels")]
    TooDeep(usize),

    /// The rule is malformed (e.g. an empty combinator)
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}
