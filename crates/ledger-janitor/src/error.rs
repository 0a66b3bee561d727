//! Error types for Janitor operations

use ledger_engine::LedgerError;
use thiserror::Error;

/// Errors that can occur during Janitor operations
#[derive(Error, Debug)]
pub enum JanitorError {
    /// Ledger operation failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker error (event stream or runtime issues)
    #[error("Worker error: {0}")]
    Worker(String),
}
