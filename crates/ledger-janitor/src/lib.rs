//! Claim Ledger Janitor
//!
//! Background maintenance for a [`ledger_engine::Ledger`].
//!
//! # Overview
//!
//! The Janitor is responsible for:
//! - **Proposal expiry**: marking proposals past their TTL as expired
//! - **Suppression expiry**: reactivating conflicts whose suppression lapsed
//! - **Re-evaluation**: optionally re-running conflict detection per organism
//! - **Re-scoring**: following `mutation_committed` events so conflict
//!   severity tracks claim weights
//! - **Metrics collection**: counting what each sweep and event did
//!
//! # Usage
//!
//! ## One-time Sweep
//!
//! ```no_run
//! use ledger_engine::{Ledger, LedgerConfig};
//! use ledger_janitor::Janitor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::in_memory(LedgerConfig::default());
//! let mut janitor = Janitor::default_config();
//!
//! let metrics = janitor.sweep(&ledger, ledger.now())?;
//! println!("{}", metrics.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [janitor]
//! sweep_interval_ms = 60000
//! rescore_on_commit = true
//! reevaluate_on_sweep = false
//! dry_run = false
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod janitor;
mod metrics;
mod worker;

pub use config::JanitorConfig;
pub use error::JanitorError;
pub use janitor::Janitor;
pub use metrics::JanitorMetrics;
pub use worker::JanitorWorker;
