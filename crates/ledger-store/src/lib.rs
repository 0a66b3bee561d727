//! Claim Ledger Storage Layer
//!
//! Implements the store traits from `ledger_domain::traits` twice:
//!
//! - [`MemoryStore`]: process-local maps behind one `RwLock`
//! - [`SqliteStore`]: durable SQLite database behind one `Mutex<Connection>`
//!
//! Both give the same guarantees: a commit batch checks every claim version,
//! writes every claim, appends the mutation to the organism chain and advances
//! the chain head as one atomic step, or writes nothing.
//!
//! # Examples
//!
//! ```no_run
//! use ledger_store::SqliteStore;
//!
//! let store = SqliteStore::new("ledger.db").unwrap();
//! // Store is now ready to back a Ledger
//! ```

#![warn(missing_docs)]

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use ledger_domain::{Mutation, MutationStatus, StoreError};

/// Enforce log immutability on a mutation write
///
/// Pending records may change freely (except into `committed`, which only a
/// commit batch may do). Terminal records may only go committed -> rolled back.
pub(crate) fn check_mutation_update(existing: Option<&Mutation>, next: &Mutation) -> Result<(), StoreError> {
    let current = existing.map(|m| m.status);
    match (current, next.status) {
        (Some(MutationStatus::Committed), MutationStatus::RolledBack) => Ok(()),
        (Some(from), to) if !from.is_pending() && from != to => Err(StoreError::Immutable(format!(
            "mutation {} is {}, cannot become {}",
            next.id, from, to
        ))),
        (Some(from), _) if !from.is_pending() => Err(StoreError::Immutable(format!(
            "mutation {} is {} and cannot be rewritten",
            next.id, from
        ))),
        (_, MutationStatus::Committed) => Err(StoreError::Immutable(format!(
            "mutation {} can only be committed through a commit batch",
            next.id
        ))),
        _ => Ok(()),
    }
}

/// A commit batch may only carry a mutation that is still pending in the log
pub(crate) fn check_commit_target(existing: Option<&Mutation>, next: &Mutation) -> Result<(), StoreError> {
    match existing {
        Some(m) if !m.status.is_pending() => Err(StoreError::Immutable(format!(
            "mutation {} is already {}",
            next.id, m.status
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_domain::OrganismId;

    fn mutation(status: MutationStatus) -> Mutation {
        let mut m = Mutation::new(OrganismId::new(), "alice", None, vec![], 0);
        m.status = status;
        m
    }

    #[test]
    fn test_mutation_update_rules() {
        let proposed = mutation(MutationStatus::Proposed);
        let mut validated = proposed.clone();
        validated.status = MutationStatus::Validated;
        assert!(check_mutation_update(Some(&proposed), &validated).is_ok());
        assert!(check_mutation_update(None, &proposed).is_ok());

        let mut committed = proposed.clone();
        committed.status = MutationStatus::Committed;
        assert!(check_mutation_update(Some(&validated), &committed).is_err());

        let mut rolled_back = committed.clone();
        rolled_back.status = MutationStatus::RolledBack;
        assert!(check_mutation_update(Some(&committed), &rolled_back).is_ok());
        assert!(check_mutation_update(Some(&committed), &committed).is_err());

        let rejected = mutation(MutationStatus::Rejected);
        let mut revived = rejected.clone();
        revived.status = MutationStatus::Validated;
        assert!(check_mutation_update(Some(&rejected), &revived).is_err());
    }
}
