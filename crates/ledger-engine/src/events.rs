//! Ledger event stream
//!
//! Commits publish onto a broadcast channel. Subscribers (conflict
//! re-scoring, projection refresh, audit) consume asynchronously; publishing
//! never blocks and never fails the operation that emitted the event.

use ledger_domain::{ClaimId, ConflictId, ConflictSeverity, ConstraintId, MutationId, OrganismId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Something that happened in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Claims changed
    MutationCommitted {
        /// Organism
        organism_id: OrganismId,
        /// Mutation
        mutation_id: MutationId,
        /// Claims written
        claims: Vec<ClaimId>,
    },
    /// Commit refused
    MutationRejected {
        /// Organism
        organism_id: OrganismId,
        /// Mutation
        mutation_id: MutationId,
        /// Why
        reason: String,
    },
    /// A committed mutation was compensated
    MutationRolledBack {
        /// Organism
        organism_id: OrganismId,
        /// Mutation rolled back
        mutation_id: MutationId,
        /// Compensating mutation
        compensating_id: MutationId,
    },
    /// New conflict
    ConflictCreated {
        /// Organism
        organism_id: OrganismId,
        /// Conflict
        conflict_id: ConflictId,
        /// Severity at creation
        severity: ConflictSeverity,
    },
    /// Conflict re-scored
    ConflictUpdated {
        /// Organism
        organism_id: OrganismId,
        /// Conflict
        conflict_id: ConflictId,
        /// New severity
        severity: ConflictSeverity,
    },
    /// Conflict resolved
    ConflictResolved {
        /// Organism
        organism_id: OrganismId,
        /// Conflict
        conflict_id: ConflictId,
        /// Compensating mutation
        mutation_id: MutationId,
    },
    /// Conflict suppressed
    ConflictSuppressed {
        /// Organism
        organism_id: OrganismId,
        /// Conflict
        conflict_id: ConflictId,
    },
    /// Suppression lapsed or the trigger fired again
    ConflictReactivated {
        /// Organism
        organism_id: OrganismId,
        /// Conflict
        conflict_id: ConflictId,
    },
    /// A constraint with `emit_event` failed
    ConstraintFailed {
        /// Organism
        organism_id: OrganismId,
        /// Constraint
        constraint_id: ConstraintId,
        /// Subject claim
        subject: Option<ClaimId>,
        /// Mutation under validation
        mutation_id: MutationId,
    },
    /// Cached projections of an organism became stale
    ProjectionInvalidated {
        /// Organism
        organism_id: OrganismId,
        /// New epoch
        epoch: u64,
    },
}

impl LedgerEvent {
    /// Organism the event concerns
    pub fn organism_id(&self) -> OrganismId {
        match self {
            LedgerEvent::MutationCommitted { organism_id, .. }
            | LedgerEvent::MutationRejected { organism_id, .. }
            | LedgerEvent::MutationRolledBack { organism_id, .. }
            | LedgerEvent::ConflictCreated { organism_id, .. }
            | LedgerEvent::ConflictUpdated { organism_id, .. }
            | LedgerEvent::ConflictResolved { organism_id, .. }
            | LedgerEvent::ConflictSuppressed { organism_id, .. }
            | LedgerEvent::ConflictReactivated { organism_id, .. }
            | LedgerEvent::ConstraintFailed { organism_id, .. }
            | LedgerEvent::ProjectionInvalidated { organism_id, .. } => *organism_id,
        }
    }

    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::MutationCommitted { .. } => "mutation_committed",
            LedgerEvent::MutationRejected { .. } => "mutation_rejected",
            LedgerEvent::MutationRolledBack { .. } => "mutation_rolled_back",
            LedgerEvent::ConflictCreated { .. } => "conflict_created",
            LedgerEvent::ConflictUpdated { .. } => "conflict_updated",
            LedgerEvent::ConflictResolved { .. } => "conflict_resolved",
            LedgerEvent::ConflictSuppressed { .. } => "conflict_suppressed",
            LedgerEvent::ConflictReactivated { .. } => "conflict_reactivated",
            LedgerEvent::ConstraintFailed { .. } => "constraint_failed",
            LedgerEvent::ProjectionInvalidated { .. } => "projection_invalidated",
        }
    }
}

/// Broadcast bus for [`LedgerEvent`]s
pub struct EventBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every subscriber; dropped silently when nobody listens
    pub fn publish(&self, event: LedgerEvent) {
        trace!(event = event.name(), organism = %event.organism_id(), "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Create a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let organism_id = OrganismId::new();
        bus.publish(LedgerEvent::ProjectionInvalidated { organism_id, epoch: 1 });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.organism_id(), organism_id);
        assert_eq!(event.name(), "projection_invalidated");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(LedgerEvent::ProjectionInvalidated {
            organism_id: OrganismId::new(),
            epoch: 1,
        });
    }

    #[test]
    fn test_wire_shape() {
        let event = LedgerEvent::ConflictSuppressed {
            organism_id: OrganismId::new(),
            conflict_id: ConflictId::new(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conflict_suppressed");
    }
}
