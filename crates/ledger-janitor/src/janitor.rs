//! Core Janitor implementation for ledger maintenance

use crate::{JanitorConfig, JanitorError, JanitorMetrics};
use ledger_domain::traits::ConflictFilter;
use ledger_domain::{ConflictStatus, MutationStatus};
use ledger_engine::{Ledger, LedgerEvent};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Janitor service for time-driven and event-driven ledger upkeep
///
/// Responsible for:
/// - Expiring proposals past their TTL
/// - Reactivating conflicts whose suppression has lapsed
/// - Optionally re-running conflict detection for every organism
/// - Re-scoring active conflicts after commits
///
/// # Examples
///
/// ```no_run
/// use ledger_engine::{Ledger, LedgerConfig};
/// use ledger_janitor::Janitor;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = Ledger::in_memory(LedgerConfig::default());
/// let mut janitor = Janitor::default_config();
///
/// let metrics = janitor.sweep(&ledger, ledger.now())?;
/// println!("{}", metrics.summary());
/// # Ok(())
/// # }
/// ```
pub struct Janitor {
    config: JanitorConfig,
    metrics: JanitorMetrics,
}

impl Janitor {
    /// Create a new Janitor with the given configuration
    pub fn new(config: JanitorConfig) -> Self {
        Self {
            config,
            metrics: JanitorMetrics::new(),
        }
    }

    /// Create a Janitor with default configuration
    pub fn default_config() -> Self {
        Self::new(JanitorConfig::default())
    }

    /// Active configuration
    pub fn config(&self) -> &JanitorConfig {
        &self.config
    }

    /// Get a reference to the current metrics
    pub fn metrics(&self) -> &JanitorMetrics {
        &self.metrics
    }

    /// Reset metrics counters
    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    pub(crate) fn record_lagged(&mut self, skipped: u64) {
        self.metrics.record_lagged(skipped);
    }

    /// Perform one sweep cycle at `now`
    ///
    /// 1. Expires stale proposals
    /// 2. Reactivates lapsed suppressions
    /// 3. Re-evaluates every live organism, when enabled
    ///
    /// Returns the updated metrics after the sweep.
    pub fn sweep(&mut self, ledger: &Ledger, now: u64) -> Result<JanitorMetrics, JanitorError> {
        let start = Instant::now();
        let result = if self.config.dry_run {
            self.dry_run(ledger, now)
        } else {
            self.apply(ledger, now)
        };
        if let Err(e) = result {
            self.metrics.record_failure();
            return Err(e);
        }

        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics.record_sweep(elapsed);
        Ok(self.metrics.clone())
    }

    fn apply(&mut self, ledger: &Ledger, now: u64) -> Result<(), JanitorError> {
        let expired = ledger.expire_stale(now)?;
        self.metrics.record_expired(expired.len());

        let reactivated = ledger.reactivate_expired(now)?;
        self.metrics.record_reactivated(reactivated.len());

        if self.config.reevaluate_on_sweep {
            for organism in ledger.list_organisms()?.into_iter().filter(|o| !o.archived) {
                match ledger.reevaluate(organism.id) {
                    Ok(sweep) => {
                        self.metrics
                            .record_reevaluation(sweep.created.len() + sweep.reactivated.len());
                    }
                    Err(e) => {
                        warn!(organism = %organism.id, error = %e, "Re-evaluation failed");
                    }
                }
            }
        }

        info!(
            expired = expired.len(),
            reactivated = reactivated.len(),
            "Sweep completed"
        );
        Ok(())
    }

    fn dry_run(&mut self, ledger: &Ledger, now: u64) -> Result<(), JanitorError> {
        let mut expired = 0;
        for status in [MutationStatus::Proposed, MutationStatus::Validated] {
            expired += ledger
                .list_mutations(None, Some(status))?
                .iter()
                .filter(|m| m.is_expired(now))
                .count();
        }

        let lapsed = ledger
            .list_conflicts(&ConflictFilter {
                status: Some(ConflictStatus::Suppressed),
                ..Default::default()
            })?
            .iter()
            .filter(|c| c.suppression.as_ref().is_some_and(|s| s.has_expired(now)))
            .count();

        info!(
            would_expire = expired,
            would_reactivate = lapsed,
            "Dry run: sweep made no changes"
        );
        Ok(())
    }

    /// React to one ledger event
    ///
    /// A committed mutation re-scores its organism's active conflicts so
    /// severity follows the new claim weights. Returns the number of
    /// conflicts whose score changed.
    pub fn handle_event(&mut self, ledger: &Ledger, event: &LedgerEvent, now: u64) -> Result<usize, JanitorError> {
        self.metrics.record_event();
        let LedgerEvent::MutationCommitted { organism_id, mutation_id, .. } = event else {
            return Ok(0);
        };
        if !self.config.rescore_on_commit || self.config.dry_run {
            return Ok(0);
        }

        let rescored = ledger.rescore_active(*organism_id, now)?;
        self.metrics.record_rescored(rescored.len());
        if !rescored.is_empty() {
            debug!(
                organism = %organism_id,
                mutation = %mutation_id,
                rescored = rescored.len(),
                "Conflicts re-scored after commit"
            );
        }
        Ok(rescored.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_domain::{ChangeOp, ChangeRequest, LensKey, OrganismId};
    use ledger_engine::{Clock, LedgerConfig, ManualClock};
    use std::sync::Arc;

    fn ledger() -> (Ledger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = LedgerConfig {
            proposal_ttl_ms: 500,
            ..LedgerConfig::lenient()
        };
        (Ledger::in_memory(config).with_clock(clock.clone()), clock)
    }

    fn propose(ledger: &Ledger, organism_id: OrganismId) {
        let change = ChangeRequest::on_lens(
            LensKey::parse("pricing.floor").unwrap(),
            ChangeOp::Create {
                value: 10.0.into(),
                weight: 0.5,
                baseline: None,
                constraints: vec![],
            },
        );
        ledger.propose(organism_id, "alice", vec![change], None).unwrap();
    }

    #[test]
    fn test_sweep_expires_proposals() {
        let (ledger, clock) = ledger();
        let organism = ledger.create_organism("Maison", "brand", vec![]).unwrap();
        propose(&ledger, organism.id);

        let mut janitor = Janitor::default_config();
        let metrics = janitor.sweep(&ledger, clock.now()).unwrap();
        assert_eq!(metrics.expired_proposals, 0);

        clock.advance(600);
        let metrics = janitor.sweep(&ledger, clock.now()).unwrap();
        assert_eq!(metrics.expired_proposals, 1);
        assert_eq!(metrics.sweep_count, 2);
        assert_eq!(
            ledger
                .list_mutations(Some(organism.id), Some(MutationStatus::Expired))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let (ledger, clock) = ledger();
        let organism = ledger.create_organism("Maison", "brand", vec![]).unwrap();
        propose(&ledger, organism.id);
        clock.advance(600);

        let mut janitor = Janitor::new(JanitorConfig {
            dry_run: true,
            ..Default::default()
        });
        let metrics = janitor.sweep(&ledger, clock.now()).unwrap();
        assert_eq!(metrics.sweep_count, 1);
        assert_eq!(metrics.expired_proposals, 0);
        assert_eq!(
            ledger
                .list_mutations(Some(organism.id), Some(MutationStatus::Proposed))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_reevaluation_skips_archived() {
        let (ledger, clock) = ledger();
        ledger.create_organism("Maison", "brand", vec![]).unwrap();
        let archived = ledger.create_organism("Atelier", "brand", vec![]).unwrap();
        ledger.archive_organism(archived.id).unwrap();

        let mut janitor = Janitor::new(JanitorConfig::strict());
        let metrics = janitor.sweep(&ledger, clock.now()).unwrap();
        assert_eq!(metrics.reevaluated_organisms, 1);
        assert_eq!(metrics.detected_conflicts, 0);
    }

    #[test]
    fn test_only_commits_trigger_rescoring() {
        let (ledger, clock) = ledger();
        let mut janitor = Janitor::default_config();
        let event = LedgerEvent::ProjectionInvalidated {
            organism_id: OrganismId::new(),
            epoch: 1,
        };
        assert_eq!(janitor.handle_event(&ledger, &event, clock.now()).unwrap(), 0);
        assert_eq!(janitor.metrics().events_handled, 1);
        assert_eq!(janitor.metrics().rescored_conflicts, 0);
    }
}
