//! Projection cache
//!
//! Projections are read-only views rebuilt from claims, conflicts and the
//! mutation chain. Each organism has an epoch that every commit bumps; a
//! cached projection built at an older epoch is served with `stale = true`
//! until it is regenerated.

use crate::events::LedgerEvent;
use crate::{Ledger, LedgerResult};
use ledger_domain::drift;
use ledger_domain::{
    BaselineDiffRow, Lens, LensKey, MatrixRow, OrganismId, Projection, ProjectionData, ProjectionId,
    ProjectionKind, SummaryData, TimelineEntry,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

type CacheKey = (OrganismId, ProjectionKind);

#[derive(Default)]
struct CacheInner {
    epochs: HashMap<OrganismId, u64>,
    entries: HashMap<CacheKey, Projection>,
    order: VecDeque<CacheKey>,
}

/// Bounded cache of generated projections with per-organism epochs
pub struct ProjectionCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ProjectionCache {
    /// Cache holding at most `capacity` projections
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current epoch of an organism
    pub fn epoch(&self, organism_id: OrganismId) -> u64 {
        self.lock().epochs.get(&organism_id).copied().unwrap_or(0)
    }

    /// Bump an organism's epoch; returns the new epoch
    pub fn invalidate(&self, organism_id: OrganismId) -> u64 {
        let mut inner = self.lock();
        let epoch = inner.epochs.entry(organism_id).or_insert(0);
        *epoch += 1;
        *epoch
    }

    /// Cached projection, flagged stale when its epoch has moved
    pub fn get(&self, organism_id: OrganismId, kind: ProjectionKind) -> Option<Projection> {
        let inner = self.lock();
        let current = inner.epochs.get(&organism_id).copied().unwrap_or(0);
        inner.entries.get(&(organism_id, kind)).map(|p| {
            let mut projection = p.clone();
            projection.stale = projection.epoch != current;
            projection
        })
    }

    /// Store a projection, evicting the oldest entries past capacity
    pub fn insert(&self, projection: Projection) {
        let key = (projection.organism_id, projection.kind);
        let mut inner = self.lock();
        if inner.entries.insert(key, projection).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Number of cached projections
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next process-wide projection version
    pub fn next_version() -> u64 {
        NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
    }
}

impl Ledger {
    /// Mark every cached projection of an organism stale
    pub fn invalidate_projections(&self, organism_id: OrganismId) {
        let epoch = self.projections.invalidate(organism_id);
        self.events
            .publish(LedgerEvent::ProjectionInvalidated { organism_id, epoch });
        debug!(organism = %organism_id, epoch, "Projections invalidated");
    }

    /// Cached projection without regenerating, possibly stale
    pub fn cached_projection(&self, organism_id: OrganismId, kind: ProjectionKind) -> Option<Projection> {
        self.projections.get(organism_id, kind)
    }

    /// Projection of an organism, regenerated when missing or stale
    ///
    /// With `as_of` the view is rebuilt from the mutation chain and is never
    /// cached.
    pub fn projection(
        &self,
        organism_id: OrganismId,
        kind: ProjectionKind,
        as_of: Option<u64>,
    ) -> LedgerResult<Projection> {
        if as_of.is_none() {
            if let Some(cached) = self.projections.get(organism_id, kind).filter(|p| !p.stale) {
                return Ok(cached);
            }
        }

        let epoch = self.projections.epoch(organism_id);
        let data = self.projection_data(organism_id, kind, as_of)?;
        let projection = Projection {
            id: ProjectionId::new(),
            organism_id,
            kind,
            version: ProjectionCache::next_version(),
            epoch,
            as_of,
            generated_at: self.now(),
            stale: false,
            data,
        };
        if as_of.is_none() {
            self.projections.insert(projection.clone());
        }
        debug!(organism = %organism_id, %kind, version = projection.version, "Projection generated");
        Ok(projection)
    }

    fn projection_data(
        &self,
        organism_id: OrganismId,
        kind: ProjectionKind,
        as_of: Option<u64>,
    ) -> LedgerResult<ProjectionData> {
        let organism = self.load_organism(organism_id)?;
        let lenses = self.lens_map()?;
        let state = self.state_at(organism_id, as_of)?;
        let conflicts = self.active_conflicts_at(organism_id, as_of)?;
        let scale = |key: &LensKey| lenses.get(key).and_then(Lens::distance_scale);

        let data = match kind {
            ProjectionKind::Matrix => ProjectionData::Matrix(
                state
                    .live_claims()
                    .map(|claim| MatrixRow {
                        lens: claim.lens.clone(),
                        claim_id: claim.id,
                        value: claim.value.clone(),
                        weight: claim.weight,
                        drift: drift::drift(claim, scale(&claim.lens)),
                        weighted_drift: drift::weighted_drift(claim, scale(&claim.lens)),
                        active_conflicts: conflicts.iter().filter(|c| c.involves(claim.id)).count(),
                    })
                    .collect(),
            ),
            ProjectionKind::Timeline => ProjectionData::Timeline(
                self.chain(organism_id)?
                    .into_iter()
                    .filter(|m| as_of.is_none_or(|at| m.committed_at.is_some_and(|c| c <= at)))
                    .map(|m| TimelineEntry {
                        lenses: m.touched_lenses(),
                        mutation_id: m.id,
                        actor: m.actor,
                        intent: m.intent,
                        status: m.status,
                        committed_at: m.committed_at,
                        tradeoffs: m.tradeoffs.len(),
                    })
                    .collect(),
            ),
            ProjectionKind::Diff => ProjectionData::Diff(
                state
                    .live_claims()
                    .map(|claim| BaselineDiffRow {
                        lens: claim.lens.clone(),
                        value: claim.value.clone(),
                        baseline: claim.baseline.value.clone(),
                        mode: claim.baseline.mode,
                        drift: drift::drift(claim, scale(&claim.lens)),
                    })
                    .collect(),
            ),
            ProjectionKind::Summary => {
                let constraints = self.constraints_at(as_of)?;
                let assessment = self.assess(&organism, &state, &lenses, &constraints, &conflicts);
                let mutations = self
                    .chain(organism_id)?
                    .iter()
                    .filter(|m| as_of.is_none_or(|at| m.committed_at.is_some_and(|c| c <= at)))
                    .count();
                ProjectionData::Summary(SummaryData {
                    coherence: assessment.breakdown.coherence,
                    total_drift: assessment.breakdown.total_drift,
                    claims: state.live_claims().count(),
                    active_conflicts: conflicts.len(),
                    mutations,
                })
            }
        };
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(organism_id: OrganismId, epoch: u64) -> Projection {
        Projection {
            id: ProjectionId::new(),
            organism_id,
            kind: ProjectionKind::Summary,
            version: ProjectionCache::next_version(),
            epoch,
            as_of: None,
            generated_at: 0,
            stale: false,
            data: ProjectionData::Summary(SummaryData {
                coherence: 1.0,
                total_drift: 0.0,
                claims: 0,
                active_conflicts: 0,
                mutations: 0,
            }),
        }
    }

    #[test]
    fn test_stale_after_invalidate() {
        let cache = ProjectionCache::new(8);
        let org = OrganismId::new();
        cache.insert(summary(org, cache.epoch(org)));
        assert!(!cache.get(org, ProjectionKind::Summary).unwrap().stale);

        assert_eq!(cache.invalidate(org), 1);
        assert!(cache.get(org, ProjectionKind::Summary).unwrap().stale);
        assert!(cache.get(org, ProjectionKind::Matrix).is_none());
    }

    #[test]
    fn test_evicts_oldest() {
        let cache = ProjectionCache::new(2);
        let orgs: Vec<OrganismId> = (0..3).map(|_| OrganismId::new()).collect();
        for org in &orgs {
            cache.insert(summary(*org, 0));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(orgs[0], ProjectionKind::Summary).is_none());
        assert!(cache.get(orgs[2], ProjectionKind::Summary).is_some());
    }

    #[test]
    fn test_versions_increase() {
        let first = ProjectionCache::next_version();
        let second = ProjectionCache::next_version();
        assert!(second > first);
    }
}
