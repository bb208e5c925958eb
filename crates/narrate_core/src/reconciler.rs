use std::collections::BTreeSet;

use narrate_logging::narrate_debug;

use crate::{Effect, InvalidationScope, JobId, QueryCache, QueryData, QueryKey};

/// Sole writer of the query cache.
///
/// Readers borrow [`Reconciler::cache`] or take a [`Reconciler::view`]; every
/// mutation goes through `update`, an optimistic transaction, or `invalidate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciler {
    pub(crate) cache: QueryCache,
    pub(crate) dirty: bool,
    /// Jobs whose terminal status was set by an optimistic cancel and not yet
    /// confirmed by the server.
    pub(crate) provisional: BTreeSet<JobId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Returns whether anything changed since the last call, and resets the flag.
    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn load(&mut self, key: QueryKey, data: QueryData) {
        narrate_debug!("Loaded query {:?}", key);
        match (&key, &data) {
            (QueryKey::Job(job_id), _) => {
                self.provisional.remove(job_id);
            }
            (_, QueryData::Jobs(jobs)) => {
                for job in jobs {
                    self.provisional.remove(&job.id);
                }
            }
            _ => {}
        }
        self.cache.store(key, data);
        self.mark_dirty();
    }

    /// Marks the covered queries stale and asks for each to be refetched.
    pub fn invalidate(&mut self, scope: &InvalidationScope) -> Vec<Effect> {
        let keys = self.cache.invalidate(scope);
        if !keys.is_empty() {
            narrate_debug!("Invalidated {} queries for {:?}", keys.len(), scope);
            self.mark_dirty();
        }
        keys.into_iter().map(Effect::Refetch).collect()
    }

    /// Whether any cached unit is queued or processing, or any cached job is
    /// still active. Drives the polling fallback.
    pub fn has_unresolved_work(&self) -> bool {
        let unit_pending = self
            .cache
            .parents()
            .flat_map(|parent| parent.units.iter())
            .any(|unit| unit.status.is_unresolved());
        unit_pending
            || self
                .cache
                .all_jobs()
                .iter()
                .any(|job| job.status.is_active())
    }
}
