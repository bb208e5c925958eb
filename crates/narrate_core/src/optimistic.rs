use std::fmt::Display;

use chrono::{DateTime, Utc};
use narrate_logging::{narrate_debug, narrate_warn};

use crate::{
    CacheEntry, JobId, JobStatus, ParentId, QueryCache, QueryKey, Reconciler, UnitStatus,
};

/// A user action applied to the cache before the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CancelJob(JobId),
    DeleteJob(JobId),
    /// Removes completed and failed jobs; cancelled jobs stay resumable.
    ClearHistory { parent_id: Option<ParentId> },
}

/// Verbatim pre-mutation copies of every entry a mutation touched.
///
/// `None` records that the key was absent, so rollback removes it again.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an optimistic update must be settled or rolled back"]
pub struct RollbackToken {
    mutation: Mutation,
    snapshots: Vec<(QueryKey, Option<CacheEntry>)>,
}

impl RollbackToken {
    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.snapshots.iter().map(|(key, _)| key)
    }
}

impl Reconciler {
    /// Applies `mutation` locally and returns the token that undoes it.
    pub fn apply_optimistic(&mut self, mutation: Mutation, now: DateTime<Utc>) -> RollbackToken {
        let keys = affected_keys(&self.cache, &mutation);
        let assumed_cancelled = match &mutation {
            Mutation::CancelJob(job_id) => self
                .cache
                .job(job_id)
                .filter(|job| job.status == JobStatus::Pending)
                .map(|job| job.id.clone()),
            _ => None,
        };
        let applied = mutation.clone();
        let token = self.transaction(mutation, keys, move |cache| apply(cache, &applied, now));
        if let Some(job_id) = assumed_cancelled {
            self.provisional.insert(job_id);
        }
        token
    }

    /// Snapshot `keys`, run `apply`, and hand back the snapshots.
    ///
    /// `keys` must cover every entry `apply` may touch.
    pub fn transaction(
        &mut self,
        mutation: Mutation,
        keys: Vec<QueryKey>,
        apply: impl FnOnce(&mut QueryCache),
    ) -> RollbackToken {
        let snapshots = keys
            .into_iter()
            .map(|key| {
                let entry = self.cache.entry(&key).cloned();
                (key, entry)
            })
            .collect();
        apply(&mut self.cache);
        self.mark_dirty();
        narrate_debug!("Applied optimistic {:?}", mutation);
        RollbackToken {
            mutation,
            snapshots,
        }
    }

    pub fn rollback(&mut self, token: RollbackToken) {
        narrate_warn!(
            "Rolling back optimistic {:?} ({} entries)",
            token.mutation,
            token.snapshots.len()
        );
        if let Mutation::CancelJob(job_id) = &token.mutation {
            self.provisional.remove(job_id);
        }
        for (key, entry) in token.snapshots {
            self.cache.restore(key, entry);
        }
        self.mark_dirty();
    }

    /// Keeps the optimistic state when the request succeeded and restores the
    /// snapshots when it failed. The outcome is passed through unchanged.
    pub fn settle<T, E: Display>(&mut self, token: RollbackToken, outcome: Result<T, E>) -> Result<T, E> {
        match outcome {
            Ok(value) => {
                narrate_debug!("Confirmed optimistic {:?}", token.mutation);
                Ok(value)
            }
            Err(err) => {
                narrate_warn!("Request for {:?} failed: {}", token.mutation, err);
                self.rollback(token);
                Err(err)
            }
        }
    }
}

fn affected_keys(cache: &QueryCache, mutation: &Mutation) -> Vec<QueryKey> {
    match mutation {
        Mutation::CancelJob(job_id) | Mutation::DeleteJob(job_id) => {
            let mut keys = cache.keys_holding_job(job_id);
            if let Some(job) = cache.job(job_id) {
                let parent_key = QueryKey::Parent(job.parent_id.clone());
                if cache.entry(&parent_key).is_some() {
                    keys.push(parent_key);
                }
            }
            keys
        }
        Mutation::ClearHistory { parent_id } => {
            let mut keys: Vec<QueryKey> = cache
                .keys()
                .filter(|key| matches!(key, QueryKey::Jobs(_)))
                .cloned()
                .collect();
            keys.extend(
                clearable(cache, parent_id.as_deref())
                    .into_iter()
                    .map(QueryKey::Job),
            );
            keys
        }
    }
}

fn clearable(cache: &QueryCache, parent_id: Option<&str>) -> Vec<JobId> {
    cache
        .all_jobs()
        .into_iter()
        .filter(|job| matches!(job.status, JobStatus::Completed | JobStatus::Failed))
        .filter(|job| parent_id.map_or(true, |parent_id| job.parent_id == parent_id))
        .map(|job| job.id.clone())
        .collect()
}

fn apply(cache: &mut QueryCache, mutation: &Mutation, now: DateTime<Utc>) {
    match mutation {
        Mutation::CancelJob(job_id) => {
            let Some(job) = cache.job(job_id).cloned() else {
                return;
            };
            let next = match job.status {
                JobStatus::Pending => JobStatus::Cancelled,
                JobStatus::Running => JobStatus::Cancelling,
                _ => return,
            };
            cache.patch_job(job_id, |cached| {
                if let Err(err) = cached.transition(next, now) {
                    narrate_debug!("Cached copy of job {} kept: {}", cached.id, err);
                }
            });
            if next == JobStatus::Cancelled {
                if let Some(parent) = cache.parent_mut(&job.parent_id) {
                    parent
                        .units
                        .iter_mut()
                        .filter(|unit| job.covers_unit(&unit.id))
                        .for_each(|unit| {
                            unit.release_if_queued();
                        });
                }
            }
        }
        Mutation::DeleteJob(job_id) => {
            let Some(job) = cache.job(job_id).cloned() else {
                return;
            };
            cache.remove_job(job_id);
            if let Some(parent) = cache.parent_mut(&job.parent_id) {
                parent
                    .units
                    .iter_mut()
                    .filter(|unit| job.covers_unit(&unit.id) && unit.status.is_unresolved())
                    .for_each(|unit| unit.status = UnitStatus::Pending);
            }
        }
        Mutation::ClearHistory { parent_id } => {
            for job_id in clearable(cache, parent_id.as_deref()) {
                cache.remove_job(&job_id);
            }
        }
    }
}
