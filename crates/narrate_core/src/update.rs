use chrono::{DateTime, Utc};
use narrate_logging::{narrate_debug, narrate_info, narrate_warn};

use crate::event::{JobRef, UnitRef};
use crate::{
    Effect, InvalidationScope, Job, JobEvent, JobStatus, Msg, ParentId, QueryKey, Reconciler,
    Unit, UnitId, UnitStatus,
};

/// Pure update function: applies a message to state and returns any effects.
pub fn update(mut state: Reconciler, msg: Msg) -> (Reconciler, Vec<Effect>) {
    let effects = match msg {
        Msg::Event { event, received_at } => state.apply_authoritative(event, received_at),
        Msg::RefreshRequested(scope) => {
            narrate_info!("Refresh requested for {:?}", scope);
            state.invalidate(&scope)
        }
        Msg::QueryLoaded { key, data } => {
            state.load(key, data);
            Vec::new()
        }
        Msg::QueryFailed { key, message } => {
            narrate_warn!("Fetch for {:?} failed: {}; keeping cached entry", key, message);
            Vec::new()
        }
        Msg::NoOp => Vec::new(),
    };

    (state, effects)
}

enum UnitPatch {
    Patched,
    Unchanged,
    ParentNotCached,
    UnitMissing(ParentId),
}

impl Reconciler {
    /// Applies one authoritative event as a targeted patch.
    ///
    /// Only terminal job events and self-healing produce refetch effects.
    pub fn apply_authoritative(&mut self, event: JobEvent, received_at: DateTime<Utc>) -> Vec<Effect> {
        narrate_debug!("Applying {}", event.name());
        match event {
            JobEvent::Created {
                job,
                total_units,
                unit_ids,
                created_at,
            } => self.on_created(job, total_units, unit_ids, created_at.unwrap_or(received_at)),
            JobEvent::Started {
                job,
                total_units,
                processed_units,
                started_at,
            } => self.on_started(job, total_units, processed_units, started_at.unwrap_or(received_at)),
            JobEvent::Progress {
                job,
                processed_units,
                total_units,
                failed_units,
                current_unit_id,
            } => self.on_progress(
                job,
                processed_units,
                total_units,
                failed_units,
                current_unit_id,
                received_at,
            ),
            JobEvent::Completed {
                job,
                processed_units,
                total_units,
                completed_at,
            } => self.on_completed(
                job,
                processed_units,
                total_units,
                completed_at.unwrap_or(received_at),
            ),
            JobEvent::Failed {
                job,
                processed_units,
                error,
                completed_at,
            } => self.on_failed(job, processed_units, error, completed_at.unwrap_or(received_at)),
            JobEvent::Cancelling { job } => self.on_cancelling(job, received_at),
            JobEvent::Cancelled {
                job,
                unit_ids,
                completed_at,
            } => self.on_cancelled(job, unit_ids, completed_at.unwrap_or(received_at)),
            JobEvent::Resumed {
                job,
                original_job_id,
                total_units,
                processed_units,
                unit_ids,
                resumed_at,
            } => self.on_resumed(
                job,
                original_job_id,
                total_units,
                processed_units,
                unit_ids,
                resumed_at.unwrap_or(received_at),
            ),
            JobEvent::UnitStarted { unit } => self.on_unit(unit, |cached| {
                if matches!(cached.status, UnitStatus::Completed | UnitStatus::Failed) {
                    return false;
                }
                cached.status = UnitStatus::Processing;
                true
            }),
            JobEvent::UnitCompleted { unit, result_ref } => self.on_unit(unit, |cached| {
                cached.status = UnitStatus::Completed;
                if result_ref.is_some() {
                    cached.result_ref = result_ref.clone();
                }
                true
            }),
            JobEvent::UnitFailed { unit, error } => {
                if let Some(error) = &error {
                    narrate_debug!("Segment {} failed: {}", unit.unit_id, error);
                }
                self.on_unit(unit, |cached| {
                    cached.status = UnitStatus::Failed;
                    true
                })
            }
            JobEvent::UnitUpdated {
                unit,
                status,
                result_ref,
            } => self.on_unit(unit, |cached| {
                cached.status = status;
                if result_ref.is_some() {
                    cached.result_ref = result_ref.clone();
                }
                true
            }),
        }
    }

    fn on_created(
        &mut self,
        job: JobRef,
        total_units: u32,
        unit_ids: Vec<UnitId>,
        created_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        if self.cache.job(&job.job_id).is_some() {
            narrate_debug!("Job {} already cached; ignoring duplicate created", job.job_id);
            return Vec::new();
        }
        let Some(parent_id) = job.parent_id else {
            narrate_warn!("Created event for job {} has no parent; refreshing lists", job.job_id);
            return self.invalidate(&InvalidationScope::JobLists);
        };

        let effects = self.queue_units(&parent_id, &unit_ids);
        self.cache.insert_job(Job::pending(
            job.job_id,
            parent_id,
            total_units,
            unit_ids,
            created_at,
        ));
        self.mark_dirty();
        effects
    }

    fn on_started(
        &mut self,
        job: JobRef,
        total_units: Option<u32>,
        processed_units: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        if !self.accepts(&job, JobStatus::Running) {
            return self.heal_if_missing(&job);
        }
        self.move_job(&job.job_id, JobStatus::Running, started_at, |cached| {
            cached.set_counts(processed_units, total_units, None);
        });
        self.mark_dirty();
        Vec::new()
    }

    fn on_progress(
        &mut self,
        job: JobRef,
        processed_units: Option<u32>,
        total_units: Option<u32>,
        failed_units: Option<u32>,
        current_unit_id: Option<UnitId>,
        received_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        let Some(status) = self.cache.job(&job.job_id).map(|cached| cached.status) else {
            return self.heal_if_missing(&job);
        };
        if status.is_terminal() {
            narrate_debug!("Ignoring late progress for {:?} job {}", status, job.job_id);
            return Vec::new();
        }
        self.cache.patch_job(&job.job_id, |cached| {
            cached.set_counts(processed_units, total_units, failed_units);
            if current_unit_id.is_some() {
                cached.current_unit_id = current_unit_id.clone();
            }
            cached.updated_at = Some(received_at);
        });
        self.mark_dirty();
        Vec::new()
    }

    fn on_completed(
        &mut self,
        job: JobRef,
        processed_units: Option<u32>,
        total_units: Option<u32>,
        completed_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        if !self.accepts_terminal(&job, JobStatus::Completed) {
            return self.refuse_terminal(&job);
        }
        self.move_job(&job.job_id, JobStatus::Completed, completed_at, |cached| {
            cached.set_counts(processed_units, total_units, None);
            cached.processed_units = cached.total_units;
        });
        self.mark_dirty();
        narrate_info!("Job {} completed", job.job_id);
        self.settle_terminal(&job)
    }

    fn on_failed(
        &mut self,
        job: JobRef,
        processed_units: Option<u32>,
        error: String,
        completed_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        if !self.accepts_terminal(&job, JobStatus::Failed) {
            return self.refuse_terminal(&job);
        }
        self.move_job(&job.job_id, JobStatus::Failed, completed_at, |cached| {
            cached.set_counts(processed_units, None, None);
            cached.record_error(error.clone());
        });
        self.mark_dirty();
        narrate_info!("Job {} failed: {}", job.job_id, error);
        self.settle_terminal(&job)
    }

    fn on_cancelling(&mut self, job: JobRef, received_at: DateTime<Utc>) -> Vec<Effect> {
        if !self.accepts(&job, JobStatus::Cancelling) {
            return self.heal_if_missing(&job);
        }
        self.move_job(&job.job_id, JobStatus::Cancelling, received_at, |_| {});
        self.mark_dirty();
        Vec::new()
    }

    fn on_cancelled(
        &mut self,
        job: JobRef,
        unit_ids: Vec<UnitId>,
        completed_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        if !self.accepts_terminal(&job, JobStatus::Cancelled) {
            return self.refuse_terminal(&job);
        }
        let (parent_id, covered) = match self.cache.job(&job.job_id) {
            Some(cached) => (Some(cached.parent_id.clone()), cached.unit_ids.clone()),
            None => (job.parent_id.clone(), Vec::new()),
        };
        let unit_ids = if unit_ids.is_empty() { covered } else { unit_ids };

        self.move_job(&job.job_id, JobStatus::Cancelled, completed_at, |_| {});
        if unit_ids.is_empty() {
            narrate_debug!(
                "Cancelled job {} names no segments; the chapter refetch settles them",
                job.job_id
            );
        } else if let Some(parent) = parent_id.as_deref().and_then(|id| self.cache.parent_mut(id)) {
            let released = parent
                .units
                .iter_mut()
                .filter(|unit| unit_ids.contains(&unit.id))
                .map(Unit::release_if_queued)
                .filter(|released| *released)
                .count();
            narrate_debug!("Released {} queued segments of job {}", released, job.job_id);
        }
        self.mark_dirty();
        narrate_info!("Job {} cancelled", job.job_id);
        self.settle_terminal(&JobRef {
            job_id: job.job_id,
            parent_id,
        })
    }

    fn on_resumed(
        &mut self,
        job: JobRef,
        original_job_id: Option<String>,
        total_units: u32,
        processed_units: u32,
        unit_ids: Vec<UnitId>,
        resumed_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        if self.cache.job(&job.job_id).is_some() {
            // A resume must introduce a new id; reusing one would rewrite the
            // cancelled original, so let the server's lists settle it instead.
            narrate_warn!(
                "Resumed event reuses cached job id {}; refreshing instead of patching",
                job.job_id
            );
            return self.heal(&job);
        }
        let Some(parent_id) = job.parent_id else {
            narrate_warn!("Resumed event for job {} has no parent; refreshing lists", job.job_id);
            return self.invalidate(&InvalidationScope::JobLists);
        };
        if let Some(original) = &original_job_id {
            narrate_info!("Job {} resumed as {}", original, job.job_id);
        }

        let effects = self.queue_units(&parent_id, &unit_ids);
        let mut resumed = Job::pending(job.job_id, parent_id, total_units, unit_ids, resumed_at);
        resumed.set_counts(Some(processed_units), None, None);
        self.cache.insert_job(resumed);
        self.mark_dirty();
        effects
    }

    fn on_unit(&mut self, unit: UnitRef, patch: impl FnOnce(&mut Unit) -> bool) -> Vec<Effect> {
        match self.patch_unit(&unit, patch) {
            UnitPatch::Patched => {
                self.mark_dirty();
                Vec::new()
            }
            UnitPatch::Unchanged => {
                narrate_debug!("Ignoring out-of-order update for segment {}", unit.unit_id);
                Vec::new()
            }
            UnitPatch::ParentNotCached => {
                narrate_debug!("Segment {} belongs to no cached chapter", unit.unit_id);
                Vec::new()
            }
            UnitPatch::UnitMissing(parent_id) => {
                narrate_info!(
                    "Segment {} missing from cached chapter {}; refreshing",
                    unit.unit_id,
                    parent_id
                );
                self.invalidate(&InvalidationScope::Parent(parent_id))
            }
        }
    }

    fn patch_unit(&mut self, unit: &UnitRef, patch: impl FnOnce(&mut Unit) -> bool) -> UnitPatch {
        let parent_id = unit
            .parent_id
            .clone()
            .or_else(|| {
                unit.job_id
                    .as_deref()
                    .and_then(|job_id| self.cache.job(job_id))
                    .map(|job| job.parent_id.clone())
            })
            .or_else(|| {
                self.cache
                    .parents()
                    .find(|parent| parent.unit(&unit.unit_id).is_some())
                    .map(|parent| parent.id.clone())
            });
        let Some(parent_id) = parent_id else {
            return UnitPatch::ParentNotCached;
        };
        let Some(parent) = self.cache.parent_mut(&parent_id) else {
            return UnitPatch::ParentNotCached;
        };
        let Some(cached) = parent.unit_mut(&unit.unit_id) else {
            return UnitPatch::UnitMissing(parent_id);
        };
        if patch(cached) {
            UnitPatch::Patched
        } else {
            UnitPatch::Unchanged
        }
    }

    /// Marks the listed units of a cached chapter as queued.
    fn queue_units(&mut self, parent_id: &str, unit_ids: &[UnitId]) -> Vec<Effect> {
        let Some(parent) = self.cache.parent_mut(parent_id) else {
            return Vec::new();
        };
        let mut missing = false;
        for unit_id in unit_ids {
            match parent.unit_mut(unit_id) {
                Some(unit) => unit.status = UnitStatus::Queued,
                None => missing = true,
            }
        }
        if missing {
            narrate_info!("Chapter {} lacks queued segments; refreshing", parent_id);
            return self.invalidate(&InvalidationScope::Parent(parent_id.to_string()));
        }
        Vec::new()
    }

    /// Whether the cached job exists and may move to `next`. Logs the reason
    /// when it may not.
    fn accepts(&self, job: &JobRef, next: JobStatus) -> bool {
        match self.cache.job(&job.job_id) {
            Some(cached) if cached.status.can_transition_to(next) => true,
            Some(cached) => {
                narrate_debug!(
                    "Ignoring {:?} -> {:?} for job {}",
                    cached.status,
                    next,
                    job.job_id
                );
                false
            }
            None => false,
        }
    }

    /// Like [`Self::accepts`], but a terminal status assumed by an optimistic
    /// cancel gives way to the server's terminal status.
    fn accepts_terminal(&self, job: &JobRef, next: JobStatus) -> bool {
        let assumed = self.provisional.contains(&job.job_id)
            && self
                .cache
                .job(&job.job_id)
                .is_some_and(|cached| cached.status.is_terminal());
        assumed || self.accepts(job, next)
    }

    /// A terminal event the cache cannot apply still means the server has
    /// moved on, so the job and everything listing it are refetched.
    fn refuse_terminal(&mut self, job: &JobRef) -> Vec<Effect> {
        if self.cache.job(&job.job_id).is_none() {
            return self.heal_if_missing(job);
        }
        let mut effects = self.settle_terminal(job);
        effects.extend(self.invalidate(&InvalidationScope::Job(job.job_id.clone())));
        effects
    }

    /// Moves every cached copy of the job to `next` and runs `patch` on each
    /// copy that moved. A copy that cannot move keeps all its fields.
    fn move_job(
        &mut self,
        job_id: &str,
        next: JobStatus,
        at: DateTime<Utc>,
        mut patch: impl FnMut(&mut Job),
    ) {
        let overrule = next.is_terminal() && self.provisional.remove(job_id);
        self.cache.patch_job(job_id, |cached| {
            let moved = match cached.transition(next, at) {
                Ok(()) => true,
                Err(_) if overrule && cached.status.is_terminal() => {
                    narrate_info!(
                        "Server reports job {} {}; replacing assumed {}",
                        cached.id,
                        next,
                        cached.status
                    );
                    cached.overrule(next, at);
                    true
                }
                Err(err) => {
                    narrate_debug!("Cached copy of job {} kept: {}", cached.id, err);
                    false
                }
            };
            if moved {
                patch(cached);
            }
        });
    }

    fn heal_if_missing(&mut self, job: &JobRef) -> Vec<Effect> {
        if self.cache.job(&job.job_id).is_some() {
            return Vec::new();
        }
        narrate_info!("Job {} not cached; refreshing", job.job_id);
        self.heal(job)
    }

    fn heal(&mut self, job: &JobRef) -> Vec<Effect> {
        let mut effects = self.invalidate(&InvalidationScope::JobLists);
        effects.extend(self.invalidate(&InvalidationScope::Job(job.job_id.clone())));
        if let Some(parent_id) = &job.parent_id {
            effects.extend(self.invalidate(&InvalidationScope::Parent(parent_id.clone())));
        }
        let own_key = Effect::Refetch(QueryKey::Job(job.job_id.clone()));
        if !effects.contains(&own_key) {
            effects.push(own_key);
        }
        effects
    }

    /// A terminal event reconciles any drift: refetch the chapter and all lists.
    fn settle_terminal(&mut self, job: &JobRef) -> Vec<Effect> {
        let parent_id = job.parent_id.clone().or_else(|| {
            self.cache
                .job(&job.job_id)
                .map(|cached| cached.parent_id.clone())
        });
        let mut effects = Vec::new();
        if let Some(parent_id) = parent_id {
            effects.extend(self.invalidate(&InvalidationScope::Parent(parent_id)));
        }
        effects.extend(self.invalidate(&InvalidationScope::JobLists));
        effects
    }
}
