use crate::{Job, JobId, JobStatus, ParentId, QueryKey, Reconciler};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncViewModel {
    pub jobs: Vec<JobRowView>,
    pub unresolved_units: usize,
    pub stale_queries: Vec<QueryKey>,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRowView {
    pub job_id: JobId,
    pub parent_id: ParentId,
    pub status: JobStatus,
    pub processed_units: u32,
    pub total_units: u32,
    pub percent: u8,
    pub error_message: Option<String>,
}

impl From<&Job> for JobRowView {
    fn from(job: &Job) -> Self {
        let percent = if job.total_units == 0 {
            0
        } else {
            (u64::from(job.processed_units) * 100 / u64::from(job.total_units)).min(100) as u8
        };
        Self {
            job_id: job.id.clone(),
            parent_id: job.parent_id.clone(),
            status: job.status,
            processed_units: job.processed_units,
            total_units: job.total_units,
            percent,
            error_message: job.error_message.clone(),
        }
    }
}

impl Reconciler {
    /// Snapshot for display. Active jobs sort first, newest first within a group.
    pub fn view(&self) -> SyncViewModel {
        let mut jobs = self.cache.all_jobs();
        jobs.sort_by(|a, b| {
            b.status
                .is_active()
                .cmp(&a.status.is_active())
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let unresolved_units = self
            .cache
            .parents()
            .flat_map(|parent| parent.units.iter())
            .filter(|unit| unit.status.is_unresolved())
            .count();
        let stale_queries = self
            .cache
            .keys()
            .filter(|key| self.cache.entry(key).is_some_and(|entry| entry.stale))
            .cloned()
            .collect();

        SyncViewModel {
            jobs: jobs.into_iter().map(JobRowView::from).collect(),
            unresolved_units,
            stale_queries,
            dirty: self.dirty,
        }
    }
}
