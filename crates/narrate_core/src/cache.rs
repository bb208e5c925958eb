use std::collections::BTreeMap;

use crate::{Job, JobId, JobStatus, ParentEntity, ParentId, Unit};

/// Filter tuple of a job-list query, mirroring the backend's list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobFilter {
    pub parent_id: Option<ParentId>,
    pub status: Option<JobStatus>,
    /// Only pending, running and cancelling jobs (the backend's `/active` view).
    pub active_only: bool,
}

impl JobFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn for_parent(parent_id: impl Into<ParentId>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(parent_id) = &self.parent_id {
            if &job.parent_id != parent_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        !self.active_only || job.status.is_active()
    }
}

/// Identity of one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryKey {
    Job(JobId),
    Jobs(JobFilter),
    Parent(ParentId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryData {
    Job(Job),
    Jobs(Vec<Job>),
    Parent(ParentEntity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub data: QueryData,
    /// Marked by invalidation until the refetch lands.
    pub stale: bool,
}

/// Which cached queries an invalidation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    Job(JobId),
    Parent(ParentId),
    JobLists,
    All,
}

impl InvalidationScope {
    fn covers(&self, key: &QueryKey) -> bool {
        match (self, key) {
            (InvalidationScope::All, _) => true,
            (InvalidationScope::Job(id), QueryKey::Job(key_id)) => id == key_id,
            (InvalidationScope::Parent(id), QueryKey::Parent(key_id)) => id == key_id,
            (InvalidationScope::JobLists, QueryKey::Jobs(_)) => true,
            _ => false,
        }
    }
}

/// Keyed store of query results. Ordered by key so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryCache {
    entries: BTreeMap<QueryKey, CacheEntry>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: &QueryKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The job by id, from its own entry or any list that contains it.
    pub fn job(&self, job_id: &str) -> Option<&Job> {
        if let Some(CacheEntry {
            data: QueryData::Job(job),
            ..
        }) = self.entries.get(&QueryKey::Job(job_id.to_string()))
        {
            return Some(job);
        }
        self.entries.values().find_map(|entry| match &entry.data {
            QueryData::Jobs(jobs) => jobs.iter().find(|job| job.id == job_id),
            _ => None,
        })
    }

    pub fn jobs(&self, filter: &JobFilter) -> Option<&[Job]> {
        match self.entries.get(&QueryKey::Jobs(filter.clone())) {
            Some(CacheEntry {
                data: QueryData::Jobs(jobs),
                ..
            }) => Some(jobs.as_slice()),
            _ => None,
        }
    }

    pub fn parent(&self, parent_id: &str) -> Option<&ParentEntity> {
        match self.entries.get(&QueryKey::Parent(parent_id.to_string())) {
            Some(CacheEntry {
                data: QueryData::Parent(parent),
                ..
            }) => Some(parent),
            _ => None,
        }
    }

    pub fn unit(&self, parent_id: &str, unit_id: &str) -> Option<&Unit> {
        self.parent(parent_id).and_then(|parent| parent.unit(unit_id))
    }

    pub fn parents(&self) -> impl Iterator<Item = &ParentEntity> {
        self.entries.values().filter_map(|entry| match &entry.data {
            QueryData::Parent(parent) => Some(parent),
            _ => None,
        })
    }

    /// Every distinct cached job; a job's own entry wins over list copies.
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut seen: BTreeMap<&str, &Job> = BTreeMap::new();
        for entry in self.entries.values() {
            match &entry.data {
                QueryData::Job(job) => {
                    seen.insert(job.id.as_str(), job);
                }
                QueryData::Jobs(jobs) => {
                    for job in jobs {
                        seen.entry(job.id.as_str()).or_insert(job);
                    }
                }
                QueryData::Parent(_) => {}
            }
        }
        seen.into_values().collect()
    }

    /// Stores a fetched result and clears its stale mark.
    pub fn store(&mut self, key: QueryKey, data: QueryData) {
        self.entries.insert(key, CacheEntry { data, stale: false });
    }

    pub fn remove(&mut self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn restore(&mut self, key: QueryKey, entry: Option<CacheEntry>) {
        match entry {
            Some(entry) => {
                self.entries.insert(key, entry);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    /// Keys of every entry that currently holds `job_id`.
    pub fn keys_holding_job(&self, job_id: &str) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| match &entry.data {
                QueryData::Job(job) => job.id == job_id,
                QueryData::Jobs(jobs) => jobs.iter().any(|job| job.id == job_id),
                QueryData::Parent(_) => false,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Applies `patch` to every cached copy of the job. Returns how many copies
    /// were touched; zero means the job is unknown to the cache.
    pub fn patch_job(&mut self, job_id: &str, mut patch: impl FnMut(&mut Job)) -> usize {
        let mut touched = 0;
        for entry in self.entries.values_mut() {
            match &mut entry.data {
                QueryData::Job(job) if job.id == job_id => {
                    patch(job);
                    touched += 1;
                }
                QueryData::Jobs(jobs) => {
                    if let Some(job) = jobs.iter_mut().find(|job| job.id == job_id) {
                        patch(job);
                        touched += 1;
                    }
                }
                _ => {}
            }
        }
        touched
    }

    /// Inserts a new job under its own key and at the head of every cached
    /// list whose filter accepts it. Lists that already hold it are left alone.
    pub fn insert_job(&mut self, job: Job) {
        for (key, entry) in self.entries.iter_mut() {
            if let (QueryKey::Jobs(filter), QueryData::Jobs(jobs)) = (key, &mut entry.data) {
                if filter.matches(&job) && !jobs.iter().any(|cached| cached.id == job.id) {
                    jobs.insert(0, job.clone());
                }
            }
        }
        self.store(QueryKey::Job(job.id.clone()), QueryData::Job(job));
    }

    /// Drops the job from its own key and from every list.
    pub fn remove_job(&mut self, job_id: &str) {
        self.entries.remove(&QueryKey::Job(job_id.to_string()));
        for entry in self.entries.values_mut() {
            if let QueryData::Jobs(jobs) = &mut entry.data {
                jobs.retain(|job| job.id != job_id);
            }
        }
    }

    pub fn parent_mut(&mut self, parent_id: &str) -> Option<&mut ParentEntity> {
        match self.entries.get_mut(&QueryKey::Parent(parent_id.to_string())) {
            Some(CacheEntry {
                data: QueryData::Parent(parent),
                ..
            }) => Some(parent),
            _ => None,
        }
    }

    /// Marks covered entries stale and returns their keys for refetching.
    pub fn invalidate(&mut self, scope: &InvalidationScope) -> Vec<QueryKey> {
        self.entries
            .iter_mut()
            .filter(|(key, _)| scope.covers(key))
            .map(|(key, entry)| {
                entry.stale = true;
                key.clone()
            })
            .collect()
    }
}
