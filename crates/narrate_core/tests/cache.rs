use chrono::{TimeZone, Utc};
use narrate_core::{
    Effect, InvalidationScope, Job, JobFilter, JobStatus, QueryCache, QueryData, QueryKey,
    Reconciler,
};
use pretty_assertions::assert_eq;

fn job(id: &str, parent_id: &str, status: JobStatus) -> Job {
    let mut job = Job::pending(
        id,
        parent_id,
        1,
        Vec::new(),
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
    );
    job.status = status;
    job
}

fn populated() -> QueryCache {
    let mut cache = QueryCache::new();
    cache.store(
        QueryKey::Jobs(JobFilter::active()),
        QueryData::Jobs(vec![job("a", "c1", JobStatus::Running)]),
    );
    cache.store(
        QueryKey::Jobs(JobFilter::for_parent("c2")),
        QueryData::Jobs(vec![job("b", "c2", JobStatus::Completed)]),
    );
    cache.store(
        QueryKey::Job("a".to_string()),
        QueryData::Job(job("a", "c1", JobStatus::Running)),
    );
    cache
}

#[test]
fn invalidation_scopes_select_matching_keys() {
    let mut cache = populated();
    assert_eq!(
        cache.invalidate(&InvalidationScope::Job("a".to_string())),
        vec![QueryKey::Job("a".to_string())]
    );
    assert_eq!(cache.invalidate(&InvalidationScope::JobLists).len(), 2);
    assert!(cache
        .invalidate(&InvalidationScope::Parent("c1".to_string()))
        .is_empty());
    assert_eq!(cache.invalidate(&InvalidationScope::All).len(), 3);
    assert!(cache.keys().all(|key| cache.entry(key).is_some_and(|entry| entry.stale)));
}

#[test]
fn storing_fresh_data_clears_stale_mark() {
    let mut cache = populated();
    cache.invalidate(&InvalidationScope::All);
    cache.store(
        QueryKey::Job("a".to_string()),
        QueryData::Job(job("a", "c1", JobStatus::Completed)),
    );
    let entry = cache.entry(&QueryKey::Job("a".to_string())).expect("entry");
    assert!(!entry.stale);
}

#[test]
fn own_entry_wins_over_list_copy() {
    let mut cache = populated();
    cache.store(
        QueryKey::Job("a".to_string()),
        QueryData::Job(job("a", "c1", JobStatus::Cancelling)),
    );
    assert_eq!(cache.job("a").map(|job| job.status), Some(JobStatus::Cancelling));
    assert_eq!(cache.all_jobs().len(), 2);
}

#[test]
fn inserted_job_joins_only_matching_lists() {
    let mut cache = populated();
    cache.insert_job(job("c", "c2", JobStatus::Pending));

    let active: Vec<&str> = cache
        .jobs(&JobFilter::active())
        .expect("active list")
        .iter()
        .map(|job| job.id.as_str())
        .collect();
    assert_eq!(active, vec!["c", "a"]);
    let chapter: Vec<&str> = cache
        .jobs(&JobFilter::for_parent("c2"))
        .expect("chapter list")
        .iter()
        .map(|job| job.id.as_str())
        .collect();
    assert_eq!(chapter, vec!["c", "b"]);

    cache.insert_job(job("x", "c9", JobStatus::Completed));
    assert_eq!(cache.jobs(&JobFilter::active()).map(<[_]>::len), Some(2));
    assert!(cache.job("x").is_some());
}

#[test]
fn patch_reaches_every_copy() {
    let mut cache = populated();
    let touched = cache.patch_job("a", |job| job.processed_units = 1);
    assert_eq!(touched, 2);
    assert_eq!(cache.patch_job("missing", |_| {}), 0);
}

#[test]
fn refresh_effects_follow_invalidated_keys() {
    let mut reconciler = Reconciler::new();
    reconciler.load(
        QueryKey::Parent("c1".to_string()),
        QueryData::Parent(narrate_core::ParentEntity {
            id: "c1".to_string(),
            units: Vec::new(),
        }),
    );
    assert_eq!(
        reconciler.invalidate(&InvalidationScope::Parent("c1".to_string())),
        vec![Effect::Refetch(QueryKey::Parent("c1".to_string()))]
    );
    assert!(reconciler
        .invalidate(&InvalidationScope::Job("nope".to_string()))
        .is_empty());
}
