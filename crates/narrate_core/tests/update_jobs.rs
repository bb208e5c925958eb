use std::sync::Once;

use chrono::{DateTime, TimeZone, Utc};
use narrate_core::{
    parse_event, update, Effect, JobFilter, JobStatus, Msg, ParentEntity, QueryData, QueryKey,
    Reconciler, Unit, UnitStatus,
};
use pretty_assertions::assert_eq;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(narrate_logging::initialize_for_tests);
}

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, second).unwrap()
}

fn chapter(id: &str, units: &[(&str, UnitStatus)]) -> ParentEntity {
    ParentEntity {
        id: id.to_string(),
        units: units
            .iter()
            .map(|(unit_id, status)| Unit {
                id: unit_id.to_string(),
                parent_id: id.to_string(),
                status: *status,
                result_ref: None,
            })
            .collect(),
    }
}

fn list_key() -> QueryKey {
    QueryKey::Jobs(JobFilter::for_parent("ch-1"))
}

/// A chapter with three idle segments and an empty job list for it.
fn seeded() -> Reconciler {
    let state = Reconciler::new();
    let (state, _) = update(
        state,
        Msg::QueryLoaded {
            key: QueryKey::Parent("ch-1".to_string()),
            data: QueryData::Parent(chapter(
                "ch-1",
                &[
                    ("s1", UnitStatus::Pending),
                    ("s2", UnitStatus::Pending),
                    ("s3", UnitStatus::Pending),
                ],
            )),
        },
    );
    let (mut state, _) = update(
        state,
        Msg::QueryLoaded {
            key: list_key(),
            data: QueryData::Jobs(Vec::new()),
        },
    );
    state.consume_dirty();
    state
}

fn push(state: Reconciler, data: &str, received_at: DateTime<Utc>) -> (Reconciler, Vec<Effect>) {
    let event = parse_event(None, data)
        .expect("valid event")
        .expect("job event");
    update(state, Msg::Event { event, received_at })
}

fn unit_status(state: &Reconciler, unit_id: &str) -> UnitStatus {
    state.cache().unit("ch-1", unit_id).expect("unit").status
}

const CREATED: &str = r#"{"event":"job.created","jobId":"job-1","chapterId":"ch-1","totalSegments":3,"segmentIds":["s1","s2","s3"],"_timestamp":"2024-05-01T10:00:00"}"#;

#[test]
fn job_runs_from_created_to_completed_with_targeted_patches() {
    init_logging();
    let (state, effects) = push(seeded(), CREATED, at(0));
    assert!(effects.is_empty());
    let job = state.cache().job("job-1").expect("job cached").clone();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.total_units, 3);
    assert_eq!(job.created_at, at(0));
    assert_eq!(state.cache().jobs(&JobFilter::for_parent("ch-1")).map(<[_]>::len), Some(1));
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Queued);

    let (state, effects) = push(
        state,
        r#"{"event":"job.started","jobId":"job-1","chapterId":"ch-1","totalSegments":3,"processedSegments":0,"startedAt":"2024-05-01T10:00:01Z"}"#,
        at(1),
    );
    assert!(effects.is_empty());
    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.started_at, Some(at(1)));

    let (state, effects) = push(
        state,
        r#"{"event":"segment.started","segmentId":"s1","chapterId":"ch-1","jobId":"job-1"}"#,
        at(2),
    );
    assert!(effects.is_empty());
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Processing);

    let (state, effects) = push(
        state,
        r#"{"event":"segment.completed","segmentId":"s1","chapterId":"ch-1","audioPath":"audio/s1.wav"}"#,
        at(3),
    );
    assert!(effects.is_empty());
    let unit = state.cache().unit("ch-1", "s1").expect("unit");
    assert_eq!(unit.status, UnitStatus::Completed);
    assert_eq!(unit.result_ref.as_deref(), Some("audio/s1.wav"));
    assert_eq!(state.cache().job("job-1").expect("job").processed_units, 0);

    let (state, effects) = push(
        state,
        r#"{"event":"job.progress","jobId":"job-1","chapterId":"ch-1","processedSegments":1,"totalSegments":3,"currentSegmentId":"s2"}"#,
        at(4),
    );
    assert!(effects.is_empty());
    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.processed_units, 1);
    assert_eq!(job.current_unit_id.as_deref(), Some("s2"));

    let (state, effects) = push(
        state,
        r#"{"event":"job.completed","jobId":"job-1","chapterId":"ch-1","processedSegments":3,"totalSegments":3,"completedAt":"2024-05-01T10:00:09Z"}"#,
        at(9),
    );
    assert_eq!(
        effects,
        vec![
            Effect::Refetch(QueryKey::Parent("ch-1".to_string())),
            Effect::Refetch(list_key()),
        ]
    );
    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_units, 3);
    assert_eq!(job.completed_at, Some(at(9)));
    assert_eq!(job.current_unit_id, None);
    assert_eq!(job.error_message, None);
    assert_eq!(state.view().stale_queries.len(), 2);
}

#[test]
fn list_copy_and_own_entry_stay_in_step() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.started","jobId":"job-1","chapterId":"ch-1"}"#,
        at(1),
    );

    let own = state.cache().entry(&QueryKey::Job("job-1".to_string()));
    let listed = state.cache().jobs(&JobFilter::for_parent("ch-1")).expect("list");
    match own.map(|entry| &entry.data) {
        Some(QueryData::Job(job)) => assert_eq!(job, &listed[0]),
        other => panic!("unexpected entry {other:?}"),
    }
}

#[test]
fn cancel_before_processing_releases_queued_units() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, effects) = push(
        state,
        r#"{"event":"job.cancelled","jobId":"job-1","chapterId":"ch-1","segmentIds":[{"id":"s1"},{"id":"s2"},{"id":"s3"}]}"#,
        at(2),
    );

    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.completed_at, Some(at(2)));
    for unit_id in ["s1", "s2", "s3"] {
        assert_eq!(unit_status(&state, unit_id), UnitStatus::Pending);
    }
    assert!(effects.contains(&Effect::Refetch(QueryKey::Parent("ch-1".to_string()))));
    assert!(!state.has_unresolved_work());
}

#[test]
fn cancelled_keeps_finished_units() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.started","jobId":"job-1","chapterId":"ch-1"}"#,
        at(1),
    );
    let (state, _) = push(
        state,
        r#"{"event":"segment.completed","segmentId":"s1","chapterId":"ch-1"}"#,
        at(2),
    );
    let (state, _) = push(
        state,
        r#"{"event":"job.cancelling","jobId":"job-1","chapterId":"ch-1"}"#,
        at(3),
    );
    assert_eq!(
        state.cache().job("job-1").expect("job").status,
        JobStatus::Cancelling
    );

    let (state, _) = push(
        state,
        r#"{"event":"job.cancelled","jobId":"job-1","chapterId":"ch-1"}"#,
        at(4),
    );
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Completed);
    assert_eq!(unit_status(&state, "s2"), UnitStatus::Pending);
    assert_eq!(unit_status(&state, "s3"), UnitStatus::Pending);
}

#[test]
fn resume_creates_new_job_and_leaves_original_cancelled() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.cancelled","jobId":"job-1","chapterId":"ch-1"}"#,
        at(1),
    );
    let (state, effects) = push(
        state,
        r#"{"event":"job.resumed","jobId":"job-2","originalJobId":"job-1","chapterId":"ch-1","totalSegments":2,"segmentIds":["s2","s3"],"resumedAt":"2024-05-01T10:00:05"}"#,
        at(5),
    );

    assert!(effects.is_empty());
    assert_eq!(
        state.cache().job("job-1").expect("original").status,
        JobStatus::Cancelled
    );
    let resumed = state.cache().job("job-2").expect("resumed");
    assert_eq!(resumed.status, JobStatus::Pending);
    assert_eq!(resumed.total_units, 2);
    assert_eq!(resumed.created_at, at(5));
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Pending);
    assert_eq!(unit_status(&state, "s2"), UnitStatus::Queued);
    assert_eq!(state.view().jobs[0].job_id, "job-2");
}

#[test]
fn resume_reusing_cached_id_refreshes_instead_of_patching() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.cancelled","jobId":"job-1","chapterId":"ch-1"}"#,
        at(1),
    );
    let (state, effects) = push(
        state,
        r#"{"event":"job.resumed","jobId":"job-1","chapterId":"ch-1","segmentIds":["s2"]}"#,
        at(2),
    );

    assert_eq!(
        state.cache().job("job-1").expect("job").status,
        JobStatus::Cancelled
    );
    assert!(effects.contains(&Effect::Refetch(QueryKey::Job("job-1".to_string()))));
}

#[test]
fn late_progress_after_completion_is_ignored() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.completed","jobId":"job-1","chapterId":"ch-1"}"#,
        at(3),
    );
    let before = state.cache().job("job-1").expect("job").clone();

    let (state, effects) = push(
        state,
        r#"{"event":"job.progress","jobId":"job-1","chapterId":"ch-1","processedSegments":1}"#,
        at(4),
    );
    assert!(effects.is_empty());
    assert_eq!(state.cache().job("job-1").expect("job"), &before);

    let (state, effects) = push(
        state,
        r#"{"event":"job.started","jobId":"job-1","chapterId":"ch-1"}"#,
        at(5),
    );
    assert!(effects.is_empty());
    assert_eq!(
        state.cache().job("job-1").expect("job").status,
        JobStatus::Completed
    );
}

#[test]
fn failure_records_message_and_refetches() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, effects) = push(
        state,
        r#"{"event":"job.failed","jobId":"job-1","chapterId":"ch-1","processedSegments":1,"error":"engine crashed"}"#,
        at(6),
    );

    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("engine crashed"));
    assert_eq!(job.processed_units, 1);
    assert_eq!(job.completed_at, Some(at(6)));
    assert_eq!(effects.len(), 2);
}

#[test]
fn unknown_job_triggers_scoped_refetch() {
    init_logging();
    let (state, effects) = push(
        seeded(),
        r#"{"event":"job.progress","jobId":"ghost","chapterId":"ch-1","processedSegments":2}"#,
        at(1),
    );

    assert!(state.cache().job("ghost").is_none());
    assert!(effects.contains(&Effect::Refetch(list_key())));
    assert!(effects.contains(&Effect::Refetch(QueryKey::Parent("ch-1".to_string()))));
    assert!(effects.contains(&Effect::Refetch(QueryKey::Job("ghost".to_string()))));
}

#[test]
fn segment_missing_from_cached_chapter_refetches_chapter() {
    init_logging();
    let (_state, effects) = push(
        seeded(),
        r#"{"event":"segment.started","segmentId":"s9","chapterId":"ch-1"}"#,
        at(1),
    );
    assert_eq!(
        effects,
        vec![Effect::Refetch(QueryKey::Parent("ch-1".to_string()))]
    );
}

#[test]
fn segment_of_uncached_chapter_is_dropped_quietly() {
    init_logging();
    let state = seeded();
    let before = state.clone();
    let (state, effects) = push(
        state,
        r#"{"event":"segment.completed","segmentId":"x1","chapterId":"ch-7"}"#,
        at(1),
    );
    assert!(effects.is_empty());
    assert_eq!(state, before);
}

#[test]
fn started_segment_never_regresses_a_finished_one() {
    init_logging();
    let (state, _) = push(
        seeded(),
        r#"{"event":"segment.completed","segmentId":"s1","chapterId":"ch-1"}"#,
        at(1),
    );
    let (state, _) = push(
        state,
        r#"{"event":"segment.started","segmentId":"s1","chapterId":"ch-1"}"#,
        at(2),
    );
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Completed);
}

#[test]
fn segment_parent_is_found_without_chapter_id() {
    init_logging();
    let (state, _) = push(
        seeded(),
        r#"{"event":"segment.updated","segmentId":"s3","status":"failed"}"#,
        at(1),
    );
    assert_eq!(unit_status(&state, "s3"), UnitStatus::Failed);
}

#[test]
fn processed_count_is_clamped_to_total() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.progress","jobId":"job-1","chapterId":"ch-1","processedSegments":7}"#,
        at(1),
    );
    let row = &state.view().jobs[0];
    assert_eq!(row.processed_units, 3);
    assert_eq!(row.percent, 100);
}

#[test]
fn unresolved_work_tracks_queued_units() {
    init_logging();
    let state = seeded();
    assert!(!state.has_unresolved_work());
    let (state, _) = push(state, CREATED, at(0));
    assert!(state.has_unresolved_work());
    assert_eq!(state.view().unresolved_units, 3);
}

#[test]
fn failed_job_keeps_per_segment_outcomes() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.started","jobId":"job-1","chapterId":"ch-1","totalSegments":3}"#,
        at(1),
    );
    let (state, _) = push(
        state,
        r#"{"event":"segment.completed","segmentId":"s1","chapterId":"ch-1","audioPath":"a/s1.wav"}"#,
        at(2),
    );
    let (state, _) = push(
        state,
        r#"{"event":"segment.completed","segmentId":"s2","chapterId":"ch-1","audioPath":"a/s2.wav"}"#,
        at(3),
    );
    let (state, _) = push(
        state,
        r#"{"event":"job.progress","jobId":"job-1","chapterId":"ch-1","processedSegments":2,"totalSegments":3}"#,
        at(4),
    );
    let (state, _) = push(
        state,
        r#"{"event":"segment.failed","segmentId":"s3","chapterId":"ch-1","error":"E"}"#,
        at(5),
    );
    let (state, _) = push(
        state,
        r#"{"event":"job.failed","jobId":"job-1","chapterId":"ch-1","error":"E"}"#,
        at(6),
    );

    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("E"));
    assert_eq!(job.processed_units, 2);
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Completed);
    assert_eq!(unit_status(&state, "s2"), UnitStatus::Completed);
    assert_eq!(unit_status(&state, "s3"), UnitStatus::Failed);
}

#[test]
fn late_terminal_event_still_refreshes() {
    init_logging();
    let (state, _) = push(seeded(), CREATED, at(0));
    let (state, _) = push(
        state,
        r#"{"event":"job.completed","jobId":"job-1","chapterId":"ch-1","totalSegments":3}"#,
        at(5),
    );
    let (state, effects) = push(
        state,
        r#"{"event":"job.failed","jobId":"job-1","chapterId":"ch-1","error":"late"}"#,
        at(6),
    );

    let job = state.cache().job("job-1").expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_message, None);
    assert!(effects.contains(&Effect::Refetch(list_key())));
    assert!(effects.contains(&Effect::Refetch(QueryKey::Parent("ch-1".to_string()))));
}

#[test]
fn cancelled_job_without_segments_releases_nothing() {
    init_logging();
    let (state, _) = push(
        seeded(),
        r#"{"event":"job.created","jobId":"job-a","chapterId":"ch-1","segmentIds":["s1"]}"#,
        at(0),
    );
    let (state, _) = push(
        state,
        r#"{"event":"job.created","jobId":"job-b","chapterId":"ch-1","totalSegments":2}"#,
        at(1),
    );
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Queued);

    let (state, effects) = push(
        state,
        r#"{"event":"job.cancelled","jobId":"job-b","chapterId":"ch-1"}"#,
        at(2),
    );
    assert_eq!(
        state.cache().job("job-b").expect("job").status,
        JobStatus::Cancelled
    );
    assert_eq!(unit_status(&state, "s1"), UnitStatus::Queued);
    assert!(effects.contains(&Effect::Refetch(QueryKey::Parent("ch-1".to_string()))));
}
