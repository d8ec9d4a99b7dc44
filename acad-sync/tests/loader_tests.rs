//! Snapshot loading: seeding, migration, repair and authoritative rebuild

mod helpers;

use acad_common::events::SyncEvent;
use acad_common::{DashboardSnapshot, StudentId};
use acad_sync::loader::SnapshotLoader;
use acad_sync::notifier::WriteMarker;
use acad_sync::store::{DocumentCache, RelationalStore};
use acad_sync::writer::WriteQueue;
use chrono::Utc;
use helpers::{drain, CountingCache, FlakyRelational, Harness};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn loader(
    h: &Harness,
    relational: Arc<dyn RelationalStore>,
    cache: Arc<dyn DocumentCache>,
) -> (SnapshotLoader, CancellationToken) {
    let token = CancellationToken::new();
    let (writer, _task) = WriteQueue::spawn(
        cache.clone(),
        WriteMarker::new(),
        h.events.clone(),
        8,
        token.clone(),
    );
    let loader = SnapshotLoader::new(
        relational,
        cache,
        writer,
        h.events.clone(),
        Duration::from_millis(10),
    );
    (loader, token)
}

fn default_loader(h: &Harness) -> (SnapshotLoader, CancellationToken) {
    loader(h, Arc::new(h.relational.clone()), Arc::new(h.cache.clone()))
}

#[tokio::test]
async fn test_first_load_seeds_and_persists() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (loader, _token) = default_loader(&h);

    let snapshot = loader.load("prof-1").await.expect("seeded load succeeds");

    assert_eq!(snapshot.subjects.len(), 3);
    assert!(snapshot.students.is_empty());
    assert_eq!(snapshot.owner_uid, "prof-1");

    let stored = h.cached("prof-1").await.expect("seed was persisted");
    assert_eq!(stored["subjects"].as_array().map(Vec::len), Some(3));

    let seeded = drain(&mut events)
        .into_iter()
        .any(|e| matches!(e, SyncEvent::SnapshotLoaded { seeded: true, .. }));
    assert!(seeded);
}

#[tokio::test]
async fn test_relational_projection_overrides_cached_enrollments() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101"]).await;
    h.enroll(courses[0], &["1", "2"]).await;
    h.add_student("2", "Bo").await;

    h.put_cached(
        "prof-1",
        json!({
            "schemaVersion": 2,
            "ownerUid": "prof-1",
            "subjects": [{"code": "CS101", "name": "Intro"}, {"code": "MAT101", "name": "Math"}],
            "students": [{"id": "1", "name": "Al"}, {"id": "9", "name": "Old"}],
            "enrolls": {"CS101": ["1"], "MAT101": ["9"]}
        }),
    )
    .await;

    let (loader, _token) = default_loader(&h);
    let snapshot = loader.load("prof-1").await.unwrap();

    let expected: Vec<StudentId> = vec!["1".into(), "2".into()];
    assert_eq!(snapshot.enrolls.len(), 1, "map replaced, not merged");
    assert_eq!(snapshot.enrolls["CS101"].iter().cloned().collect::<Vec<_>>(), expected);

    // Gap filled from the store of record, existing roster untouched
    let bo = snapshot.student(&StudentId::from("2")).expect("gap filled");
    assert_eq!(bo.name, "Bo");
    assert!(bo.archived_subjects.is_empty());
    assert!(snapshot.student(&StudentId::from("9")).is_some());
}

#[tokio::test]
async fn test_current_document_is_not_rewritten() {
    let h = Harness::new().await;
    let doc = serde_json::to_value(DashboardSnapshot::seeded("prof-1", Utc::now())).unwrap();
    h.put_cached("prof-1", doc).await;

    let counting = Arc::new(CountingCache::new(h.cache.clone()));
    let (loader, _token) = loader(&h, Arc::new(h.relational.clone()), counting.clone());

    loader.load("prof-1").await.unwrap();
    assert_eq!(counting.write_count(), 0);
}

#[tokio::test]
async fn test_legacy_document_is_migrated_once() {
    let h = Harness::new().await;
    h.put_cached(
        "prof-1",
        json!({
            "ownerUid": "prof-1",
            "subjects": ["CS101"],
            "students": {"5": {"name": "Eve"}},
            "enrollments": {"CS101": [5]}
        }),
    )
    .await;

    let counting = Arc::new(CountingCache::new(h.cache.clone()));
    let (loader, _token) = loader(&h, Arc::new(h.relational.clone()), counting.clone());

    let snapshot = loader.load("prof-1").await.unwrap();
    assert_eq!(snapshot.students[0].id, StudentId::from("5"));
    assert_eq!(counting.write_count(), 1);

    let stored = h.cached("prof-1").await.unwrap();
    assert_eq!(stored["schemaVersion"], json!(2));
    assert!(stored.get("enrollments").is_none());

    loader.load("prof-1").await.unwrap();
    assert_eq!(counting.write_count(), 1, "second load finds nothing to migrate");
}

#[tokio::test]
async fn test_unmigratable_document_takes_seed_path() {
    let h = Harness::new().await;
    h.put_cached("prof-1", json!(["not", "a", "dashboard"])).await;

    let (loader, _token) = default_loader(&h);
    let snapshot = loader.load("prof-1").await.expect("reseeded");

    assert_eq!(snapshot.subjects.len(), 3);
    assert!(h.cached("prof-1").await.unwrap().is_object());
}

#[tokio::test]
async fn test_non_json_body_takes_seed_path() {
    let h = Harness::new().await;
    sqlx::query(
        "INSERT INTO cache_documents (collection, owner_id, body) VALUES ('dashboards', 'prof-1', 'not json{')",
    )
    .execute(h.cache.pool())
    .await
    .unwrap();

    let (loader, _token) = default_loader(&h);
    let snapshot = loader.load("prof-1").await.expect("corrupt body is reseeded");

    assert_eq!(snapshot.subjects.len(), 3);
    assert!(h.cached("prof-1").await.unwrap().is_object());
}

#[tokio::test]
async fn test_null_fields_keep_the_roster() {
    let h = Harness::new().await;
    h.put_cached(
        "prof-1",
        json!({
            "ownerUid": "prof-1",
            "subjects": [{"code": "CS101", "name": "Intro", "credits": "6"}],
            "students": [{"id": "1", "name": "Ana", "email": null}, {"id": "2", "name": "Bo"}],
            "enrolls": {"CS101": ["1", "2"]},
            "grades": {"CS101": {"1": {"midterm": 7.5}}}
        }),
    )
    .await;

    let (loader, _token) = default_loader(&h);
    let snapshot = loader.load("prof-1").await.expect("null email is repaired");

    assert_eq!(snapshot.students.len(), 2);
    assert_eq!(snapshot.grades["CS101"][&StudentId::from("1")]["midterm"], 7.5);

    let stored = h.cached("prof-1").await.unwrap();
    assert_eq!(stored["students"].as_array().map(Vec::len), Some(2));
    assert_eq!(stored["students"][0]["email"], json!(""));
}

#[tokio::test]
async fn test_epoch_updated_at_keeps_the_roster() {
    let h = Harness::new().await;
    h.put_cached(
        "prof-1",
        json!({
            "ownerUid": "prof-1",
            "subjects": [{"code": "CS101"}],
            "students": [{"id": "1", "name": "Ana"}],
            "enrolls": {"CS101": ["1"]},
            "updatedAt": 1_700_000_000_000_i64
        }),
    )
    .await;

    let (loader, _token) = default_loader(&h);
    let snapshot = loader.load("prof-1").await.unwrap();

    assert_eq!(snapshot.students.len(), 1);
    assert_eq!(
        snapshot.updated_at.map(|at| at.timestamp_millis()),
        Some(1_700_000_000_000)
    );
}

#[tokio::test]
async fn test_undecodable_document_is_never_overwritten() {
    let h = Harness::new().await;
    let doc = json!({
        "ownerUid": "prof-1",
        "schemaVersion": 2,
        "subjects": [{"code": "CS101"}],
        "students": [{"id": {"oid": "5"}, "name": "Eve"}],
        "enrolls": {"CS101": ["5"]}
    });
    h.put_cached("prof-1", doc).await;
    let before = h.cached("prof-1").await.unwrap();

    let counting = Arc::new(CountingCache::new(h.cache.clone()));
    let (loader, _token) = loader(&h, Arc::new(h.relational.clone()), counting.clone());

    assert!(loader.load("prof-1").await.is_none(), "retry later, do not seed");
    assert_eq!(counting.write_count(), 0);
    assert_eq!(h.cached("prof-1").await.unwrap(), before);
}

#[tokio::test]
async fn test_archived_enrollment_is_repaired_and_force_written() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    h.put_cached(
        "prof-1",
        json!({
            "schemaVersion": 2,
            "ownerUid": "prof-1",
            "subjects": [{"code": "CS101"}],
            "students": [{"id": "001", "archivedSubjects": ["CS101"]}, {"id": "002"}],
            "enrolls": {"CS101": ["001", "002"]}
        }),
    )
    .await;

    let counting = Arc::new(CountingCache::new(h.cache.clone()));
    let (loader, _token) = loader(&h, Arc::new(h.relational.clone()), counting.clone());
    loader.load("prof-1").await.unwrap();

    let writes = counting.writes();
    let (repaired, options) = writes.last().expect("repair was persisted");
    assert!(options.force_write);
    assert_eq!(repaired["enrolls"]["CS101"], json!(["002"]));

    let dropped = drain(&mut events).into_iter().find_map(|e| match e {
        SyncEvent::SnapshotRepaired { dropped, .. } => Some(dropped),
        _ => None,
    });
    assert_eq!(dropped, Some(1));
}

#[tokio::test]
async fn test_archive_survives_authoritative_rebuild() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101"]).await;
    h.enroll(courses[0], &["001", "002"]).await;
    h.put_cached(
        "prof-1",
        json!({
            "ownerUid": "prof-1",
            "subjects": [{"code": "CS101"}],
            "students": [{"id": "001", "archivedSubjects": ["CS101"]}, {"id": "002"}],
            "enrolls": {"CS101": []}
        }),
    )
    .await;

    let (loader, _token) = default_loader(&h);
    let snapshot = loader.load("prof-1").await.unwrap();

    let members: Vec<&str> = snapshot.enrolls["CS101"].iter().map(StudentId::as_str).collect();
    assert_eq!(members, vec!["002"]);
}

#[tokio::test]
async fn test_projection_failure_yields_empty_enrollments() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101"]).await;
    h.enroll(courses[0], &["1"]).await;

    let flaky = Arc::new(FlakyRelational::new(h.relational.clone()));
    flaky.fail_course(courses[0]);
    let (loader, _token) = loader(&h, flaky, Arc::new(h.cache.clone()));

    let snapshot = loader.load("prof-1").await.expect("projection failure is not a load failure");
    assert!(snapshot.enrolls.is_empty());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::ProjectionFailed { .. })));
}

#[tokio::test]
async fn test_store_failure_returns_none_and_retry_recovers() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101"]).await;
    h.enroll(courses[0], &["7"]).await;
    h.add_student("7", "Gus").await;

    let flaky = Arc::new(FlakyRelational::new(h.relational.clone()));
    let (loader, token) = loader(&h, flaky.clone(), Arc::new(h.cache.clone()));

    flaky.fail_student_list(1);
    assert!(loader.load("prof-1").await.is_none(), "errors become a retry-later sentinel");

    flaky.fail_student_list(1);
    let snapshot = loader
        .load_with_retry("prof-1", &token)
        .await
        .expect("single retry succeeds");
    assert!(snapshot.student(&StudentId::from("7")).is_some());
}

#[tokio::test]
async fn test_retry_is_abandoned_when_cancelled() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101"]).await;
    h.enroll(courses[0], &["7"]).await;

    let flaky = Arc::new(FlakyRelational::new(h.relational.clone()));
    let (loader, _writer_token) = loader(&h, flaky.clone(), Arc::new(h.cache.clone()));
    flaky.fail_student_list(2);

    let session_token = CancellationToken::new();
    session_token.cancel();
    assert!(loader.load_with_retry("prof-1", &session_token).await.is_none());
    assert_eq!(
        flaky.student_list_failures.load(Ordering::SeqCst),
        1,
        "second scripted failure never consumed"
    );
}

#[tokio::test]
async fn test_refresh_picks_up_new_enrollments() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101"]).await;
    let (loader, _token) = default_loader(&h);

    let loaded = loader.load("prof-1").await.unwrap();
    assert!(loaded.enrolls["CS101"].is_empty());

    h.add_student("8", "Hal").await;
    h.enroll(courses[0], &["8"]).await;

    let refreshed = loader.refresh(&loaded).await.unwrap();
    assert!(refreshed.enrolls["CS101"].contains(&StudentId::from("8")));
    assert!(refreshed.student(&StudentId::from("8")).is_some());
}
