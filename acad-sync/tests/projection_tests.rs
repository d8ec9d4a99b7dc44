//! Relational projection of enrollments

mod helpers;

use acad_common::StudentId;
use acad_sync::error::ErrorClass;
use acad_sync::projection::{build_enrollments, ProjectionStatus};
use helpers::{FlakyRelational, Harness};
use std::collections::BTreeSet;

fn known(codes: &[&str]) -> BTreeSet<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn test_projection_covers_every_course() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101", "MA200", "PH100"]).await;
    h.enroll(courses[0], &["001", " 002"]).await;
    h.enroll(courses[1], &["002"]).await;

    let projection = build_enrollments(&h.relational, "prof-1", &known(&["CS101", "MA200"])).await;

    assert!(projection.is_complete());
    assert_eq!(projection.enrolls.len(), 3, "course without rows still gets a key");
    assert!(projection.enrolls["PH100"].is_empty());
    let new_codes: Vec<&str> = projection.new_subjects.iter().map(|s| s.code.as_str()).collect();
    assert_eq!(new_codes, vec!["PH100"]);
    assert!(projection.enrolls["CS101"].contains(&StudentId::from("002")));
    assert_eq!(
        projection.enrolled_ids,
        [StudentId::from("001"), StudentId::from("002")].into_iter().collect()
    );
}

#[tokio::test]
async fn test_rebuild_is_deterministic() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101", "PH100"]).await;
    h.enroll(courses[0], &["001"]).await;

    let first = build_enrollments(&h.relational, "prof-1", &known(&["CS101"])).await;
    let second = build_enrollments(&h.relational, "prof-1", &known(&["CS101"])).await;

    assert_eq!(first, second);
    assert_eq!(first.new_subjects[0].credits, 6);
}

#[tokio::test]
async fn test_unknown_professor_projects_nothing() {
    let h = Harness::new().await;
    let projection = build_enrollments(&h.relational, "stranger", &known(&[])).await;

    assert_eq!(projection.status, ProjectionStatus::NoIdentity);
    assert!(projection.enrolls.is_empty());
    assert!(projection.enrolled_ids.is_empty());
}

#[tokio::test]
async fn test_one_failed_course_empties_the_whole_projection() {
    let h = Harness::new().await;
    let (_, courses) = h.professor_with_courses("prof-1", &["CS101", "MA200"]).await;
    h.enroll(courses[0], &["001"]).await;
    h.enroll(courses[1], &["002"]).await;

    let flaky = FlakyRelational::new(h.relational.clone());
    flaky.fail_course(courses[1]);

    let projection = build_enrollments(&flaky, "prof-1", &known(&["CS101", "MA200"])).await;

    match &projection.status {
        ProjectionStatus::Failed { class, .. } => assert_eq!(*class, ErrorClass::Transient),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(projection.enrolls.is_empty(), "never partially populated");
    assert!(projection.enrolled_ids.is_empty());
}

#[tokio::test]
async fn test_professor_without_courses_is_complete_and_empty() {
    let h = Harness::new().await;
    h.professor_with_courses("prof-1", &[]).await;

    let projection = build_enrollments(&h.relational, "prof-1", &known(&["MAT101"])).await;
    assert!(projection.is_complete());
    assert!(projection.enrolls.is_empty());
}
