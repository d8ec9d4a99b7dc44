//! Relational projection of a professor's enrollments
//!
//! The store of record is authoritative: the map built here replaces any
//! cached enrollment map wholesale. A failure anywhere yields an empty map,
//! never a partially populated one.

use crate::error::{ErrorClass, StoreError};
use crate::store::RelationalStore;
use acad_common::db::{CourseRow, EnrollmentRow};
use acad_common::{EnrollmentMap, StudentId, Subject, SubjectCode};
use futures::future::join_all;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionStatus {
    Complete,
    /// No professor row for the uid
    NoIdentity,
    /// A relational call failed; the map is empty
    Failed { class: ErrorClass, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentProjection {
    pub enrolls: EnrollmentMap,
    /// Union of every projected enrollment set
    pub enrolled_ids: BTreeSet<StudentId>,
    /// Courses missing from the cached subject list
    pub new_subjects: Vec<Subject>,
    pub status: ProjectionStatus,
}

impl EnrollmentProjection {
    fn empty(status: ProjectionStatus) -> Self {
        Self {
            enrolls: EnrollmentMap::new(),
            enrolled_ids: BTreeSet::new(),
            new_subjects: Vec::new(),
            status,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ProjectionStatus::Complete
    }
}

/// Build the authoritative enrollment map for a professor
///
/// Course enrollment lists are fetched concurrently. Courses whose code is
/// not among `known_subjects` are still projected and reported in
/// `new_subjects`.
pub async fn build_enrollments(
    store: &dyn RelationalStore,
    professor_uid: &str,
    known_subjects: &BTreeSet<SubjectCode>,
) -> EnrollmentProjection {
    match try_build(store, professor_uid, known_subjects).await {
        Ok(projection) => projection,
        Err(e) => {
            warn!(
                professor_uid,
                error_class = %e.class(),
                error = %e,
                "Enrollment projection failed, projecting no enrollments"
            );
            EnrollmentProjection::empty(ProjectionStatus::Failed {
                class: e.class(),
                reason: e.to_string(),
            })
        }
    }
}

async fn try_build(
    store: &dyn RelationalStore,
    professor_uid: &str,
    known_subjects: &BTreeSet<SubjectCode>,
) -> Result<EnrollmentProjection, StoreError> {
    let Some(professor) = store.professor_by_uid(professor_uid).await? else {
        warn!(professor_uid, "No relational identity for professor");
        return Ok(EnrollmentProjection::empty(ProjectionStatus::NoIdentity));
    };

    let courses = store.list_courses_by_professor(professor.id).await?;

    let fetches = courses
        .iter()
        .map(|course| store.list_enrollments_by_course(course.id));
    let results: Vec<Result<Vec<EnrollmentRow>, StoreError>> = join_all(fetches).await;

    let mut enrolls = EnrollmentMap::new();
    let mut enrolled_ids = BTreeSet::new();
    let mut new_subjects = Vec::new();

    for (course, result) in courses.iter().zip(results) {
        let rows = result?;
        project_course(course, &rows, &mut enrolls, &mut enrolled_ids);

        if !known_subjects.contains(&course.code) {
            debug!(
                professor_uid,
                course = %course.code,
                "Projected course is not among the cached subjects"
            );
            new_subjects.push(Subject::new(
                &course.code,
                &course.name,
                u32::try_from(course.credits).unwrap_or(0),
                &course.term,
            ));
        }
    }

    info!(
        professor_uid,
        courses = courses.len(),
        students = enrolled_ids.len(),
        "Enrollment projection built"
    );

    Ok(EnrollmentProjection {
        enrolls,
        enrolled_ids,
        new_subjects,
        status: ProjectionStatus::Complete,
    })
}

fn project_course(
    course: &CourseRow,
    rows: &[EnrollmentRow],
    enrolls: &mut EnrollmentMap,
    enrolled_ids: &mut BTreeSet<StudentId>,
) {
    let members = enrolls.entry(course.code.clone()).or_default();
    for row in rows {
        let id = StudentId::new(&row.student_number);
        if id.is_empty() {
            continue;
        }
        members.insert(id.clone());
        enrolled_ids.insert(id);
    }
}
