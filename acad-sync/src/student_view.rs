//! Read-only projection for student clients

use acad_common::model::AttendanceMark;
use acad_common::{DashboardSnapshot, Student, StudentId, Subject, SubjectCode};
use serde::Serialize;
use std::collections::BTreeMap;

/// What one student may see of a professor's dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentView {
    pub profile: Student,
    /// Subjects the student is actively enrolled in
    pub subjects: Vec<Subject>,
    /// date -> subject -> mark
    pub attendance: BTreeMap<String, BTreeMap<SubjectCode, AttendanceMark>>,
    /// subject -> assessment -> score
    pub grades: BTreeMap<SubjectCode, BTreeMap<String, f64>>,
}

impl StudentView {
    /// `None` when the id has no roster entry
    pub fn project(snapshot: &DashboardSnapshot, student_id: &StudentId) -> Option<Self> {
        let id = StudentId::new(student_id.as_str());
        let profile = snapshot.student(&id)?.clone();

        let subjects: Vec<Subject> = snapshot
            .subjects
            .iter()
            .filter(|subject| !profile.is_archived_in(&subject.code))
            .filter(|subject| {
                snapshot
                    .enrolls
                    .get(&subject.code)
                    .map(|members| members.contains(&id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let active = |code: &str| subjects.iter().any(|s| s.code == code);

        let mut attendance = BTreeMap::new();
        for (day, by_subject) in &snapshot.records {
            let marks: BTreeMap<SubjectCode, AttendanceMark> = by_subject
                .iter()
                .filter(|(code, _)| active(code.as_str()))
                .filter_map(|(code, marks)| marks.get(&id).map(|mark| (code.clone(), *mark)))
                .collect();
            if !marks.is_empty() {
                attendance.insert(day.clone(), marks);
            }
        }

        let grades = snapshot
            .grades
            .iter()
            .filter(|(code, _)| active(code.as_str()))
            .filter_map(|(code, students)| students.get(&id).map(|scores| (code.clone(), scores.clone())))
            .collect();

        Some(Self {
            profile,
            subjects,
            attendance,
            grades,
        })
    }
}
