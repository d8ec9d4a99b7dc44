//! Dashboard snapshot model
//!
//! The snapshot is the denormalized per-professor aggregate stored as one
//! document in the cache. Field names follow the camelCase document layout so
//! documents written by other clients decode unchanged.

use crate::ids::{deserialize_enroll_map, EnrollmentMap, StudentId, SubjectCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current document schema version written by this crate
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

/// Cache collection holding professor dashboards
pub const DASHBOARD_COLLECTION: &str = "dashboards";

/// Roster entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: StudentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub archived_subjects: BTreeSet<SubjectCode>,
}

impl Student {
    pub fn new(id: StudentId, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            archived_subjects: BTreeSet::new(),
        }
    }

    pub fn is_archived_in(&self, subject: &str) -> bool {
        self.archived_subjects.contains(subject)
    }
}

/// Subject (course) as projected into the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub code: SubjectCode,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub credits: u32,
    #[serde(default)]
    pub term: String,
}

impl Subject {
    pub fn new(code: &str, name: &str, credits: u32, term: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            credits,
            term: term.to_string(),
        }
    }
}

/// Dashboard notification shown to the professor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student: Option<StudentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Attendance mark for one student on one date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceMark {
    Present,
    Absent,
    Late,
    Excused,
    #[serde(other)]
    Unknown,
}

/// date (YYYY-MM-DD) -> subject -> student -> mark
pub type AttendanceRecords =
    BTreeMap<String, BTreeMap<SubjectCode, BTreeMap<StudentId, AttendanceMark>>>;

/// subject -> student -> assessment -> score
pub type GradeBook = BTreeMap<SubjectCode, BTreeMap<StudentId, BTreeMap<String, f64>>>;

/// Full cached aggregate for one professor owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub removed_subjects: Vec<Subject>,
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(default, deserialize_with = "deserialize_enroll_map")]
    pub enrolls: EnrollmentMap,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub records: AttendanceRecords,
    #[serde(default)]
    pub grades: GradeBook,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_uid: String,
}

impl DashboardSnapshot {
    /// Seed document for a professor's first login
    ///
    /// A small fixed set of placeholder subjects, everything else empty.
    pub fn seeded(owner_uid: &str, now: DateTime<Utc>) -> Self {
        let subjects = vec![
            Subject::new("MAT101", "Mathematics I", 6, ""),
            Subject::new("PHY101", "Physics I", 6, ""),
            Subject::new("PRG101", "Programming I", 6, ""),
        ];
        let enrolls = subjects
            .iter()
            .map(|s| (s.code.clone(), BTreeSet::new()))
            .collect();

        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            subjects,
            removed_subjects: Vec::new(),
            students: Vec::new(),
            enrolls,
            alerts: Vec::new(),
            records: BTreeMap::new(),
            grades: BTreeMap::new(),
            updated_at: Some(now),
            owner_uid: owner_uid.to_string(),
        }
    }

    pub fn student(&self, id: &StudentId) -> Option<&Student> {
        self.students.iter().find(|s| &s.id == id)
    }

    pub fn student_mut(&mut self, id: &StudentId) -> Option<&mut Student> {
        self.students.iter_mut().find(|s| &s.id == id)
    }

    /// Roster ids as a set
    pub fn roster_ids(&self) -> BTreeSet<StudentId> {
        self.students.iter().map(|s| s.id.clone()).collect()
    }

    /// Enrolled ids that have no roster entry
    pub fn orphan_enrollments(&self) -> BTreeSet<StudentId> {
        let roster = self.roster_ids();
        self.enrolls
            .values()
            .flatten()
            .filter(|id| !roster.contains(*id))
            .cloned()
            .collect()
    }
}
