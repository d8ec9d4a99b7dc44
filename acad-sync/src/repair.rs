//! Consistency repair
//!
//! Enforces the hard invariant that no student is enrolled in a subject they
//! have archived. Ids without a roster entry are left alone.

use acad_common::{EnrollmentMap, Student, StudentId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Result of a repair pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    pub enrolls: EnrollmentMap,
    /// Number of (subject, student) pairs dropped
    pub dropped: usize,
}

impl RepairOutcome {
    pub fn changed(&self) -> bool {
        self.dropped > 0
    }
}

/// Drop archived enrollments
pub fn repair(enrolls: &EnrollmentMap, students: &[Student]) -> EnrollmentMap {
    repair_with_flag(enrolls, students).enrolls
}

/// Drop archived enrollments and report how many were dropped
pub fn repair_with_flag(enrolls: &EnrollmentMap, students: &[Student]) -> RepairOutcome {
    let archived: BTreeMap<&StudentId, &BTreeSet<String>> = students
        .iter()
        .filter(|s| !s.archived_subjects.is_empty())
        .map(|s| (&s.id, &s.archived_subjects))
        .collect();

    let mut dropped = 0;
    let repaired = enrolls
        .iter()
        .map(|(code, ids)| {
            let kept: BTreeSet<StudentId> = ids
                .iter()
                .filter(|id| {
                    let is_archived = archived
                        .get(id)
                        .map(|subjects| subjects.contains(code))
                        .unwrap_or(false);
                    if is_archived {
                        warn!(subject = %code, student = %id, "Dropping enrollment in archived subject");
                        dropped += 1;
                    }
                    !is_archived
                })
                .cloned()
                .collect();
            (code.clone(), kept)
        })
        .collect();

    RepairOutcome {
        enrolls: repaired,
        dropped,
    }
}
