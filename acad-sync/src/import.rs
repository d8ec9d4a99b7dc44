//! Bulk import reconciliation
//!
//! Merges a parsed roster batch into the current roster and one subject's
//! enrollment set. Pure: the caller persists the result. Re-importing the
//! same batch is a no-op.

use acad_common::ids::renormalize_enroll_map;
use acad_common::{EnrollmentMap, Student, StudentId, SubjectCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

/// One parsed batch row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRow {
    #[serde(default, alias = "studentId", alias = "student_number")]
    pub id: StudentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl ImportRow {
    pub fn new(id: &str, name: &str, email: Option<&str>) -> Self {
        Self {
            id: StudentId::new(id),
            name: name.to_string(),
            email: email.map(str::to_string),
        }
    }
}

/// Import policy knobs taken from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPolicy {
    pub email_domain: String,
}

impl ImportPolicy {
    pub fn new(email_domain: impl Into<String>) -> Self {
        Self {
            email_domain: email_domain.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyId,
    EmptyName,
    NonNumericId(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::EmptyId => f.write_str("missing student id"),
            RejectReason::EmptyName => f.write_str("missing student name"),
            RejectReason::NonNumericId(id) => write!(f, "student id '{}' is not numeric", id),
        }
    }
}

/// Per-row result, in batch order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// New roster entry created and enrolled
    Added { id: StudentId },
    /// Existing student whose archive for the subject was lifted
    Reactivated { id: StudentId },
    /// Existing student newly enrolled
    Enrolled { id: StudentId },
    /// Later occurrence of an id already seen in this batch
    DuplicateInBatch { id: StudentId },
    AlreadyEnrolled { id: StudentId },
    Rejected { row: usize, reason: RejectReason },
}

impl RowOutcome {
    /// Id that ended up enrolled because of this row
    pub fn enrolled_id(&self) -> Option<&StudentId> {
        match self {
            RowOutcome::Added { id } | RowOutcome::Reactivated { id } | RowOutcome::Enrolled { id } => {
                Some(id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub reactivated: usize,
    pub enrolled: usize,
    pub skipped: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub students: Vec<Student>,
    pub enrolls: EnrollmentMap,
    pub rows: Vec<RowOutcome>,
}

impl ImportOutcome {
    pub fn summary(&self) -> ImportSummary {
        let mut summary = ImportSummary::default();
        for row in &self.rows {
            match row {
                RowOutcome::Added { .. } => summary.added += 1,
                RowOutcome::Reactivated { .. } => summary.reactivated += 1,
                RowOutcome::Enrolled { .. } => summary.enrolled += 1,
                RowOutcome::DuplicateInBatch { .. } | RowOutcome::AlreadyEnrolled { .. } => {
                    summary.skipped += 1
                }
                RowOutcome::Rejected { .. } => summary.rejected += 1,
            }
        }
        summary
    }

    /// Ids enrolled by this import
    pub fn enrolled_ids(&self) -> Vec<StudentId> {
        self.rows.iter().filter_map(RowOutcome::enrolled_id).cloned().collect()
    }
}

/// Merge a batch into the roster and the target subject's enrollments
pub fn merge_import(
    batch: &[ImportRow],
    students: &[Student],
    enrolls: &EnrollmentMap,
    target_subject: &str,
    policy: &ImportPolicy,
) -> ImportOutcome {
    let mut students = students.to_vec();
    let mut enrolls = renormalize_enroll_map(enrolls);
    let target: SubjectCode = target_subject.to_string();

    // First valid occurrence of each normalized id wins
    let mut claimed: HashSet<StudentId> = HashSet::new();

    let mut rows = Vec::with_capacity(batch.len());
    for (index, row) in batch.iter().enumerate() {
        let id = StudentId::new(row.id.as_str());
        let name = row.name.trim();

        if id.is_empty() {
            rows.push(RowOutcome::Rejected { row: index, reason: RejectReason::EmptyId });
            continue;
        }
        if name.is_empty() {
            rows.push(RowOutcome::Rejected { row: index, reason: RejectReason::EmptyName });
            continue;
        }
        if !id.is_numeric() {
            rows.push(RowOutcome::Rejected {
                row: index,
                reason: RejectReason::NonNumericId(id.to_string()),
            });
            continue;
        }
        if !claimed.insert(id.clone()) {
            rows.push(RowOutcome::DuplicateInBatch { id });
            continue;
        }

        let members = enrolls.entry(target.clone()).or_default();
        if members.contains(&id) {
            rows.push(RowOutcome::AlreadyEnrolled { id });
            continue;
        }

        let outcome = match students.iter_mut().find(|s| s.id == id) {
            Some(existing) => {
                if existing.archived_subjects.remove(&target) {
                    debug!(student = %id, subject = %target, "Unarchived on re-import");
                    RowOutcome::Reactivated { id: id.clone() }
                } else {
                    RowOutcome::Enrolled { id: id.clone() }
                }
            }
            None => {
                let email = match row.email.as_deref().map(str::trim) {
                    Some(email) if is_plausible_email(email) => email.to_string(),
                    _ => derive_email(name, &id, &policy.email_domain),
                };
                students.push(Student::new(id.clone(), name, email));
                RowOutcome::Added { id: id.clone() }
            }
        };

        members.insert(id);
        rows.push(outcome);
    }

    let outcome = ImportOutcome { students, enrolls, rows };
    let summary = outcome.summary();
    info!(
        subject = %target,
        added = summary.added,
        reactivated = summary.reactivated,
        enrolled = summary.enrolled,
        skipped = summary.skipped,
        rejected = summary.rejected,
        "Import batch merged"
    );
    outcome
}

/// Single `@`, non-empty local part, dotted domain, no whitespace
pub fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}

/// Deterministic institutional address from name and id
///
/// `"Bea Ruiz"`, `141715` -> `bea.ruiz.141715@<domain>`. Characters outside
/// ASCII letters and digits separate name parts.
pub fn derive_email(name: &str, id: &StudentId, domain: &str) -> String {
    let mut local: Vec<String> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    if !id.is_empty() {
        local.push(id.as_str().to_string());
    }
    if local.is_empty() {
        local.push("student".to_string());
    }
    format!("{}@{}", local.join("."), domain)
}
