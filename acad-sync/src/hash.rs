//! Change digest over the identity fields of a snapshot
//!
//! Two snapshots with the same subjects, roster ids, archive sets,
//! enrollments, alert ids and owner hash equal. Names, emails, timestamps,
//! attendance and grades are not part of the digest.

use acad_common::DashboardSnapshot;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeHash([u8; 32]);

impl ChangeHash {
    pub fn of(snapshot: &DashboardSnapshot) -> Self {
        let mut hasher = Sha256::new();

        let subjects: BTreeSet<&str> = snapshot.subjects.iter().map(|s| s.code.as_str()).collect();
        section(&mut hasher, "subjects", subjects.len());
        for code in subjects {
            field(&mut hasher, code);
        }

        let removed: BTreeSet<&str> = snapshot
            .removed_subjects
            .iter()
            .map(|s| s.code.as_str())
            .collect();
        section(&mut hasher, "removed", removed.len());
        for code in removed {
            field(&mut hasher, code);
        }

        let mut students: Vec<_> = snapshot.students.iter().collect();
        students.sort_by(|a, b| a.id.cmp(&b.id));
        section(&mut hasher, "students", students.len());
        for student in students {
            field(&mut hasher, student.id.as_str());
            section(&mut hasher, "archived", student.archived_subjects.len());
            for code in &student.archived_subjects {
                field(&mut hasher, code);
            }
        }

        section(&mut hasher, "enrolls", snapshot.enrolls.len());
        for (code, ids) in &snapshot.enrolls {
            field(&mut hasher, code);
            section(&mut hasher, "members", ids.len());
            for id in ids {
                field(&mut hasher, id.as_str());
            }
        }

        let alerts: BTreeSet<&str> = snapshot.alerts.iter().map(|a| a.id.as_str()).collect();
        section(&mut hasher, "alerts", alerts.len());
        for id in alerts {
            field(&mut hasher, id);
        }

        section(&mut hasher, "owner", 1);
        field(&mut hasher, &snapshot.owner_uid);

        Self(hasher.finalize().into())
    }

}

impl fmt::Display for ChangeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

fn section(hasher: &mut Sha256, label: &str, count: usize) {
    hasher.update(label.as_bytes());
    hasher.update((count as u64).to_le_bytes());
}

// Length prefix keeps ["ab","c"] distinct from ["a","bc"]
fn field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
