//! Snapshot loading
//!
//! Session start sequence:
//! 1. Read the cached document; seed and persist a default when absent
//! 2. Migrate it, persisting only when the migration changed something;
//!    unmigratable documents take the seed path
//! 3. Repair archived enrollments, persisting immediately with `force_write`
//!    when anything was dropped
//! 4. Replace the enrollment map with the relational projection and append
//!    courses the cached subject list lacks
//! 5. Fill roster gaps from the relational student list
//!
//! A body that is not JSON, or a document with an unmigratable structure,
//! takes the seed path. A migrated object that still does not decode is an
//! error and is never overwritten. Every failure is caught here, logged with
//! its class, and reported as `None` ("retry later").

use crate::error::{Result, StoreError, SyncError};
use crate::migrate::{migrate, MigrationError};
use crate::projection::{build_enrollments, ProjectionStatus};
use crate::repair::repair_with_flag;
use crate::store::{DocumentCache, RelationalStore, WriteOptions};
use crate::writer::WriteQueue;
use acad_common::events::{EventBus, SyncEvent};
use acad_common::model::DASHBOARD_COLLECTION;
use acad_common::{DashboardSnapshot, Student, StudentId, SubjectCode};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SnapshotLoader {
    relational: Arc<dyn RelationalStore>,
    cache: Arc<dyn DocumentCache>,
    writer: WriteQueue,
    events: EventBus,
    retry_delay: Duration,
}

impl SnapshotLoader {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn DocumentCache>,
        writer: WriteQueue,
        events: EventBus,
        retry_delay: Duration,
    ) -> Self {
        Self {
            relational,
            cache,
            writer,
            events,
            retry_delay,
        }
    }

    /// Full load; `None` means "retry later"
    pub async fn load(&self, owner_uid: &str) -> Option<DashboardSnapshot> {
        match self.try_load(owner_uid).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(owner_uid, error_class = %e.class(), error = %e, "Snapshot load failed");
                None
            }
        }
    }

    /// [`SnapshotLoader::load`] with exactly one retry after the configured delay
    ///
    /// Gives up early when `cancel` fires.
    pub async fn load_with_retry(
        &self,
        owner_uid: &str,
        cancel: &CancellationToken,
    ) -> Option<DashboardSnapshot> {
        if let Some(snapshot) = self.load(owner_uid).await {
            return Some(snapshot);
        }

        info!(owner_uid, delay_ms = self.retry_delay.as_millis() as u64, "Retrying snapshot load");
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(owner_uid, "Load retry abandoned, session cancelled");
                return None;
            }
            _ = tokio::time::sleep(self.retry_delay) => {}
        }
        self.load(owner_uid).await
    }

    /// Re-run the authoritative rebuild against an in-memory snapshot
    ///
    /// No cache read and no seeding.
    pub async fn refresh(&self, current: &DashboardSnapshot) -> Option<DashboardSnapshot> {
        match self.reconcile(current.clone()).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(owner_uid = %current.owner_uid, error_class = %e.class(), error = %e, "Snapshot refresh failed");
                None
            }
        }
    }

    async fn try_load(&self, owner_uid: &str) -> Result<DashboardSnapshot> {
        let (mut snapshot, seeded) = match self.read_cached(owner_uid).await? {
            Some(snapshot) => (snapshot, false),
            None => (self.seed(owner_uid).await?, true),
        };

        if snapshot.owner_uid.is_empty() {
            snapshot.owner_uid = owner_uid.to_string();
        }

        let repair = repair_with_flag(&snapshot.enrolls, &snapshot.students);
        if repair.changed() {
            snapshot.enrolls = repair.enrolls;
            self.writer
                .write_snapshot(&snapshot, WriteOptions::forced())
                .await?;
            self.events.emit_lossy(SyncEvent::SnapshotRepaired {
                owner_uid: owner_uid.to_string(),
                dropped: repair.dropped,
                timestamp: Utc::now(),
            });
        }

        let snapshot = self.reconcile(snapshot).await?;

        info!(
            owner_uid,
            subjects = snapshot.subjects.len(),
            students = snapshot.students.len(),
            seeded,
            "Snapshot loaded"
        );
        self.events.emit_lossy(SyncEvent::SnapshotLoaded {
            owner_uid: owner_uid.to_string(),
            subjects: snapshot.subjects.len(),
            students: snapshot.students.len(),
            seeded,
            timestamp: Utc::now(),
        });
        Ok(snapshot)
    }

    /// Cached snapshot after migration; `None` when absent or unmigratable
    async fn read_cached(&self, owner_uid: &str) -> Result<Option<DashboardSnapshot>> {
        let raw = match self.cache.get(DASHBOARD_COLLECTION, owner_uid).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(owner_uid, "No cached snapshot");
                return Ok(None);
            }
            Err(StoreError::Shape(reason)) => {
                warn!(owner_uid, error_class = "shape", reason = %reason, "Cached body is not JSON, reseeding");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let migrated = match migrate(&raw) {
            Ok(migrated) => migrated,
            Err(MigrationError::Unmigratable(reason)) => {
                warn!(owner_uid, error_class = "shape", reason = %reason, "Cached snapshot unmigratable, reseeding");
                return Ok(None);
            }
        };

        // The stored object may still hold the roster; never seed over it
        let snapshot = serde_json::from_value::<DashboardSnapshot>(migrated.document.clone())
            .map_err(|e| SyncError::Unmigratable(e.to_string()))?;

        if migrated.changed {
            info!(owner_uid, "Persisting migrated snapshot");
            self.writer
                .submit(owner_uid, migrated.document, WriteOptions::replace())
                .await?;
        }

        Ok(Some(snapshot))
    }

    async fn seed(&self, owner_uid: &str) -> Result<DashboardSnapshot> {
        let snapshot = DashboardSnapshot::seeded(owner_uid, Utc::now());
        self.writer
            .write_snapshot(&snapshot, WriteOptions::replace())
            .await?;
        info!(owner_uid, "Seeded default snapshot");
        Ok(snapshot)
    }

    /// Authoritative rebuild: projection replaces enrollments, roster gaps
    /// are filled from the relational student list
    async fn reconcile(&self, mut snapshot: DashboardSnapshot) -> Result<DashboardSnapshot> {
        let owner_uid = snapshot.owner_uid.clone();
        let known: BTreeSet<SubjectCode> = snapshot.subjects.iter().map(|s| s.code.clone()).collect();

        let projection = build_enrollments(self.relational.as_ref(), &owner_uid, &known).await;
        if let ProjectionStatus::Failed { class, reason } = &projection.status {
            warn!(owner_uid = %owner_uid, error_class = %class, "Enrollments projected empty after failure");
            self.events.emit_lossy(SyncEvent::ProjectionFailed {
                owner_uid: owner_uid.clone(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
        }

        // Archive state lives only in the cache, so it is re-applied on top
        // of the authoritative map
        let repair = repair_with_flag(&projection.enrolls, &snapshot.students);
        if repair.changed() {
            debug!(owner_uid = %owner_uid, dropped = repair.dropped, "Archived enrollments withheld from projection");
        }
        snapshot.enrolls = repair.enrolls;

        if !projection.new_subjects.is_empty() {
            info!(owner_uid = %owner_uid, added = projection.new_subjects.len(), "Subjects added from store of record");
            snapshot.subjects.extend(projection.new_subjects.iter().cloned());
        }

        self.fill_roster_gaps(&mut snapshot, &projection.enrolled_ids).await?;
        Ok(snapshot)
    }

    async fn fill_roster_gaps(
        &self,
        snapshot: &mut DashboardSnapshot,
        enrolled_ids: &BTreeSet<StudentId>,
    ) -> Result<()> {
        let roster = snapshot.roster_ids();
        let mut gaps: BTreeSet<StudentId> = enrolled_ids.difference(&roster).cloned().collect();
        if gaps.is_empty() {
            return Ok(());
        }

        let rows = self.relational.list_students().await.map_err(SyncError::from)?;
        let mut appended = 0;
        for row in rows {
            let id = StudentId::new(&row.student_number);
            if gaps.remove(&id) {
                snapshot.students.push(Student::new(id, row.name, row.email));
                appended += 1;
            }
        }

        if appended > 0 {
            info!(owner_uid = %snapshot.owner_uid, appended, "Roster gaps filled from store of record");
        }
        let orphans = snapshot.orphan_enrollments();
        if !orphans.is_empty() {
            let unknown: Vec<&str> = orphans.iter().map(StudentId::as_str).collect();
            warn!(owner_uid = %snapshot.owner_uid, ?unknown, "Enrolled ids without a roster entry");
        }
        Ok(())
    }
}
