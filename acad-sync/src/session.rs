//! Professor session
//!
//! Owns the current snapshot for one professor and is the single writer of
//! that professor's cached document. Mutations take the state lock, apply to
//! a copy, re-run the repair pass when enrollment or archive state changed,
//! write through the [`WriteQueue`] and only then commit the copy.

use crate::error::{Result, StoreError, SyncError};
use crate::import::{merge_import, ImportOutcome, ImportPolicy, ImportRow};
use crate::loader::SnapshotLoader;
use crate::notifier::{ChangeNotifier, WriteMarker};
use crate::repair::repair_with_flag;
use crate::store::{DocumentCache, RealtimeFlag, RelationalStore, WriteOptions};
use crate::writer::WriteQueue;
use acad_common::config::SyncConfig;
use acad_common::events::{EventBus, SyncEvent};
use acad_common::model::{Alert, AttendanceMark};
use acad_common::time::parse_day;
use acad_common::{DashboardSnapshot, StudentId};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Collaborators shared by every session of a process
#[derive(Clone)]
pub struct SessionContext {
    pub relational: Arc<dyn RelationalStore>,
    pub cache: Arc<dyn DocumentCache>,
    pub flag: RealtimeFlag,
    pub events: EventBus,
    pub config: SyncConfig,
}

pub struct ProfessorSession {
    owner_uid: String,
    state: Arc<RwLock<Option<DashboardSnapshot>>>,
    relational: Arc<dyn RelationalStore>,
    loader: SnapshotLoader,
    notifier: ChangeNotifier,
    writer: WriteQueue,
    policy: ImportPolicy,
    events: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProfessorSession {
    /// Create a session and start its write worker
    pub fn new(owner_uid: &str, ctx: SessionContext) -> Self {
        let cancel = CancellationToken::new();
        let marker = WriteMarker::new();
        let (writer, writer_task) = WriteQueue::spawn(
            ctx.cache.clone(),
            marker.clone(),
            ctx.events.clone(),
            ctx.config.write_queue_depth,
            cancel.child_token(),
        );

        let loader = SnapshotLoader::new(
            ctx.relational.clone(),
            ctx.cache.clone(),
            writer.clone(),
            ctx.events.clone(),
            ctx.config.retry_delay(),
        );
        let notifier = ChangeNotifier::new(
            ctx.cache.clone(),
            ctx.flag.clone(),
            marker,
            ctx.events.clone(),
            ctx.config.throttle(),
            ctx.config.write_grace(),
        );

        Self {
            owner_uid: owner_uid.to_string(),
            state: Arc::new(RwLock::new(None)),
            relational: ctx.relational,
            loader,
            notifier,
            writer,
            policy: ImportPolicy::new(ctx.config.student_email_domain.clone()),
            events: ctx.events,
            cancel,
            tasks: Mutex::new(vec![writer_task]),
        }
    }

    pub fn owner_uid(&self) -> &str {
        &self.owner_uid
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Copy of the committed snapshot
    pub async fn snapshot(&self) -> Option<DashboardSnapshot> {
        self.state.read().await.clone()
    }

    /// Load with one retry and commit the result
    ///
    /// A result arriving after [`ProfessorSession::close`] is discarded.
    pub async fn load(&self) -> Option<DashboardSnapshot> {
        if self.is_closed() {
            return None;
        }

        let loaded = tokio::select! {
            _ = self.cancel.cancelled() => None,
            loaded = self.loader.load_with_retry(&self.owner_uid, &self.cancel) => loaded,
        };
        self.commit_loaded(loaded).await
    }

    /// Re-run the authoritative rebuild on the committed snapshot
    pub async fn refresh(&self) -> Option<DashboardSnapshot> {
        let current = self.snapshot().await?;
        let refreshed = tokio::select! {
            _ = self.cancel.cancelled() => None,
            refreshed = self.loader.refresh(&current) => refreshed,
        };
        self.commit_loaded(refreshed).await
    }

    async fn commit_loaded(&self, loaded: Option<DashboardSnapshot>) -> Option<DashboardSnapshot> {
        let snapshot = loaded?;
        if self.is_closed() {
            debug!(owner_uid = %self.owner_uid, "Discarding load result, session closed");
            return None;
        }
        *self.state.write().await = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Apply a mutation and persist it through the write queue
    async fn mutate<T, F>(&self, touches_enrollments: bool, apply: F) -> Result<T>
    where
        F: FnOnce(&mut DashboardSnapshot) -> Result<T>,
    {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }

        let mut state = self.state.write().await;
        let current = state
            .as_ref()
            .ok_or_else(|| SyncError::NotLoaded(self.owner_uid.clone()))?;

        let mut next = current.clone();
        let value = apply(&mut next)?;

        if touches_enrollments {
            let repair = repair_with_flag(&next.enrolls, &next.students);
            if repair.changed() {
                next.enrolls = repair.enrolls;
                self.events.emit_lossy(SyncEvent::SnapshotRepaired {
                    owner_uid: self.owner_uid.clone(),
                    dropped: repair.dropped,
                    timestamp: Utc::now(),
                });
            }
        }
        next.updated_at = Some(Utc::now());

        self.writer.write_snapshot(&next, WriteOptions::replace()).await?;
        *state = Some(next);
        Ok(value)
    }

    /// Merge an import batch into one subject and persist roster and
    /// enrollments in the same write
    ///
    /// Newly enrolled students are mirrored to the store of record first, so
    /// the next authoritative rebuild keeps them.
    pub async fn import_batch(&self, subject: &str, batch: &[ImportRow]) -> Result<ImportOutcome> {
        let current = self
            .snapshot()
            .await
            .ok_or_else(|| SyncError::NotLoaded(self.owner_uid.clone()))?;

        let preview = merge_import(batch, &current.students, &current.enrolls, subject, &self.policy);
        let enrolled = preview.enrolled_ids();
        if !enrolled.is_empty() {
            self.mirror_enrollments(subject, &preview, &enrolled).await?;
        }

        let policy = self.policy.clone();
        let outcome = self
            .mutate(true, |snap| {
                let outcome = merge_import(batch, &snap.students, &snap.enrolls, subject, &policy);
                snap.students = outcome.students.clone();
                snap.enrolls = outcome.enrolls.clone();

                let rejected = outcome.summary().rejected;
                if rejected > 0 {
                    snap.alerts.push(Alert {
                        id: Uuid::new_v4().to_string(),
                        message: format!("{} import rows rejected for {}", rejected, subject),
                        subject: Some(subject.to_string()),
                        student: None,
                        created_at: Some(Utc::now()),
                    });
                }
                Ok(outcome)
            })
            .await?;

        let summary = outcome.summary();
        self.events.emit_lossy(SyncEvent::ImportCompleted {
            owner_uid: self.owner_uid.clone(),
            subject: subject.to_string(),
            added: summary.added,
            reactivated: summary.reactivated,
            skipped: summary.skipped,
            rejected: summary.rejected,
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }

    async fn mirror_enrollments(
        &self,
        subject: &str,
        preview: &ImportOutcome,
        enrolled: &[StudentId],
    ) -> Result<()> {
        let course_id = self.course_id(subject).await?;
        for id in enrolled {
            if let Some(student) = preview.students.iter().find(|s| &s.id == id) {
                self.relational
                    .upsert_student(id, &student.name, &student.email)
                    .await?;
            }
        }
        let inserted = self.relational.enroll_students(course_id, enrolled).await?;
        debug!(owner_uid = %self.owner_uid, subject, inserted, "Import mirrored to store of record");
        Ok(())
    }

    async fn course_id(&self, subject: &str) -> Result<i64> {
        let professor = self
            .relational
            .professor_by_uid(&self.owner_uid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("professor {}", self.owner_uid)))?;
        let courses = self.relational.list_courses_by_professor(professor.id).await?;
        courses
            .into_iter()
            .find(|c| c.code == subject)
            .map(|c| c.id)
            .ok_or_else(|| StoreError::NotFound(format!("course {}", subject)).into())
    }

    /// Archive a subject for a student; drops the enrollment
    pub async fn archive_student(&self, id: &StudentId, subject: &str) -> Result<()> {
        self.mutate(true, |snap| {
            let student = snap
                .student_mut(id)
                .ok_or_else(|| SyncError::InvalidInput(format!("unknown student {}", id)))?;
            student.archived_subjects.insert(subject.to_string());
            Ok(())
        })
        .await?;
        info!(owner_uid = %self.owner_uid, student = %id, subject, "Student archived");
        Ok(())
    }

    /// Lift an archive and re-enroll the student in the subject
    pub async fn unarchive_student(&self, id: &StudentId, subject: &str) -> Result<()> {
        self.mutate(true, |snap| {
            let student = snap
                .student_mut(id)
                .ok_or_else(|| SyncError::InvalidInput(format!("unknown student {}", id)))?;
            student.archived_subjects.remove(subject);
            snap.enrolls
                .entry(subject.to_string())
                .or_default()
                .insert(id.clone());
            Ok(())
        })
        .await?;
        info!(owner_uid = %self.owner_uid, student = %id, subject, "Student unarchived");
        Ok(())
    }

    /// Explicit bulk delete: roster entries, enrollments, attendance and grades
    ///
    /// Relational enrollment rows for the professor's courses go too.
    /// Returns the number of roster entries removed.
    pub async fn remove_students(&self, ids: &[StudentId]) -> Result<usize> {
        let doomed: BTreeSet<StudentId> = ids
            .iter()
            .map(|id| StudentId::new(id.as_str()))
            .filter(|id| !id.is_empty())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let doomed_list: Vec<StudentId> = doomed.iter().cloned().collect();
        match self.relational.professor_by_uid(&self.owner_uid).await? {
            Some(professor) => {
                for course in self.relational.list_courses_by_professor(professor.id).await? {
                    self.relational.unenroll_students(course.id, &doomed_list).await?;
                }
            }
            None => warn!(owner_uid = %self.owner_uid, "No relational identity, removing from cache only"),
        }

        let removed = self
            .mutate(true, |snap| {
                let before = snap.students.len();
                snap.students.retain(|s| !doomed.contains(&s.id));
                for members in snap.enrolls.values_mut() {
                    members.retain(|id| !doomed.contains(id));
                }
                for subjects in snap.records.values_mut() {
                    for marks in subjects.values_mut() {
                        marks.retain(|id, _| !doomed.contains(id));
                    }
                }
                for students in snap.grades.values_mut() {
                    students.retain(|id, _| !doomed.contains(id));
                }
                Ok(before - snap.students.len())
            })
            .await?;

        info!(owner_uid = %self.owner_uid, removed, "Students removed");
        Ok(removed)
    }

    /// Record one attendance mark; the student must be actively enrolled
    pub async fn record_attendance(
        &self,
        day: &str,
        subject: &str,
        id: &StudentId,
        mark: AttendanceMark,
    ) -> Result<()> {
        let day = parse_day(day)?;
        self.mutate(false, |snap| {
            ensure_enrolled(snap, subject, id)?;
            snap.records
                .entry(day)
                .or_default()
                .entry(subject.to_string())
                .or_default()
                .insert(id.clone(), mark);
            Ok(())
        })
        .await
    }

    /// Set one assessment score; the student must be actively enrolled
    pub async fn set_grade(&self, subject: &str, id: &StudentId, assessment: &str, score: f64) -> Result<()> {
        if !score.is_finite() {
            return Err(SyncError::InvalidInput(format!("score {} is not a number", score)));
        }
        let assessment = assessment.trim();
        if assessment.is_empty() {
            return Err(SyncError::InvalidInput("empty assessment name".to_string()));
        }

        self.mutate(false, |snap| {
            ensure_enrolled(snap, subject, id)?;
            snap.grades
                .entry(subject.to_string())
                .or_default()
                .entry(id.clone())
                .or_default()
                .insert(assessment.to_string(), score);
            Ok(())
        })
        .await
    }

    /// Subscribe to realtime changes and apply them to session state
    ///
    /// Returns `false` when realtime is disabled and nothing was attached.
    pub async fn watch(&self) -> bool {
        if self.is_closed() {
            return false;
        }

        let current = self.snapshot().await;
        let mut subscription = self.notifier.subscribe(&self.owner_uid, current.as_ref()).await;
        if subscription.is_inert() {
            return false;
        }

        let state = self.state.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let owner_uid = self.owner_uid.clone();

        let task = tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = subscription.recv() => payload,
                };
                let Some(payload) = payload else {
                    break;
                };

                let mut guard = state.write().await;
                if let Some(snapshot) = guard.as_mut() {
                    payload.apply_to(snapshot);
                    events.emit_lossy(SyncEvent::RealtimeUpdateApplied {
                        owner_uid: owner_uid.clone(),
                        timestamp: Utc::now(),
                    });
                    debug!(owner_uid = %owner_uid, "Realtime update applied");
                }
            }
            subscription.unsubscribe();
        });

        self.tasks.lock().await.push(task);
        true
    }

    /// Cancel in-flight loads, stop subscriptions and the write worker
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(owner_uid = %self.owner_uid, error = %e, "Session task ended abnormally");
            }
        }
        info!(owner_uid = %self.owner_uid, "Session closed");
    }
}

fn ensure_enrolled(snapshot: &DashboardSnapshot, subject: &str, id: &StudentId) -> Result<()> {
    let enrolled = snapshot
        .enrolls
        .get(subject)
        .map(|members| members.contains(id))
        .unwrap_or(false);
    if enrolled {
        Ok(())
    } else {
        Err(SyncError::InvalidInput(format!(
            "student {} is not enrolled in {}",
            id, subject
        )))
    }
}
