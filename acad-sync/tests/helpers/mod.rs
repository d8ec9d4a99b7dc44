//! Test Helper Utilities
//!
//! In-memory stores plus wrappers that inject failures or count writes.

#![allow(dead_code)]

use acad_common::config::SyncConfig;
use acad_common::db::{
    init_cache_memory, init_relational_memory, CourseRow, EnrollmentRow, ProfessorRow, StudentRow,
};
use acad_common::events::{EventBus, SyncEvent};
use acad_common::StudentId;
use acad_sync::error::{StoreError, StoreResult};
use acad_sync::store::{
    DocumentCache, PushEvent, RealtimeFlag, RelationalStore, SqliteDocumentCache,
    SqliteRelationalStore, WriteOptions,
};
use acad_sync::SessionContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Config with short timings so tests do not sleep for long
pub fn test_config() -> SyncConfig {
    SyncConfig {
        throttle_ms: 0,
        write_grace_ms: 0,
        retry_delay_ms: 10,
        ..SyncConfig::default()
    }
}

/// Both stores in memory, sharing one event bus
pub struct Harness {
    pub relational: SqliteRelationalStore,
    pub cache: SqliteDocumentCache,
    pub flag: RealtimeFlag,
    pub events: EventBus,
    pub config: SyncConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        let relational = SqliteRelationalStore::new(init_relational_memory().await.unwrap());
        let cache_pool = init_cache_memory().await.unwrap();
        Self {
            relational,
            cache: SqliteDocumentCache::new(cache_pool.clone()),
            flag: RealtimeFlag::new(cache_pool, Duration::from_secs(config.quota_cooldown_secs)),
            events: EventBus::new(config.event_capacity),
            config,
        }
    }

    pub fn context(&self) -> SessionContext {
        self.context_with(Arc::new(self.relational.clone()), Arc::new(self.cache.clone()))
    }

    pub fn context_with(
        &self,
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn DocumentCache>,
    ) -> SessionContext {
        SessionContext {
            relational,
            cache,
            flag: self.flag.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }

    /// Professor with one course per code; returns (professor id, course ids)
    pub async fn professor_with_courses(&self, uid: &str, codes: &[&str]) -> (i64, Vec<i64>) {
        let prof = self.relational.ensure_professor(uid, "Prof").await.unwrap();
        let mut ids = Vec::new();
        for code in codes {
            ids.push(
                self.relational
                    .ensure_course(prof, code, code, 6, "2025-1")
                    .await
                    .unwrap(),
            );
        }
        (prof, ids)
    }

    pub async fn enroll(&self, course_id: i64, ids: &[&str]) {
        let ids: Vec<StudentId> = ids.iter().map(|id| StudentId::from(*id)).collect();
        self.relational.enroll_students(course_id, &ids).await.unwrap();
    }

    pub async fn add_student(&self, id: &str, name: &str) {
        self.relational
            .upsert_student(&StudentId::from(id), name, &format!("{}@uni.edu", id))
            .await
            .unwrap();
    }

    pub async fn cached(&self, owner: &str) -> Option<Value> {
        self.cache.get("dashboards", owner).await.unwrap()
    }

    pub async fn put_cached(&self, owner: &str, doc: Value) {
        self.cache
            .set("dashboards", owner, &doc, WriteOptions::forced())
            .await
            .unwrap();
    }
}

/// Drain every event currently buffered
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Relational store that fails selected calls
pub struct FlakyRelational {
    pub inner: SqliteRelationalStore,
    /// Course ids whose enrollment fetch fails
    pub failing_courses: Mutex<HashSet<i64>>,
    /// Number of upcoming `list_students` calls that fail
    pub student_list_failures: AtomicUsize,
    pub professor_lookups: AtomicUsize,
}

impl FlakyRelational {
    pub fn new(inner: SqliteRelationalStore) -> Self {
        Self {
            inner,
            failing_courses: Mutex::new(HashSet::new()),
            student_list_failures: AtomicUsize::new(0),
            professor_lookups: AtomicUsize::new(0),
        }
    }

    pub fn fail_course(&self, course_id: i64) {
        self.failing_courses.lock().unwrap().insert(course_id);
    }

    pub fn fail_student_list(&self, times: usize) {
        self.student_list_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelationalStore for FlakyRelational {
    async fn professor_by_uid(&self, uid: &str) -> StoreResult<Option<ProfessorRow>> {
        self.professor_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.professor_by_uid(uid).await
    }

    async fn list_courses_by_professor(&self, professor_id: i64) -> StoreResult<Vec<CourseRow>> {
        self.inner.list_courses_by_professor(professor_id).await
    }

    async fn list_enrollments_by_course(&self, course_id: i64) -> StoreResult<Vec<EnrollmentRow>> {
        if self.failing_courses.lock().unwrap().contains(&course_id) {
            return Err(StoreError::Transient(format!("503 for course {}", course_id)));
        }
        self.inner.list_enrollments_by_course(course_id).await
    }

    async fn get_student_by_numerical_id(&self, id: &StudentId) -> StoreResult<Option<StudentRow>> {
        self.inner.get_student_by_numerical_id(id).await
    }

    async fn list_students(&self) -> StoreResult<Vec<StudentRow>> {
        let remaining = self.student_list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.student_list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("connection reset".into()));
        }
        self.inner.list_students().await
    }

    async fn upsert_student(&self, id: &StudentId, name: &str, email: &str) -> StoreResult<()> {
        self.inner.upsert_student(id, name, email).await
    }

    async fn enroll_students(&self, course_id: i64, ids: &[StudentId]) -> StoreResult<u64> {
        self.inner.enroll_students(course_id, ids).await
    }

    async fn unenroll_students(&self, course_id: i64, ids: &[StudentId]) -> StoreResult<u64> {
        self.inner.unenroll_students(course_id, ids).await
    }
}

/// Document cache that records every write it is asked to perform
pub struct CountingCache {
    pub inner: SqliteDocumentCache,
    pub writes: Mutex<Vec<(Value, WriteOptions)>>,
}

impl CountingCache {
    pub fn new(inner: SqliteDocumentCache) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn writes(&self) -> Vec<(Value, WriteOptions)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentCache for CountingCache {
    async fn get(&self, collection: &str, owner_id: &str) -> StoreResult<Option<Value>> {
        self.inner.get(collection, owner_id).await
    }

    async fn set(
        &self,
        collection: &str,
        owner_id: &str,
        document: &Value,
        options: WriteOptions,
    ) -> StoreResult<bool> {
        self.writes.lock().unwrap().push((document.clone(), options));
        self.inner.set(collection, owner_id, document, options).await
    }

    fn watch(&self, collection: &str, owner_id: &str) -> broadcast::Receiver<PushEvent> {
        self.inner.watch(collection, owner_id)
    }
}
