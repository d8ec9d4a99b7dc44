//! Relational store of record
//!
//! The engine reads professors, courses, enrollments and students through
//! [`RelationalStore`]. Queries with no match return empty collections or
//! `None`; only real failures surface as [`StoreError`].

use crate::error::{StoreError, StoreResult};
use acad_common::db::{CourseRow, EnrollmentRow, ProfessorRow, StudentRow};
use acad_common::StudentId;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

/// Async access to the normalized tables
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Professor row for an authentication uid
    async fn professor_by_uid(&self, uid: &str) -> StoreResult<Option<ProfessorRow>>;

    async fn list_courses_by_professor(&self, professor_id: i64) -> StoreResult<Vec<CourseRow>>;

    async fn list_enrollments_by_course(&self, course_id: i64) -> StoreResult<Vec<EnrollmentRow>>;

    /// Student row by normalized student number
    async fn get_student_by_numerical_id(&self, id: &StudentId) -> StoreResult<Option<StudentRow>>;

    async fn list_students(&self) -> StoreResult<Vec<StudentRow>>;

    /// Insert a student, or refresh name and email of an existing one
    async fn upsert_student(&self, id: &StudentId, name: &str, email: &str) -> StoreResult<()>;

    /// Enroll ids in a course; already enrolled ids are ignored
    ///
    /// Returns the number of new enrollment rows.
    async fn enroll_students(&self, course_id: i64, ids: &[StudentId]) -> StoreResult<u64>;

    /// Remove enrollment rows; returns the number removed
    async fn unenroll_students(&self, course_id: i64, ids: &[StudentId]) -> StoreResult<u64>;
}

/// [`RelationalStore`] over the SQLite schema from `acad_common::db`
#[derive(Clone)]
pub struct SqliteRelationalStore {
    pool: SqlitePool,
}

impl SqliteRelationalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a professor; returns the row id (existing or new)
    pub async fn ensure_professor(&self, uid: &str, name: &str) -> StoreResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO professors (uid, name) VALUES (?, ?)")
            .bind(uid)
            .bind(name)
            .execute(&self.pool)
            .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM professors WHERE uid = ?")
            .bind(uid)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Create a course owned by a professor; returns the row id (existing or new)
    pub async fn ensure_course(
        &self,
        professor_id: i64,
        code: &str,
        name: &str,
        credits: i64,
        term: &str,
    ) -> StoreResult<i64> {
        sqlx::query(
            r#"
            INSERT INTO courses (code, name, credits, term, professor_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(professor_id, code) DO UPDATE SET
                name = excluded.name,
                credits = excluded.credits,
                term = excluded.term
            "#,
        )
        .bind(code)
        .bind(name)
        .bind(credits)
        .bind(term)
        .bind(professor_id)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM courses WHERE professor_id = ? AND code = ?")
            .bind(professor_id)
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn professor_by_uid(&self, uid: &str) -> StoreResult<Option<ProfessorRow>> {
        let row = sqlx::query_as::<_, ProfessorRow>(
            "SELECT id, uid, name FROM professors WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_courses_by_professor(&self, professor_id: i64) -> StoreResult<Vec<CourseRow>> {
        let rows = sqlx::query_as::<_, CourseRow>(
            r#"
            SELECT id, code, name, credits, term, professor_id
            FROM courses
            WHERE professor_id = ?
            ORDER BY code
            "#,
        )
        .bind(professor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_enrollments_by_course(&self, course_id: i64) -> StoreResult<Vec<EnrollmentRow>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(
            "SELECT id, course_id, student_number FROM enrollments WHERE course_id = ? ORDER BY id",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_student_by_numerical_id(&self, id: &StudentId) -> StoreResult<Option<StudentRow>> {
        // Stored numbers may carry padding from older imports
        let row = sqlx::query_as::<_, StudentRow>(
            "SELECT id, student_number, name, email FROM students WHERE TRIM(student_number) = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_students(&self) -> StoreResult<Vec<StudentRow>> {
        let rows = sqlx::query_as::<_, StudentRow>(
            "SELECT id, student_number, name, email FROM students ORDER BY student_number",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_student(&self, id: &StudentId, name: &str, email: &str) -> StoreResult<()> {
        if id.is_empty() {
            return Err(StoreError::Shape("empty student number".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO students (student_number, name, email)
            VALUES (?, ?, ?)
            ON CONFLICT(student_number) DO UPDATE SET
                name = excluded.name,
                email = excluded.email
            "#,
        )
        .bind(id.as_str())
        .bind(name)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enroll_students(&self, course_id: i64, ids: &[StudentId]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for id in ids.iter().filter(|id| !id.is_empty()) {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO enrollments (course_id, student_number) VALUES (?, ?)",
            )
            .bind(course_id)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        debug!(course_id, requested = ids.len(), inserted, "Enrollment rows written");
        Ok(inserted)
    }

    async fn unenroll_students(&self, course_id: i64, ids: &[StudentId]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query(
                "DELETE FROM enrollments WHERE course_id = ? AND TRIM(student_number) = ?",
            )
            .bind(course_id)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acad_common::db::init_relational_memory;

    async fn store() -> SqliteRelationalStore {
        SqliteRelationalStore::new(init_relational_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_unknown_professor_is_none() {
        let store = store().await;
        assert!(store.professor_by_uid("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_courses_and_enrollments_roundtrip() {
        let store = store().await;
        let prof = store.ensure_professor("prof-1", "Ada").await.unwrap();
        let course = store.ensure_course(prof, "CS101", "Intro", 6, "2025-1").await.unwrap();

        let added = store
            .enroll_students(course, &["001".into(), "002".into(), "001".into()])
            .await
            .unwrap();
        assert_eq!(added, 2);

        let courses = store.list_courses_by_professor(prof).await.unwrap();
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].code, "CS101");

        let rows = store.list_enrollments_by_course(course).await.unwrap();
        assert_eq!(rows.len(), 2);

        let removed = store.unenroll_students(course, &["002".into()]).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_student_lookup_ignores_padding() {
        let store = store().await;
        sqlx::query("INSERT INTO students (student_number, name) VALUES (' 141715 ', 'B')")
            .execute(store.pool())
            .await
            .unwrap();

        let found = store
            .get_student_by_numerical_id(&StudentId::from(141715u64))
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.name), Some("B".to_string()));
    }

    #[tokio::test]
    async fn test_upsert_student_rejects_empty_id() {
        let store = store().await;
        let err = store.upsert_student(&StudentId::default(), "X", "").await.unwrap_err();
        assert!(matches!(err, StoreError::Shape(_)));
    }
}
