//! Relational row types

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProfessorRow {
    pub id: i64,
    pub uid: String,
    pub name: String,
}

/// Student row; `student_number` is stored as entered and normalized on read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StudentRow {
    pub id: i64,
    pub student_number: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CourseRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub credits: i64,
    pub term: String,
    pub professor_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EnrollmentRow {
    pub id: i64,
    pub course_id: i64,
    pub student_number: String,
}
