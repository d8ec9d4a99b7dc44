//! # Academic Dashboard Common Library
//!
//! Shared code for the sync engine and its tools:
//! - Error type and configuration loading
//! - Student identifier normalization
//! - Dashboard snapshot model (the cached document layout)
//! - Relational and cache database schemas
//! - Event types and the broadcast EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod time;

pub use error::{Error, Result};
pub use ids::{normalize_enroll_map, normalize_id, EnrollmentMap, StudentId, SubjectCode};
pub use model::{DashboardSnapshot, Student, Subject};
