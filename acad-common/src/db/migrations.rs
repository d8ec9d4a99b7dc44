//! Relational schema migrations
//!
//! Versioned, idempotent upgrades for relational databases created by older
//! builds. Fresh databases are created with the latest table layout, so every
//! migration checks before altering anything.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations**
//! 2. **Always add new migrations** with the next version number
//! 3. **Use ALTER TABLE** - prefer it over DROP/CREATE to preserve data

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Get current schema version from database (0 when never migrated)
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        migrate_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    info!("All migrations completed successfully");
    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Migration v1: courses gained a `term` column
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    if has_column(pool, "courses", "term").await? {
        return Ok(());
    }

    sqlx::query("ALTER TABLE courses ADD COLUMN term TEXT NOT NULL DEFAULT ''")
        .execute(pool)
        .await?;
    info!("Migration v1: added term column to courses");
    Ok(())
}

/// Migration v2: students gained an `email` column
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    if has_column(pool, "students", "email").await? {
        return Ok(());
    }

    sqlx::query("ALTER TABLE students ADD COLUMN email TEXT NOT NULL DEFAULT ''")
        .execute(pool)
        .await?;
    info!("Migration v2: added email column to students");
    Ok(())
}

/// Migration v3: lookup index for "which courses is this student in"
async fn migrate_v3(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_number)",
    )
    .execute(pool)
    .await?;
    info!("Migration v3: ensured enrollments(student_number) index");
    Ok(())
}
