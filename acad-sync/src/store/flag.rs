//! Realtime administrative switch
//!
//! Persisted in the cache database's `settings` table so a quota-triggered
//! disable survives restarts. The disable clears itself once the cooldown
//! has elapsed; a manual [`RealtimeFlag::clear`] lifts it at any time.

use crate::error::{StoreError, StoreResult};
use acad_common::time::elapsed_between;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const KEY_DISABLED: &str = "realtime_disabled";
const KEY_DISABLED_AT: &str = "realtime_disabled_at";
const KEY_REASON: &str = "realtime_disabled_reason";

/// Current state of the switch
#[derive(Debug, Clone, PartialEq)]
pub struct FlagStatus {
    pub disabled: bool,
    pub since: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct RealtimeFlag {
    pool: SqlitePool,
    cooldown: Duration,
}

impl RealtimeFlag {
    pub fn new(pool: SqlitePool, cooldown: Duration) -> Self {
        Self { pool, cooldown }
    }

    /// True while disabled and not yet past the cooldown
    ///
    /// An expired disable is cleared as a side effect. A disable without a
    /// timestamp (manual) never expires.
    pub async fn is_disabled(&self, now: DateTime<Utc>) -> StoreResult<bool> {
        let disabled = get_setting::<bool>(&self.pool, KEY_DISABLED).await?.unwrap_or(false);
        if !disabled {
            return Ok(false);
        }

        let since = get_setting::<DateTime<Utc>>(&self.pool, KEY_DISABLED_AT).await?;
        match since {
            Some(at) if elapsed_between(at, now) >= self.cooldown => {
                info!(disabled_at = %at, "Realtime cooldown elapsed, re-enabling");
                self.clear().await?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    pub async fn disable(&self, reason: &str, now: DateTime<Utc>) -> StoreResult<()> {
        set_setting(&self.pool, KEY_DISABLED, true).await?;
        set_setting(&self.pool, KEY_DISABLED_AT, now.to_rfc3339()).await?;
        set_setting(&self.pool, KEY_REASON, reason).await?;
        warn!(reason, "Realtime updates disabled");
        Ok(())
    }

    /// Disable until manually cleared
    pub async fn disable_manually(&self, reason: &str) -> StoreResult<()> {
        set_setting(&self.pool, KEY_DISABLED, true).await?;
        delete_setting(&self.pool, KEY_DISABLED_AT).await?;
        set_setting(&self.pool, KEY_REASON, reason).await?;
        info!(reason, "Realtime updates disabled manually");
        Ok(())
    }

    pub async fn clear(&self) -> StoreResult<()> {
        set_setting(&self.pool, KEY_DISABLED, false).await?;
        delete_setting(&self.pool, KEY_DISABLED_AT).await?;
        delete_setting(&self.pool, KEY_REASON).await?;
        Ok(())
    }

    pub async fn status(&self, now: DateTime<Utc>) -> StoreResult<FlagStatus> {
        let disabled = self.is_disabled(now).await?;
        if !disabled {
            return Ok(FlagStatus {
                disabled,
                since: None,
                reason: None,
            });
        }
        Ok(FlagStatus {
            disabled,
            since: get_setting(&self.pool, KEY_DISABLED_AT).await?,
            reason: get_setting(&self.pool, KEY_REASON).await?,
        })
    }
}

async fn get_setting<T: FromStr>(pool: &SqlitePool, key: &str) -> StoreResult<Option<T>> {
    let value: Option<Option<String>> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match value.flatten() {
        Some(s) => match s.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(StoreError::Shape(format!(
                "Failed to parse setting '{}' value: {}",
                key, s
            ))),
        },
        None => Ok(None),
    }
}

async fn set_setting<T: ToString>(pool: &SqlitePool, key: &str, value: T) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

async fn delete_setting(pool: &SqlitePool, key: &str) -> StoreResult<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}
