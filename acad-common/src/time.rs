//! Timestamp utilities

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

/// Attendance day key format
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Validate and canonicalize an attendance day key (`YYYY-MM-DD`)
pub fn parse_day(raw: &str) -> Result<String> {
    NaiveDate::parse_from_str(raw.trim(), DAY_FORMAT)
        .map(|d| d.format(DAY_FORMAT).to_string())
        .map_err(|e| Error::InvalidInput(format!("invalid attendance day {:?}: {}", raw, e)))
}

/// Time elapsed from `earlier` to `later`, zero if the clock went backwards
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
