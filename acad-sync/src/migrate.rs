//! Cached document migration
//!
//! Brings documents written by older clients to the current layout:
//! - `enrollments` renamed to `enrolls`, `attendance` renamed to `records`
//! - roster stored as an id-keyed object becomes an array
//! - subjects stored as bare codes become objects
//! - archive and enrollment sets stored as `{key: true}` objects become arrays
//! - boolean attendance marks become `present`/`absent`
//! - numeric grade strings become numbers
//! - null or non-text names, emails and terms become text
//! - credits stored as strings or floats become whole numbers
//! - epoch and `{seconds, nanoseconds}` timestamps become RFC 3339 strings;
//!   timestamps that cannot be read are dropped
//! - missing collections get empty defaults
//!
//! The transform is idempotent. Shapes it cannot interpret are reported as
//! [`MigrationError::Unmigratable`]; the loader treats those as absent.

use acad_common::model::SNAPSHOT_SCHEMA_VERSION;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Unmigratable document: {0}")]
    Unmigratable(String),
}

type MigrationResult<T> = std::result::Result<T, MigrationError>;

/// Migrated document plus whether it differs from the input
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub document: Value,
    pub changed: bool,
}

pub fn migrate(input: &Value) -> MigrationResult<Migrated> {
    let Value::Object(source) = input else {
        return Err(unmigratable("document root is not an object"));
    };

    let mut doc = source.clone();

    rename_key(&mut doc, "enrollments", "enrolls");
    rename_key(&mut doc, "attendance", "records");
    rename_key(&mut doc, "removed", "removedSubjects");

    let students = migrate_students(doc.remove("students"))?;
    doc.insert("students".into(), students);

    for key in ["subjects", "removedSubjects"] {
        let subjects = migrate_subjects(key, doc.remove(key))?;
        doc.insert(key.into(), subjects);
    }

    let enrolls = migrate_enrolls(doc.remove("enrolls"))?;
    doc.insert("enrolls".into(), enrolls);

    let alerts = match doc.remove("alerts") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.into_iter().filter_map(migrate_alert).collect(),
        Some(_) => return Err(unmigratable("alerts is not an array")),
    };
    doc.insert("alerts".into(), Value::Array(alerts));

    let records = migrate_records(doc.remove("records"))?;
    doc.insert("records".into(), records);

    let grades = migrate_grades(doc.remove("grades"))?;
    doc.insert("grades".into(), grades);

    fix_timestamp(&mut doc, "updatedAt");
    if doc.get("ownerUid").is_some_and(|owner| !owner.is_string()) {
        // The loader fills a missing owner from the session
        doc.remove("ownerUid");
    }

    doc.insert("schemaVersion".into(), Value::from(SNAPSHOT_SCHEMA_VERSION));

    let document = Value::Object(doc);
    let changed = &document != input;
    if changed {
        debug!("Cached document migrated to schema version {}", SNAPSHOT_SCHEMA_VERSION);
    }
    Ok(Migrated { document, changed })
}

fn unmigratable(reason: &str) -> MigrationError {
    MigrationError::Unmigratable(reason.to_string())
}

fn rename_key(doc: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = doc.remove(from) {
        // The current key wins when both are present
        doc.entry(to.to_string()).or_insert(value);
    }
}

/// Array of keys from an array, or from the truthy entries of an object
fn key_list(value: Value, what: &str) -> MigrationResult<Vec<Value>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        Value::Object(entries) => Ok(entries
            .into_iter()
            .filter(|(_, flag)| is_truthy(flag))
            .map(|(key, _)| Value::String(key))
            .collect()),
        _ => Err(MigrationError::Unmigratable(format!("{} has unexpected type", what))),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn migrate_students(value: Option<Value>) -> MigrationResult<Value> {
    let entries: Vec<Value> = match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(Value::Object(by_id)) => by_id
            .into_iter()
            .map(|(key, mut student)| {
                if let Value::Object(fields) = &mut student {
                    fields.entry("id").or_insert(Value::String(key));
                }
                student
            })
            .collect(),
        Some(_) => return Err(unmigratable("students is neither an array nor an object")),
    };

    let mut students = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Object(mut fields) = entry else {
            return Err(unmigratable("roster entry is not an object"));
        };
        if !fields.contains_key("id") {
            return Err(unmigratable("roster entry has no id"));
        }
        rename_key(&mut fields, "archived", "archivedSubjects");
        let archived = key_list(
            fields.remove("archivedSubjects").unwrap_or(Value::Null),
            "archivedSubjects",
        )?;
        let archived = archived.into_iter().filter_map(code_text).collect();
        fields.insert("archivedSubjects".into(), Value::Array(archived));
        fix_text(&mut fields, "name");
        fix_text(&mut fields, "email");
        students.push(Value::Object(fields));
    }
    Ok(Value::Array(students))
}

fn migrate_subjects(key: &str, value: Option<Value>) -> MigrationResult<Value> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Value::Array(Vec::new())),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(MigrationError::Unmigratable(format!("{} is not an array", key))),
    };

    let mut subjects = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(code) => {
                let mut fields = Map::new();
                fields.insert("code".into(), Value::String(code.clone()));
                fields.insert("name".into(), Value::String(code));
                subjects.push(Value::Object(fields));
            }
            Value::Object(mut fields) => {
                rename_key(&mut fields, "id", "code");
                if !matches!(fields.get("code"), Some(Value::String(_))) {
                    return Err(MigrationError::Unmigratable(format!("{} entry has no code", key)));
                }
                fix_text(&mut fields, "name");
                fix_text(&mut fields, "term");
                fix_credits(&mut fields);
                subjects.push(Value::Object(fields));
            }
            _ => return Err(MigrationError::Unmigratable(format!("{} entry has unexpected type", key))),
        }
    }
    Ok(Value::Array(subjects))
}

fn migrate_enrolls(value: Option<Value>) -> MigrationResult<Value> {
    let by_subject = match value {
        None | Some(Value::Null) => return Ok(Value::Object(Map::new())),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(unmigratable("enrolls is not an object")),
    };

    let mut enrolls = Map::new();
    for (code, members) in by_subject {
        let ids = key_list(members, "enrollment set")?;
        enrolls.insert(code, Value::Array(ids));
    }
    Ok(Value::Object(enrolls))
}

fn migrate_records(value: Option<Value>) -> MigrationResult<Value> {
    let mut by_day = match value {
        None | Some(Value::Null) => return Ok(Value::Object(Map::new())),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(unmigratable("records is not an object")),
    };

    for subjects in by_day.values_mut() {
        let Value::Object(subjects) = subjects else {
            return Err(unmigratable("attendance day is not an object"));
        };
        for marks in subjects.values_mut() {
            let Value::Object(marks) = marks else {
                return Err(unmigratable("attendance subject is not an object"));
            };
            for mark in marks.values_mut() {
                if let Value::Bool(present) = *mark {
                    *mark = Value::String(if present { "present" } else { "absent" }.into());
                } else if !mark.is_string() {
                    *mark = Value::String("unknown".into());
                }
            }
        }
    }
    Ok(Value::Object(by_day))
}

fn migrate_grades(value: Option<Value>) -> MigrationResult<Value> {
    let mut by_subject = match value {
        None | Some(Value::Null) => return Ok(Value::Object(Map::new())),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(unmigratable("grades is not an object")),
    };

    for students in by_subject.values_mut() {
        let Value::Object(students) = students else {
            return Err(unmigratable("grade subject is not an object"));
        };
        for scores in students.values_mut() {
            let Value::Object(scores) = scores else {
                return Err(unmigratable("grade entry is not an object"));
            };
            scores.retain(|_, score| {
                if score.is_number() {
                    return true;
                }
                let parsed = score
                    .as_str()
                    .and_then(|text| text.trim().parse::<f64>().ok())
                    .filter(|parsed| parsed.is_finite());
                match parsed {
                    Some(parsed) => {
                        *score = Value::from(parsed);
                        true
                    }
                    None => false,
                }
            });
        }
    }
    Ok(Value::Object(by_subject))
}

/// Present but non-text values become text; null becomes `""`
fn fix_text(fields: &mut Map<String, Value>, key: &str) {
    let Some(value) = fields.get_mut(key) else {
        return;
    };
    let text = match value {
        Value::String(_) => return,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    };
    *value = Value::String(text);
}

/// Archived subject codes: text kept, numbers stringified, anything else dropped
fn code_text(value: Value) -> Option<Value> {
    match value {
        Value::String(code) => Some(Value::String(code)),
        Value::Number(n) => Some(Value::String(n.to_string())),
        _ => None,
    }
}

fn fix_credits(fields: &mut Map<String, Value>) {
    let Some(value) = fields.get_mut("credits") else {
        return;
    };
    if value.as_u64().is_some_and(|n| n <= u64::from(u32::MAX)) {
        return;
    }
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    let credits = parsed
        .filter(|c| c.is_finite() && *c >= 0.0 && *c <= f64::from(u32::MAX))
        .map(|c| c.round() as u32)
        .unwrap_or(0);
    *value = Value::from(credits);
}

fn migrate_alert(alert: Value) -> Option<Value> {
    let Value::Object(mut fields) = alert else {
        debug!("Dropping alert that is not an object");
        return None;
    };
    match fields.get("id") {
        Some(Value::String(_)) => {}
        Some(Value::Number(n)) => {
            let id = n.to_string();
            fields.insert("id".into(), Value::String(id));
        }
        _ => {
            debug!("Dropping alert without an id");
            return None;
        }
    }
    fix_text(&mut fields, "message");
    for key in ["subject", "student"] {
        if fields.get(key).is_some_and(|v| !v.is_string() && !v.is_null()) {
            fix_text(&mut fields, key);
        }
    }
    fix_timestamp(&mut fields, "createdAt");
    Some(Value::Object(fields))
}

/// Readable strings and nulls are left alone; epoch numbers and
/// `{seconds, nanoseconds}` objects become RFC 3339; anything else is dropped
fn fix_timestamp(fields: &mut Map<String, Value>, key: &str) {
    let converted = match fields.get(key) {
        None | Some(Value::Null) => return,
        Some(Value::String(text)) if DateTime::parse_from_rfc3339(text.trim()).is_ok() => return,
        Some(value) => timestamp_from(value),
    };
    match converted {
        Some(at) => {
            fields.insert(key.into(), Value::String(at.to_rfc3339()));
        }
        None => {
            debug!(key, "Dropping unreadable timestamp");
            fields.remove(key);
        }
    }
}

/// Epoch values at or above this are milliseconds, below it seconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn timestamp_from(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let epoch = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
                DateTime::<Utc>::from_timestamp_millis(epoch)
            } else {
                DateTime::<Utc>::from_timestamp(epoch, 0)
            }
        }
        Value::Object(parts) => {
            let seconds = parts
                .get("seconds")
                .or_else(|| parts.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = parts
                .get("nanoseconds")
                .or_else(|| parts.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0);
            DateTime::<Utc>::from_timestamp(seconds, nanos)
        }
        _ => None,
    }
}
