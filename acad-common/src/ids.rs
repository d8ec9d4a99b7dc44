//! Student identifier normalization
//!
//! Every comparison between student identifiers in the workspace goes through
//! [`StudentId`], whose constructors always trim and stringify the raw value.
//! Raw identifiers arrive as padded strings, integers, floats or nulls
//! depending on which store or import produced them.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Natural key of a subject (course code), shared by both stores
pub type SubjectCode = String;

/// Subject code -> set of enrolled student ids
pub type EnrollmentMap = BTreeMap<SubjectCode, BTreeSet<StudentId>>;

/// Canonical student identifier
///
/// Two raw representations are the same student iff their trimmed string
/// forms are equal. The empty id stands for "no identity".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StudentId(String);

impl StudentId {
    /// Normalize a raw textual identifier
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Import validity policy: purely numeric identifiers only.
    ///
    /// Legacy alphanumeric ids and decimal renderings (`"1.0"`) are rejected.
    pub fn is_numeric(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StudentId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for StudentId {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<u64> for StudentId {
    fn from(raw: u64) -> Self {
        Self(raw.to_string())
    }
}

impl From<i64> for StudentId {
    fn from(raw: i64) -> Self {
        Self(raw.to_string())
    }
}

impl From<&Value> for StudentId {
    fn from(raw: &Value) -> Self {
        normalize_id(raw)
    }
}

impl Serialize for StudentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StudentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StudentIdVisitor)
    }
}

struct StudentIdVisitor;

impl<'de> Visitor<'de> for StudentIdVisitor {
    type Value = StudentId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a student identifier (string, number or null)")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<StudentId, E> {
        Ok(StudentId::new(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<StudentId, E> {
        Ok(StudentId::new(&v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<StudentId, E> {
        Ok(StudentId::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<StudentId, E> {
        Ok(StudentId::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<StudentId, E> {
        Ok(StudentId(format_float(v)))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<StudentId, E> {
        Ok(StudentId(v.to_string()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<StudentId, E> {
        Ok(StudentId::default())
    }

    fn visit_none<E: de::Error>(self) -> Result<StudentId, E> {
        Ok(StudentId::default())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<StudentId, D::Error> {
        deserializer.deserialize_any(StudentIdVisitor)
    }
}

/// Integral floats render without a fractional part (`141715.0` -> `"141715"`).
fn format_float(v: f64) -> String {
    if v.is_finite() {
        format!("{}", v)
    } else {
        String::new()
    }
}

/// Normalize any raw JSON identifier
///
/// Total: null, arrays and objects carry no usable identity and map to the
/// empty id. Never panics.
pub fn normalize_id(value: &Value) -> StudentId {
    match value {
        Value::Null => StudentId::default(),
        Value::String(s) => StudentId::new(s),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                StudentId::from(u)
            } else if let Some(i) = n.as_i64() {
                StudentId::from(i)
            } else {
                StudentId(n.as_f64().map(format_float).unwrap_or_default())
            }
        }
        Value::Bool(b) => StudentId(b.to_string()),
        Value::Array(_) | Value::Object(_) => StudentId::default(),
    }
}

/// Normalize a raw enrollment map
///
/// Entries are normalized, empty ids dropped and duplicates collapsed. Every
/// subject key present in the input is present in the output, even when no
/// id survives.
pub fn normalize_enroll_map<'a, I>(raw: I) -> EnrollmentMap
where
    I: IntoIterator<Item = (&'a String, &'a Vec<Value>)>,
{
    raw.into_iter()
        .map(|(code, ids)| {
            let set = ids
                .iter()
                .map(normalize_id)
                .filter(|id| !id.is_empty())
                .collect();
            (code.clone(), set)
        })
        .collect()
}

/// Re-run normalization over an already typed map
pub fn renormalize_enroll_map(map: &EnrollmentMap) -> EnrollmentMap {
    map.iter()
        .map(|(code, ids)| {
            let set = ids
                .iter()
                .map(|id| StudentId::new(id.as_str()))
                .filter(|id| !id.is_empty())
                .collect();
            (code.clone(), set)
        })
        .collect()
}

/// `deserialize_with` helper: typed enrollment map with empty ids dropped
pub fn deserialize_enroll_map<'de, D>(deserializer: D) -> Result<EnrollmentMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<SubjectCode, Vec<StudentId>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(code, ids)| (code, ids.into_iter().filter(|id| !id.is_empty()).collect()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_trims_and_stringifies() {
        assert_eq!(normalize_id(&json!("  141715 ")).as_str(), "141715");
        assert_eq!(normalize_id(&json!(141715)).as_str(), "141715");
        assert_eq!(normalize_id(&json!(141715.0)).as_str(), "141715");
        assert_eq!(normalize_id(&json!(-4)).as_str(), "-4");
        assert_eq!(normalize_id(&json!(null)).as_str(), "");
        assert_eq!(normalize_id(&json!({"id": 1})).as_str(), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [json!(" 001 "), json!(12), json!(1.5), json!(null), json!("A-9 ")] {
            let once = normalize_id(&raw);
            let twice = normalize_id(&json!(once.as_str()));
            assert_eq!(once, twice, "raw value {raw}");
        }
    }

    #[test]
    fn test_padded_and_numeric_forms_compare_equal() {
        assert_eq!(StudentId::from(" 42"), StudentId::from(42u64));
        assert_ne!(StudentId::from("042"), StudentId::from(42u64));
    }

    #[test]
    fn test_numeric_policy() {
        assert!(StudentId::from("141715").is_numeric());
        assert!(!StudentId::from("1.0").is_numeric());
        assert!(!StudentId::from("A00123").is_numeric());
        assert!(!StudentId::from("").is_numeric());
    }

    #[test]
    fn test_enroll_map_dedups_and_keeps_keys() {
        let raw: BTreeMap<String, Vec<Value>> = serde_json::from_value(json!({
            "CS101": ["001", " 001", 2, null, ""],
            "MA200": [null]
        }))
        .unwrap();

        let map = normalize_enroll_map(&raw);
        assert_eq!(map.len(), 2);
        assert_eq!(map["CS101"].len(), 2);
        assert!(map["CS101"].contains(&StudentId::from("2")));
        assert!(map["MA200"].is_empty());
    }

    #[test]
    fn test_deserialize_accepts_mixed_id_types() {
        #[derive(Deserialize)]
        struct Doc {
            #[serde(deserialize_with = "deserialize_enroll_map")]
            enrolls: EnrollmentMap,
        }

        let doc: Doc = serde_json::from_value(json!({
            "enrolls": {"CS101": [" 7", 7, 8.0, null]}
        }))
        .unwrap();

        let ids: Vec<&str> = doc.enrolls["CS101"].iter().map(StudentId::as_str).collect();
        assert_eq!(ids, vec!["7", "8"]);
    }

    #[test]
    fn test_student_id_as_map_key() {
        let map: BTreeMap<StudentId, u8> =
            serde_json::from_value(json!({" 12 ": 1, "13": 2})).unwrap();
        assert!(map.contains_key(&StudentId::from("12")));
        assert_eq!(serde_json::to_value(&map).unwrap(), json!({"12": 1, "13": 2}));
    }
}
