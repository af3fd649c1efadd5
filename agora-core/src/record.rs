//! Semi-structured records shared by every collection.
//!
//! A record is a stable `key` plus an open map of fields. Only a handful of
//! fields carry meaning for the sync layer (identity, timestamps, threading);
//! everything else (`title`, `content`, `message`, `hashtags`, ...) is carried
//! through untouched.
//!
//! Shape validation is a predicate ([`Record::is_well_formed`]) rather than a
//! schema, so posts and nodes share one container without sharing all fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::directions::Directions;

/// Field names recognized by the sync layer.
pub mod field {
    pub const KEY: &str = "key";
    pub const USER: &str = "user";
    pub const USER_PUB: &str = "userPub";
    pub const USER_ID: &str = "userId";
    pub const USER_TYPE: &str = "userType";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DATE: &str = "date";
    pub const HEAD: &str = "head";
    pub const DIRECTIONS: &str = "directions";
    pub const UP_VOTES: &str = "upVotes";
    pub const DELETED_AT: &str = "deletedAt";
    pub const DELETED_BY: &str = "deletedBy";
    pub const DELETED_FROM: &str = "deletedFrom";
}

/// Which identity kind is authoritative for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    /// Authenticated by public key.
    Shogun,
    /// Weakly-trusted local display name.
    Guest,
    /// Written before `userType` existed.
    Legacy,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Shogun => "shogun",
            UserType::Guest => "guest",
            UserType::Legacy => "legacy",
        }
    }

    /// Unknown or missing values fall back to `Legacy`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("shogun") => UserType::Shogun,
            Some("guest") => UserType::Guest,
            _ => UserType::Legacy,
        }
    }
}

/// Generate a fresh creator-assigned record key.
pub fn new_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One entry of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Map::new(),
        }
    }

    /// Build from a raw store value. `None` if the value is not an object.
    ///
    /// A `key` field inside the value is ignored in favour of `key`.
    pub fn from_value(key: impl Into<String>, value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::from_fields(key, fields)),
            _ => None,
        }
    }

    pub fn from_fields(key: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        fields.remove(field::KEY);
        Self {
            key: key.into(),
            fields,
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        if name == field::KEY {
            return;
        }
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// String field, treating JSON `null` and non-strings as absent.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Whether `name` holds a non-blank string.
    pub fn has_text(&self, name: &str) -> bool {
        self.str_field(name).is_some_and(|s| !s.trim().is_empty())
    }

    /// The record as a store value, `key` included.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(field::KEY.to_string(), Value::String(self.key.clone()));
        Value::Object(map)
    }

    // ─── Recognized fields ──────────────────────────────────────

    pub fn user(&self) -> Option<&str> {
        self.str_field(field::USER).filter(|s| !s.is_empty())
    }

    pub fn user_pub(&self) -> Option<&str> {
        self.str_field(field::USER_PUB).filter(|s| !s.is_empty())
    }

    pub fn user_type(&self) -> UserType {
        UserType::parse(self.str_field(field::USER_TYPE))
    }

    /// Creation time: `timestamp`, falling back to legacy `date`.
    pub fn timestamp(&self) -> Option<i64> {
        self.fields
            .get(field::TIMESTAMP)
            .and_then(parse_millis)
            .or_else(|| self.fields.get(field::DATE).and_then(parse_millis))
    }

    /// Parent key for replies; `None` for top-level records.
    pub fn head(&self) -> Option<&str> {
        self.str_field(field::HEAD).filter(|s| !s.is_empty())
    }

    pub fn up_votes(&self) -> i64 {
        self.fields
            .get(field::UP_VOTES)
            .and_then(parse_millis)
            .unwrap_or(0)
    }

    /// Child index of a threaded node.
    pub fn directions(&self) -> Directions {
        Directions::from_value(self.fields.get(field::DIRECTIONS))
    }

    /// Basic shape check applied before a record reaches subscribers.
    ///
    /// With a `body_field`, the record must carry non-blank text there.
    pub fn is_well_formed(&self, body_field: Option<&str>) -> bool {
        match body_field {
            Some(body) => self.has_text(body),
            None => true,
        }
    }

    /// Newest first by `timestamp`/`date`; undated records last; key breaks ties.
    pub fn newest_first(a: &Record, b: &Record) -> Ordering {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.key.cmp(&b.key))
    }

    /// Oldest first; undated records first; key breaks ties.
    pub fn oldest_first(a: &Record, b: &Record) -> Ordering {
        a.timestamp()
            .cmp(&b.timestamp())
            .then_with(|| a.key.cmp(&b.key))
    }
}

/// Integer millis from a number or numeric string. Floats are truncated.
fn parse_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_object() {
        assert!(Record::from_value("k", json!("text")).is_none());
        assert!(Record::from_value("k", json!(null)).is_none());
        let record = Record::from_value("k", json!({"title": "Hi"})).unwrap();
        assert_eq!(record.key, "k");
        assert_eq!(record.str_field("title"), Some("Hi"));
    }

    #[test]
    fn test_key_argument_wins_over_embedded_key() {
        let record = Record::from_value("real", json!({"key": "stale", "title": "x"})).unwrap();
        assert_eq!(record.key, "real");
        assert!(record.get("key").is_none());
        assert_eq!(record.to_value()["key"], json!("real"));
    }

    #[test]
    fn test_timestamp_falls_back_to_date() {
        let modern = Record::new("a").with(field::TIMESTAMP, 20).with(field::DATE, 10);
        let legacy = Record::new("b").with(field::DATE, "15");
        let fractional = Record::new("c").with(field::TIMESTAMP, 12.9);
        assert_eq!(modern.timestamp(), Some(20));
        assert_eq!(legacy.timestamp(), Some(15));
        assert_eq!(fractional.timestamp(), Some(12));
        assert_eq!(Record::new("d").timestamp(), None);
    }

    #[test]
    fn test_well_formed_needs_body_text() {
        let record = Record::new("a").with("title", "  ");
        assert!(!record.is_well_formed(Some("title")));
        assert!(record.is_well_formed(None));
        assert!(Record::new("b").with("title", "Hi").is_well_formed(Some("title")));
        assert!(!Record::new("c").with("title", 3).is_well_formed(Some("title")));
    }

    #[test]
    fn test_newest_first_ordering() {
        let mut records = vec![
            Record::new("old").with(field::TIMESTAMP, 1),
            Record::new("undated"),
            Record::new("new").with(field::TIMESTAMP, 5),
            Record::new("legacy").with(field::DATE, 3),
        ];
        records.sort_by(Record::newest_first);
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["new", "legacy", "old", "undated"]);
    }

    #[test]
    fn test_user_type_parse() {
        assert_eq!(UserType::parse(Some("shogun")), UserType::Shogun);
        assert_eq!(UserType::parse(Some("guest")), UserType::Guest);
        assert_eq!(UserType::parse(Some("weird")), UserType::Legacy);
        assert_eq!(UserType::parse(None), UserType::Legacy);
    }

    #[test]
    fn test_serde_flattens_fields() {
        let record = Record::new("p1").with("title", "Hi");
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded, json!({"key": "p1", "title": "Hi"}));
        let decoded: Record = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_new_key_is_unique() {
        assert_ne!(new_key(), new_key());
    }
}
