//! Cached record data structures

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A record date as it appears on the wire: epoch milliseconds or an
/// ISO-8601-ish string. Normalized to an instant only for sorting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordDate {
    Millis(i64),
    Text(String),
}

impl RecordDate {
    /// Normalize to a comparable instant. `None` means the date failed to
    /// parse; such records sort as older than any parseable date.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            RecordDate::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            RecordDate::Text(s) => parse_instant(s),
        }
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// A remote record as cached locally.
///
/// Only `id` and `date` are inspected by the cache core; every other field
/// is opaque payload carried through unmodified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier within a category
    pub id: String,

    /// Record date, used only for sort order
    pub date: RecordDate,

    /// Opaque remainder of the remote payload
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Build a record with no extra payload (mostly for tests)
    pub fn new(id: impl Into<String>, date: RecordDate) -> Self {
        Self {
            id: id.into(),
            date,
            extra: serde_json::Map::new(),
        }
    }
}
