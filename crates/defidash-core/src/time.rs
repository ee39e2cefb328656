//! Timestamp encoding for persisted rows.
//!
//! Timestamps are stored as fixed-width RFC3339 text in UTC with millisecond
//! precision (`2024-03-19T13:02:00.000Z`). Fixed width means SQL string
//! comparison (`run_at <= ?`) orders rows chronologically.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_db(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
