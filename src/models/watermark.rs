//! Watermark value and timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Format a timestamp as fixed-width RFC 3339 UTC with microseconds.
///
/// Fixed width keeps lexicographic and chronological order identical, which
/// the watermark upsert and ad hoc SQL both rely on.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a source timestamp into UTC.
///
/// Accepts RFC 3339 (GitHub, GitLab) and Jira's `2024-01-15T10:30:00.000+0000`.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Boundary between synchronized and not-yet-synchronized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    /// Later of an optional previous watermark and the newest record seen.
    ///
    /// Never moves backwards; `None` when there is nothing to advance to.
    pub fn advance(previous: Option<Watermark>, seen: Option<DateTime<Utc>>) -> Option<Watermark> {
        match (previous, seen.map(Watermark)) {
            (Some(prev), Some(next)) => Some(prev.max(next)),
            (prev, next) => prev.or(next),
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_timestamp(self.0))
    }
}

impl std::str::FromStr for Watermark {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_timestamp(s)
            .map(Watermark)
            .ok_or_else(|| format!("invalid watermark timestamp: {}", s))
    }
}

impl Serialize for Watermark {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
