//! Record normalizer: raw JSON payloads to relational rows.
//!
//! Every mapping here is a pure function. Flattened key columns are read
//! through [`FieldReader`], which turns missing or null fields into `None`
//! and records a [`NormalizationWarning`] for fields of an unexpected type.
//! The full payload is always kept verbatim in the row's `raw` column.

pub mod github;
pub mod gitlab;
pub mod jira;

use crate::models::watermark::{format_timestamp, parse_timestamp};
use crate::models::{ChangelogRow, CommitRow, EntityType, IssueRow, PrCommitLinkRow, PullRequestRow};
use serde::Serialize;
use serde_json::Value;

/// Normalized rows of one pipeline, grouped per table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub pull_requests: Vec<PullRequestRow>,
    pub commits: Vec<CommitRow>,
    pub pr_commits: Vec<PrCommitLinkRow>,
    pub issues: Vec<IssueRow>,
    pub changelog: Vec<ChangelogRow>,
}

impl RowBatch {
    /// Append all rows of `other`, keeping their order.
    pub fn extend(&mut self, other: RowBatch) {
        self.pull_requests.extend(other.pull_requests);
        self.commits.extend(other.commits);
        self.pr_commits.extend(other.pr_commits);
        self.issues.extend(other.issues);
        self.changelog.extend(other.changelog);
    }

    /// Total number of rows across all tables.
    pub fn len(&self) -> usize {
        self.pull_requests.len()
            + self.commits.len()
            + self.pr_commits.len()
            + self.issues.len()
            + self.changelog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A field that could not be read as expected. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizationWarning {
    pub entity: EntityType,
    /// Natural key of the record, when known.
    pub record: Option<String>,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for NormalizationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: field '{}' {}",
            self.entity,
            self.record.as_deref().unwrap_or("<unknown>"),
            self.field,
            self.message
        )
    }
}

/// Output of normalizing one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub rows: RowBatch,
    pub warnings: Vec<NormalizationWarning>,
}

impl Normalized {
    pub fn extend(&mut self, other: Normalized) {
        self.rows.extend(other.rows);
        self.warnings.extend(other.warnings);
    }
}

/// Reads typed fields from a JSON record by dotted path.
///
/// Missing or null values (including a null parent object) read as `None`
/// silently; values of the wrong type read as `None` and push a warning.
pub struct FieldReader<'a> {
    record: &'a Value,
    entity: EntityType,
    key: Option<String>,
    warnings: &'a mut Vec<NormalizationWarning>,
}

impl<'a> FieldReader<'a> {
    pub fn new(
        record: &'a Value,
        entity: EntityType,
        warnings: &'a mut Vec<NormalizationWarning>,
    ) -> Self {
        Self {
            record,
            entity,
            key: None,
            warnings,
        }
    }

    /// Set the record key used in warnings.
    pub fn identify(&mut self, key: impl Into<String>) {
        self.key = Some(key.into());
    }

    pub fn warn(&mut self, field: &str, message: impl Into<String>) {
        let warning = NormalizationWarning {
            entity: self.entity,
            record: self.key.clone(),
            field: field.to_string(),
            message: message.into(),
        };
        log::warn!("Normalization: {}", warning);
        self.warnings.push(warning);
    }

    /// Resolve a dotted path; `None` for missing or null values.
    fn lookup(&mut self, path: &str) -> Option<&'a Value> {
        let mut current = self.record;
        for segment in path.split('.') {
            match current {
                Value::Object(map) => current = map.get(segment)?,
                Value::Null => return None,
                other => {
                    self.warn(path, format!("expected an object, found {}", type_name(other)));
                    return None;
                }
            }
        }

        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// A string field.
    pub fn str(&mut self, path: &str) -> Option<String> {
        match self.lookup(path)? {
            Value::String(s) => Some(s.clone()),
            other => {
                self.warn(path, format!("expected a string, found {}", type_name(other)));
                None
            }
        }
    }

    /// An integer field; numeric strings are accepted.
    pub fn int(&mut self, path: &str) -> Option<i64> {
        match self.lookup(path)? {
            Value::Number(n) if n.is_i64() => n.as_i64(),
            Value::String(s) if s.parse::<i64>().is_ok() => s.parse().ok(),
            other => {
                self.warn(path, format!("expected an integer, found {}", type_name(other)));
                None
            }
        }
    }

    /// An identifier that sources send either as a number or a string.
    pub fn id(&mut self, path: &str) -> Option<String> {
        match self.lookup(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            other => {
                self.warn(path, format!("expected an identifier, found {}", type_name(other)));
                None
            }
        }
    }

    /// A timestamp, normalized to fixed-width RFC 3339 UTC.
    pub fn timestamp(&mut self, path: &str) -> Option<String> {
        let raw = self.str(path)?;
        match parse_timestamp(&raw) {
            Some(ts) => Some(format_timestamp(ts)),
            None => {
                self.warn(path, format!("unparseable timestamp '{}'", raw));
                None
            }
        }
    }

    /// A nested value re-serialized as JSON text.
    pub fn json(&mut self, path: &str) -> Option<String> {
        self.lookup(path).map(Value::to_string)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serialize a payload verbatim for the `raw` column.
pub fn raw_json(value: &Value) -> String {
    value.to_string()
}
