//! Jira issue and changelog rows.

use crate::services::merge::MergeRow;
use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, Sqlite};

/// A Jira issue as stored in `jira_issues`.
///
/// `fields` keeps the issue's `fields` object as JSON text so custom
/// fields stay queryable with `json_extract`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IssueRow {
    /// Issue key (e.g., "PROJ-123").
    pub key: String,
    pub id: Option<String>,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub issue_type: Option<String>,
    /// Assignee display name.
    pub assignee: Option<String>,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub fields: Option<String>,
    pub raw: String,
}

impl MergeRow for IssueRow {
    const TABLE: &'static str = "jira_issues";
    const COLUMNS: &'static [&'static str] = &[
        "key",
        "id",
        "summary",
        "status",
        "issue_type",
        "assignee",
        "created",
        "updated",
        "fields",
        "raw",
    ];
    const KEY: &'static [&'static str] = &["key"];
    const STAMPED: bool = true;

    type Key = String;

    fn natural_key(&self) -> Self::Key {
        self.key.clone()
    }

    fn bind_values<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.key.clone())
            .push_bind(self.id.clone())
            .push_bind(self.summary.clone())
            .push_bind(self.status.clone())
            .push_bind(self.issue_type.clone())
            .push_bind(self.assignee.clone())
            .push_bind(self.created.clone())
            .push_bind(self.updated.clone())
            .push_bind(self.fields.clone())
            .push_bind(self.raw.clone());
    }
}

/// One field change from an issue's history.
///
/// A history entry yields one row per change item, keyed by (history id,
/// item position). The same field may appear more than once in an entry,
/// e.g. two issue links added together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChangelogRow {
    /// History entry id.
    pub id: String,
    /// Position of the change item within its history entry.
    pub item_index: i64,
    /// Name of the changed field (e.g., "status", "assignee").
    pub field: String,
    pub issue_key: String,
    pub created: Option<String>,
    pub author_account_id: Option<String>,
    pub author_display_name: Option<String>,
    pub field_type: Option<String>,
    pub from_value: Option<String>,
    pub from_string: Option<String>,
    pub to_value: Option<String>,
    pub to_string: Option<String>,
    /// The history item this row was flattened from.
    pub raw: String,
}

impl MergeRow for ChangelogRow {
    const TABLE: &'static str = "jira_changelog";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "item_index",
        "field",
        "issue_key",
        "created",
        "author_account_id",
        "author_display_name",
        "field_type",
        "from_value",
        "from_string",
        "to_value",
        "to_string",
        "raw",
    ];
    const KEY: &'static [&'static str] = &["id", "item_index"];

    type Key = (String, i64);

    fn natural_key(&self) -> Self::Key {
        (self.id.clone(), self.item_index)
    }

    fn bind_values<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.item_index)
            .push_bind(self.field.clone())
            .push_bind(self.issue_key.clone())
            .push_bind(self.created.clone())
            .push_bind(self.author_account_id.clone())
            .push_bind(self.author_display_name.clone())
            .push_bind(self.field_type.clone())
            .push_bind(self.from_value.clone())
            .push_bind(self.from_string.clone())
            .push_bind(self.to_value.clone())
            .push_bind(self.to_string.clone())
            .push_bind(self.raw.clone());
    }
}
