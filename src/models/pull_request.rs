//! Pull request (GitHub) / merge request (GitLab) row.

use crate::services::merge::MergeRow;
use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, Sqlite};

/// A pull request as stored in `pull_requests`.
///
/// Timestamps are normalized RFC 3339 UTC strings; `raw` is the source
/// payload re-serialized verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PullRequestRow {
    /// Source system ("github" or "gitlab").
    pub provider: String,

    /// Repository path (e.g., "acme/api" or "group/project").
    pub repository: String,

    /// Repository-scoped number (GitHub `number`, GitLab `iid`).
    pub number: i64,

    /// Global identifier assigned by the source.
    pub source_id: Option<String>,

    pub title: Option<String>,

    /// Source state string ("open", "closed", "merged", "opened", ...).
    pub state: Option<String>,

    /// Author login / username.
    pub author: Option<String>,

    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,

    /// Web URL of the pull request.
    pub url: Option<String>,

    /// Raw source payload as JSON text.
    pub raw: String,
}

impl MergeRow for PullRequestRow {
    const TABLE: &'static str = "pull_requests";
    const COLUMNS: &'static [&'static str] = &[
        "provider",
        "repository",
        "number",
        "source_id",
        "title",
        "state",
        "author",
        "created_at",
        "updated_at",
        "closed_at",
        "merged_at",
        "url",
        "raw",
    ];
    const KEY: &'static [&'static str] = &["provider", "repository", "number"];
    const STAMPED: bool = true;

    type Key = (String, String, i64);

    fn natural_key(&self) -> Self::Key {
        (self.provider.clone(), self.repository.clone(), self.number)
    }

    fn bind_values<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.provider.clone())
            .push_bind(self.repository.clone())
            .push_bind(self.number)
            .push_bind(self.source_id.clone())
            .push_bind(self.title.clone())
            .push_bind(self.state.clone())
            .push_bind(self.author.clone())
            .push_bind(self.created_at.clone())
            .push_bind(self.updated_at.clone())
            .push_bind(self.closed_at.clone())
            .push_bind(self.merged_at.clone())
            .push_bind(self.url.clone())
            .push_bind(self.raw.clone());
    }
}
