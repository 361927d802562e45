//! Commit row and the pull request / commit junction row.

use crate::services::merge::MergeRow;
use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, Sqlite};

/// A commit as stored in `commits`, keyed by SHA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CommitRow {
    pub sha: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub authored_at: Option<String>,
    pub committer_name: Option<String>,
    pub committer_email: Option<String>,
    pub committed_at: Option<String>,
    pub message: Option<String>,
    pub url: Option<String>,
    pub raw: String,
}

impl MergeRow for CommitRow {
    const TABLE: &'static str = "commits";
    const COLUMNS: &'static [&'static str] = &[
        "sha",
        "author_name",
        "author_email",
        "authored_at",
        "committer_name",
        "committer_email",
        "committed_at",
        "message",
        "url",
        "raw",
    ];
    const KEY: &'static [&'static str] = &["sha"];
    const STAMPED: bool = true;

    type Key = String;

    fn natural_key(&self) -> Self::Key {
        self.sha.clone()
    }

    fn bind_values<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.sha.clone())
            .push_bind(self.author_name.clone())
            .push_bind(self.author_email.clone())
            .push_bind(self.authored_at.clone())
            .push_bind(self.committer_name.clone())
            .push_bind(self.committer_email.clone())
            .push_bind(self.committed_at.clone())
            .push_bind(self.message.clone())
            .push_bind(self.url.clone())
            .push_bind(self.raw.clone());
    }
}

/// Link between a pull request and one of its commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PrCommitLinkRow {
    pub provider: String,
    pub repository: String,
    pub pr_number: i64,
    pub sha: String,
}

impl MergeRow for PrCommitLinkRow {
    const TABLE: &'static str = "pr_commits";
    const COLUMNS: &'static [&'static str] = &["provider", "repository", "pr_number", "sha"];
    const KEY: &'static [&'static str] = &["provider", "repository", "pr_number", "sha"];

    type Key = (String, String, i64, String);

    fn natural_key(&self) -> Self::Key {
        (
            self.provider.clone(),
            self.repository.clone(),
            self.pr_number,
            self.sha.clone(),
        )
    }

    fn bind_values<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.provider.clone())
            .push_bind(self.repository.clone())
            .push_bind(self.pr_number)
            .push_bind(self.sha.clone());
    }
}
