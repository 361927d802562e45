//! Entity types and listing order.

use serde::{Deserialize, Serialize};

/// Kind of record synchronized from a source.
///
/// `PullRequest` and `Issue` are root entity types: each has its own
/// pipeline and watermark. The others are fanned out of their root's
/// payloads and merged in the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    PullRequest,
    Commit,
    PrCommitLink,
    Issue,
    ChangelogEntry,
}

impl EntityType {
    /// Stable name used in watermark keys and the sync log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullRequest => "pull_request",
            Self::Commit => "commit",
            Self::PrCommitLink => "pr_commit",
            Self::Issue => "issue",
            Self::ChangelogEntry => "changelog_entry",
        }
    }

    /// Whether this entity type owns a pipeline and a watermark.
    pub fn is_root(&self) -> bool {
        matches!(self, Self::PullRequest | Self::Issue)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pull_request" | "pr" => Ok(Self::PullRequest),
            "commit" => Ok(Self::Commit),
            "pr_commit" => Ok(Self::PrCommitLink),
            "issue" => Ok(Self::Issue),
            "changelog_entry" | "changelog" => Ok(Self::ChangelogEntry),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// Order in which a source lists records by update time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrder {
    /// Newest first: the listing can be cut off once it falls behind `since`.
    Descending,
    /// Oldest first: every page may still hold new records.
    Ascending,
}
