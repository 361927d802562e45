//! GitHub pull request and commit mapping.

use super::{raw_json, FieldReader, Normalized};
use crate::models::{CommitRow, EntityType, PrCommitLinkRow, PullRequestRow};
use serde_json::Value;

pub const PROVIDER: &str = "github";

/// Map one pull request and its commits.
///
/// Yields the pull request row, one commit row per commit and one link row
/// per commit. A pull request without a readable `number` yields nothing.
pub fn normalize_pull_request(repository: &str, pr: &Value, commits: &[Value]) -> Normalized {
    let mut out = Normalized::default();
    let mut reader = FieldReader::new(pr, EntityType::PullRequest, &mut out.warnings);

    let Some(number) = reader.int("number") else {
        reader.warn("number", "missing natural key, record skipped");
        return out;
    };
    reader.identify(format!("{}#{}", repository, number));

    let row = PullRequestRow {
        provider: PROVIDER.to_string(),
        repository: repository.to_string(),
        number,
        source_id: reader.id("id"),
        title: reader.str("title"),
        state: reader.str("state"),
        author: reader.str("user.login"),
        created_at: reader.timestamp("created_at"),
        updated_at: reader.timestamp("updated_at"),
        closed_at: reader.timestamp("closed_at"),
        merged_at: reader.timestamp("merged_at"),
        url: reader.str("html_url"),
        raw: raw_json(pr),
    };
    out.rows.pull_requests.push(row);

    for commit in commits {
        let mut reader = FieldReader::new(commit, EntityType::Commit, &mut out.warnings);
        let Some(sha) = reader.str("sha") else {
            reader.warn("sha", format!("missing natural key in {}#{}, commit skipped", repository, number));
            continue;
        };
        reader.identify(sha.as_str());

        out.rows.commits.push(CommitRow {
            author_name: reader.str("commit.author.name"),
            author_email: reader.str("commit.author.email"),
            authored_at: reader.timestamp("commit.author.date"),
            committer_name: reader.str("commit.committer.name"),
            committer_email: reader.str("commit.committer.email"),
            committed_at: reader.timestamp("commit.committer.date"),
            message: reader.str("commit.message"),
            url: reader.str("html_url"),
            raw: raw_json(commit),
            sha: sha.clone(),
        });
        out.rows.pr_commits.push(PrCommitLinkRow {
            provider: PROVIDER.to_string(),
            repository: repository.to_string(),
            pr_number: number,
            sha,
        });
    }

    out
}
