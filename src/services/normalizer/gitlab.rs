//! GitLab merge request and commit mapping.

use super::{raw_json, FieldReader, Normalized};
use crate::models::{CommitRow, EntityType, PrCommitLinkRow, PullRequestRow};
use serde_json::Value;

pub const PROVIDER: &str = "gitlab";

/// Map one merge request and its commits.
///
/// Merge requests are keyed by their project-scoped `iid`.
pub fn normalize_merge_request(project: &str, mr: &Value, commits: &[Value]) -> Normalized {
    let mut out = Normalized::default();
    let mut reader = FieldReader::new(mr, EntityType::PullRequest, &mut out.warnings);

    let Some(iid) = reader.int("iid") else {
        reader.warn("iid", "missing natural key, record skipped");
        return out;
    };
    reader.identify(format!("{}!{}", project, iid));

    // Key by the full project path even when configured with a numeric id
    let repository = reader
        .str("references.full")
        .and_then(|full| full.rsplit_once('!').map(|(path, _)| path.to_string()))
        .unwrap_or_else(|| project.to_string());

    out.rows.pull_requests.push(PullRequestRow {
        provider: PROVIDER.to_string(),
        repository: repository.clone(),
        number: iid,
        source_id: reader.id("id"),
        title: reader.str("title"),
        state: reader.str("state"),
        author: reader.str("author.username"),
        created_at: reader.timestamp("created_at"),
        updated_at: reader.timestamp("updated_at"),
        closed_at: reader.timestamp("closed_at"),
        merged_at: reader.timestamp("merged_at"),
        url: reader.str("web_url"),
        raw: raw_json(mr),
    });

    for commit in commits {
        let mut reader = FieldReader::new(commit, EntityType::Commit, &mut out.warnings);
        let Some(sha) = reader.str("id") else {
            reader.warn("id", format!("missing natural key in {}!{}, commit skipped", repository, iid));
            continue;
        };
        reader.identify(sha.as_str());

        out.rows.commits.push(CommitRow {
            author_name: reader.str("author_name"),
            author_email: reader.str("author_email"),
            authored_at: reader.timestamp("authored_date"),
            committer_name: reader.str("committer_name"),
            committer_email: reader.str("committer_email"),
            committed_at: reader.timestamp("committed_date"),
            message: reader.str("message"),
            url: reader.str("web_url"),
            raw: raw_json(commit),
            sha: sha.clone(),
        });
        out.rows.pr_commits.push(PrCommitLinkRow {
            provider: PROVIDER.to_string(),
            repository: repository.clone(),
            pr_number: iid,
            sha,
        });
    }

    out
}
