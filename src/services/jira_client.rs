//! Jira REST API client.
//!
//! Issues are searched with JQL in ascending update order and paged with
//! `startAt`. Change history comes from `expand=changelog` on API v2 and
//! from the paginated `/issue/{key}/changelog` endpoint on API v3.

use crate::error::SyncError;
use crate::models::watermark::parse_timestamp;
use crate::models::{EntityType, ListingOrder};
use crate::services::http::{self, Auth};
use crate::services::normalizer::{jira, Normalized};
use crate::services::provider::{Page, PageQuery, RawPayload, SourceProvider};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

pub const SOURCE: &str = "jira";

/// JQL date literal format (minute precision).
const JQL_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// JQL dates are read in the Jira user's time zone; widen the lower bound
/// by this much and let the client-side cut-off enforce the exact bound.
const JQL_WINDOW_HOURS: i64 = 24;

/// Jira REST API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JiraApiVersion {
    V2,
    V3,
}

impl JiraApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2 => "2",
            Self::V3 => "3",
        }
    }
}

impl std::str::FromStr for JiraApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "2" => Ok(Self::V2),
            "3" => Ok(Self::V3),
            other => Err(format!("unsupported Jira API version: {}", other)),
        }
    }
}

/// Jira client configuration.
#[derive(Debug, Clone)]
pub struct JiraClientConfig {
    /// Site URL (e.g., `https://acme.atlassian.net`).
    pub base_url: String,

    /// Project key used in the JQL query.
    pub project_key: String,

    /// Account email and API token for basic auth; anonymous when absent.
    pub credentials: Option<(String, String)>,

    pub api_version: JiraApiVersion,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Page size for searches and changelog pages.
    pub max_results: u32,
}

impl Default for JiraClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project_key: String::new(),
            credentials: None,
            api_version: JiraApiVersion::V2,
            timeout_secs: 30,
            max_results: 100,
        }
    }
}

/// Quote a value as a JQL string literal.
fn jql_string(value: &str) -> String {
    let escaped = value.replace('\\', r"\\").replace('"', r#"\""#);
    format!(r#""{}""#, escaped)
}

/// Build the issue search JQL for a project, optionally bounded by `since`.
pub fn build_jql(project_key: &str, since: Option<DateTime<Utc>>) -> String {
    let project = jql_string(project_key);
    match since {
        Some(since) => {
            let bound = since - ChronoDuration::hours(JQL_WINDOW_HOURS);
            format!(
                r#"project = {} AND updated >= "{}" order by updated ASC"#,
                project,
                bound.format(JQL_DATE_FORMAT)
            )
        }
        None => format!("project = {} order by updated ASC", project),
    }
}

/// Offset of the next page of an offset-paginated response.
fn next_offset(body: &Value, returned: usize) -> Option<u32> {
    if returned == 0 || body.get("isLast").and_then(Value::as_bool) == Some(true) {
        return None;
    }

    let start = body.get("startAt").and_then(Value::as_u64).unwrap_or(0);
    let next = start + returned as u64;
    match body.get("total").and_then(Value::as_u64) {
        Some(total) if next >= total => None,
        _ => u32::try_from(next).ok(),
    }
}

/// Take the array under `field` out of a response object.
fn take_array(body: &mut Value, field: &str, endpoint: &str) -> Result<Vec<Value>, SyncError> {
    match body.get_mut(field).map(Value::take) {
        Some(Value::Array(values)) => Ok(values),
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(_) => Err(SyncError::permanent(format!(
            "Expected '{}' to be an array in response from {}",
            field, endpoint
        ))),
    }
}

/// Jira API client.
#[derive(Debug, Clone)]
pub struct JiraClient {
    client: Client,
    config: JiraClientConfig,
}

impl JiraClient {
    pub fn new(config: JiraClientConfig) -> Result<Self, SyncError> {
        let auth = match &config.credentials {
            Some((user, token)) => Auth::Basic {
                user: user.clone(),
                token: token.clone(),
            },
            None => {
                log::warn!("No Jira credentials provided, using anonymous access");
                Auth::None
            }
        };
        let client = http::build_client(&auth, Duration::from_secs(config.timeout_secs))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/rest/api/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version.as_str(),
            path
        )
    }

    /// One page of issues updated since `since` (widened), oldest first.
    pub async fn search_issues(
        &self,
        since: Option<DateTime<Utc>>,
        start_at: Option<u32>,
    ) -> Result<Page, SyncError> {
        let endpoint = "/search";
        let jql = build_jql(&self.config.project_key, since);
        log::info!("Fetching issues: {} | start: {}", jql, start_at.unwrap_or(0));

        let mut query = vec![
            ("jql", jql),
            ("startAt", start_at.unwrap_or(0).to_string()),
            ("maxResults", self.config.max_results.to_string()),
            ("fields", "*all".to_string()),
        ];
        if self.config.api_version == JiraApiVersion::V2 {
            query.push(("expand", "changelog".to_string()));
        }

        let (mut body, _) = http::get_json(&self.client, &self.api_url(endpoint), &query, endpoint).await?;
        let issues = take_array(&mut body, "issues", endpoint)?;
        let next = next_offset(&body, issues.len());

        Ok(Page {
            records: issues,
            next,
        })
    }

    /// One page of an issue's change history.
    pub async fn issue_changelog(&self, issue_key: &str, start_at: Option<u32>) -> Result<Page, SyncError> {
        match self.config.api_version {
            JiraApiVersion::V2 => {
                let endpoint = format!("/issue/{}", urlencoding::encode(issue_key));
                let query = [("expand", "changelog".to_string())];
                let (mut body, _) =
                    http::get_json(&self.client, &self.api_url(&endpoint), &query, &endpoint).await?;
                let mut changelog = body.get_mut("changelog").map(Value::take).unwrap_or(Value::Null);

                Ok(Page {
                    records: take_array(&mut changelog, "histories", &endpoint)?,
                    next: None,
                })
            }
            JiraApiVersion::V3 => {
                let endpoint = format!("/issue/{}/changelog", urlencoding::encode(issue_key));
                let query = [
                    ("startAt", start_at.unwrap_or(0).to_string()),
                    ("maxResults", self.config.max_results.to_string()),
                ];
                let (mut body, _) =
                    http::get_json(&self.client, &self.api_url(&endpoint), &query, &endpoint).await?;
                let values = take_array(&mut body, "values", &endpoint)?;
                let next = next_offset(&body, values.len());

                Ok(Page {
                    records: values,
                    next,
                })
            }
        }
    }
}

#[async_trait]
impl SourceProvider for JiraClient {
    fn source_id(&self) -> &str {
        SOURCE
    }

    fn scope(&self) -> &str {
        &self.config.project_key
    }

    fn root_entities(&self) -> &'static [EntityType] {
        &[EntityType::Issue]
    }

    fn listing_order(&self, _entity: EntityType) -> ListingOrder {
        ListingOrder::Ascending
    }

    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Page, SyncError> {
        match *query {
            PageQuery::Listing {
                entity: EntityType::Issue,
                since,
                page,
            } => self.search_issues(since, page).await,
            PageQuery::Children {
                entity: EntityType::ChangelogEntry,
                parent,
                page,
            } => {
                let key = parent
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SyncError::permanent("Issue payload without key"))?;
                self.issue_changelog(key, page).await
            }
            other => Err(SyncError::config(format!(
                "Jira does not provide {} records",
                other.entity()
            ))),
        }
    }

    fn updated_at(&self, _entity: EntityType, record: &Value) -> Option<DateTime<Utc>> {
        record
            .pointer("/fields/updated")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    fn child_entity(&self, entity: EntityType) -> Option<EntityType> {
        match entity {
            EntityType::Issue => Some(EntityType::ChangelogEntry),
            _ => None,
        }
    }

    /// Histories embedded by `expand=changelog`, when complete.
    fn inline_children(&self, _entity: EntityType, record: &Value) -> Option<Vec<Value>> {
        let changelog = record.get("changelog")?;
        let histories = changelog.get("histories")?.as_array()?;
        let total = changelog
            .get("total")
            .and_then(Value::as_u64)
            .unwrap_or(histories.len() as u64);

        // Truncated histories must be fetched separately
        (total <= histories.len() as u64).then(|| histories.clone())
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        jira::normalize_issue(&payload.body, &payload.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn client(version: JiraApiVersion) -> JiraClient {
        JiraClient::new(JiraClientConfig {
            base_url: "https://acme.atlassian.net/".to_string(),
            project_key: "PROJ".to_string(),
            credentials: Some(("me@example.com".to_string(), "token".to_string())),
            api_version: version,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_jql_without_watermark() {
        assert_eq!(build_jql("PROJ", None), r#"project = "PROJ" order by updated ASC"#);
    }

    #[test]
    fn test_jql_project_key_is_quoted() {
        assert_eq!(
            build_jql(r#"PROJ" OR project != "X"#, None),
            r#"project = "PROJ\" OR project != \"X" order by updated ASC"#
        );
        assert_eq!(
            build_jql(r"A\B", None),
            r#"project = "A\\B" order by updated ASC"#
        );
    }

    #[test]
    fn test_jql_bound_is_widened() {
        let since = Utc.with_ymd_and_hms(2024, 3, 2, 10, 15, 42).unwrap();
        assert_eq!(
            build_jql("PROJ", Some(since)),
            r#"project = "PROJ" AND updated >= "2024-03-01 10:15" order by updated ASC"#
        );
    }

    #[test]
    fn test_next_offset() {
        assert_eq!(next_offset(&json!({"startAt": 0, "total": 250}), 100), Some(100));
        assert_eq!(next_offset(&json!({"startAt": 200, "total": 250}), 50), None);
        assert_eq!(next_offset(&json!({"startAt": 0, "isLast": true}), 100), None);
        assert_eq!(next_offset(&json!({"startAt": 0, "total": 250}), 0), None);
    }

    #[test]
    fn test_api_url_includes_version() {
        assert_eq!(
            client(JiraApiVersion::V3).api_url("/search"),
            "https://acme.atlassian.net/rest/api/3/search"
        );
    }

    #[test]
    fn test_inline_histories_only_when_complete() {
        let jira = client(JiraApiVersion::V2);
        let complete = json!({"key": "PROJ-1", "changelog": {"total": 1, "histories": [{"id": "1"}]}});
        let truncated = json!({"key": "PROJ-2", "changelog": {"total": 150, "histories": [{"id": "1"}]}});

        assert_eq!(jira.inline_children(EntityType::Issue, &complete).map(|h| h.len()), Some(1));
        assert!(jira.inline_children(EntityType::Issue, &truncated).is_none());
        assert!(jira.inline_children(EntityType::Issue, &json!({"key": "PROJ-3"})).is_none());
    }

    #[test]
    fn test_updated_at_reads_jira_format() {
        let jira = client(JiraApiVersion::V2);
        let issue = json!({"fields": {"updated": "2024-03-02T10:15:00.000+0000"}});
        assert_eq!(
            jira.updated_at(EntityType::Issue, &issue),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 10, 15, 0).unwrap())
        );
    }
}
