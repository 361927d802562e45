//! GitHub REST API client.
//!
//! Lists pull requests of one repository sorted by update time (newest
//! first) and the commits of each pull request. Pages are followed through
//! the `Link: <...>; rel="next"` response header.

use crate::error::SyncError;
use crate::models::watermark::parse_timestamp;
use crate::models::{EntityType, ListingOrder};
use crate::services::http::{self, Auth};
use crate::services::normalizer::{github, Normalized};
use crate::services::provider::{Page, PageQuery, RawPayload, SourceProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

/// GitHub API client configuration.
#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    /// API root (`https://api.github.com`, or `https://host/api/v3` for GHES).
    pub api_url: String,

    /// Token sent as a bearer credential.
    pub token: String,

    /// Repository as `owner/name`.
    pub repo: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Page size requested from the API (max 100).
    pub per_page: u32,
}

impl Default for GitHubClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: String::new(),
            repo: String::new(),
            timeout_secs: 30,
            per_page: 100,
        }
    }
}

/// Page number of the `rel="next"` link, if any.
pub fn next_page_from_link(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;

    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }

        let url = Url::parse(target.trim().trim_start_matches('<').trim_end_matches('>')).ok()?;
        url.query_pairs()
            .find(|(name, _)| name == "page")
            .and_then(|(_, value)| value.parse().ok())
    })
}

/// GitHub API client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    config: GitHubClientConfig,
}

impl GitHubClient {
    pub fn new(config: GitHubClientConfig) -> Result<Self, SyncError> {
        let client = http::build_client(
            &Auth::Bearer(config.token.clone()),
            Duration::from_secs(config.timeout_secs),
        )?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn get_page(&self, endpoint: &str, mut query: Vec<(&str, String)>, page: Option<u32>) -> Result<Page, SyncError> {
        query.push(("per_page", self.config.per_page.to_string()));
        query.push(("page", page.unwrap_or(1).to_string()));

        let (body, headers) = http::get_json(&self.client, &self.api_url(endpoint), &query, endpoint).await?;

        Ok(Page {
            records: http::into_records(body, endpoint)?,
            next: next_page_from_link(&headers),
        })
    }

    /// One page of pull requests in any state, most recently updated first.
    ///
    /// The endpoint has no server-side `since` filter; the cut-off is left
    /// to the caller.
    pub async fn list_pull_requests(&self, page: Option<u32>) -> Result<Page, SyncError> {
        let endpoint = format!("/repos/{}/pulls", self.config.repo);
        let query = vec![
            ("state", "all".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "desc".to_string()),
        ];
        self.get_page(&endpoint, query, page).await
    }

    /// One page of the commits of a pull request.
    pub async fn list_pull_request_commits(&self, number: i64, page: Option<u32>) -> Result<Page, SyncError> {
        let endpoint = format!("/repos/{}/pulls/{}/commits", self.config.repo, number);
        self.get_page(&endpoint, Vec::new(), page).await
    }
}

#[async_trait]
impl SourceProvider for GitHubClient {
    fn source_id(&self) -> &str {
        github::PROVIDER
    }

    fn scope(&self) -> &str {
        &self.config.repo
    }

    fn root_entities(&self) -> &'static [EntityType] {
        &[EntityType::PullRequest]
    }

    fn listing_order(&self, _entity: EntityType) -> ListingOrder {
        ListingOrder::Descending
    }

    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Page, SyncError> {
        match *query {
            PageQuery::Listing {
                entity: EntityType::PullRequest,
                page,
                ..
            } => self.list_pull_requests(page).await,
            PageQuery::Children {
                entity: EntityType::Commit,
                parent,
                page,
            } => {
                let number = parent
                    .get("number")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| SyncError::permanent("Pull request payload without number"))?;
                self.list_pull_request_commits(number, page).await
            }
            other => Err(SyncError::config(format!(
                "GitHub does not provide {} records",
                other.entity()
            ))),
        }
    }

    fn updated_at(&self, _entity: EntityType, record: &Value) -> Option<DateTime<Utc>> {
        record
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    fn child_entity(&self, entity: EntityType) -> Option<EntityType> {
        match entity {
            EntityType::PullRequest => Some(EntityType::Commit),
            _ => None,
        }
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        github::normalize_pull_request(&self.config.repo, &payload.body, &payload.children)
    }
}
