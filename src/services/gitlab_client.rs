//! GitLab API client.
//!
//! Lists merge requests of one project (newest update first) and the
//! commits of each merge request through the GitLab API v4, using the
//! `x-next-page` pagination headers.

use crate::error::SyncError;
use crate::models::{EntityType, ListingOrder};
use crate::services::http::{self, Auth};
use crate::services::normalizer::{gitlab, Normalized};
use crate::services::provider::{Page, PageQuery, RawPayload, SourceProvider};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Project id or full path (e.g., `group/project`).
    pub project: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Page size requested from the API.
    pub per_page: u32,
}

impl Default for GitLabClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gitlab.com".to_string(),
            token: String::new(),
            project: String::new(),
            timeout_secs: 30,
            per_page: 100,
        }
    }
}

/// Pagination information from GitLab API response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationInfo {
    /// Current page number.
    pub page: u32,

    /// Total number of pages, when the instance reports it.
    pub total_pages: Option<u32>,

    /// Next page number (if any).
    pub next_page: Option<u32>,
}

impl PaginationInfo {
    /// Parse pagination headers. `x-next-page` is empty on the last page.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get_header = |name: &str| -> Option<u32> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        };

        Self {
            page: get_header("x-page").unwrap_or(1),
            total_pages: get_header("x-total-pages"),
            next_page: get_header("x-next-page"),
        }
    }
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, SyncError> {
        let client = http::build_client(
            &Auth::PrivateToken(config.token.clone()),
            Duration::from_secs(config.timeout_secs),
        )?;

        Ok(Self { client, config })
    }

    /// Build the full API URL for a path.
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    /// Project segment of an endpoint; paths must be URL-encoded.
    fn project_path(&self) -> String {
        format!("/projects/{}", urlencoding::encode(&self.config.project))
    }

    async fn get_page(&self, endpoint: &str, mut query: Vec<(&str, String)>, page: Option<u32>) -> Result<Page, SyncError> {
        query.push(("page", page.unwrap_or(1).to_string()));
        query.push(("per_page", self.config.per_page.to_string()));

        let (body, headers) = http::get_json(&self.client, &self.api_url(endpoint), &query, endpoint).await?;
        let pagination = PaginationInfo::from_headers(&headers);

        Ok(Page {
            records: http::into_records(body, endpoint)?,
            next: pagination.next_page,
        })
    }

    /// One page of the project's merge requests, newest update first.
    pub async fn list_merge_requests(
        &self,
        updated_after: Option<DateTime<Utc>>,
        page: Option<u32>,
    ) -> Result<Page, SyncError> {
        let endpoint = format!("{}/merge_requests", self.project_path());
        let mut query = vec![
            ("state", "all".to_string()),
            ("order_by", "updated_at".to_string()),
            ("sort", "desc".to_string()),
        ];
        if let Some(since) = updated_after {
            query.push(("updated_after", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        self.get_page(&endpoint, query, page).await
    }

    /// One page of the commits of a merge request.
    pub async fn list_merge_request_commits(&self, iid: i64, page: Option<u32>) -> Result<Page, SyncError> {
        let endpoint = format!("{}/merge_requests/{}/commits", self.project_path(), iid);
        self.get_page(&endpoint, Vec::new(), page).await
    }
}

#[async_trait]
impl SourceProvider for GitLabClient {
    fn source_id(&self) -> &str {
        gitlab::PROVIDER
    }

    fn scope(&self) -> &str {
        &self.config.project
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
                since,
                page,
            } => self.list_merge_requests(since, page).await,
            PageQuery::Children {
                entity: EntityType::Commit,
                parent,
                page,
            } => {
                let iid = parent
                    .get("iid")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| SyncError::permanent("Merge request payload without iid"))?;
                self.list_merge_request_commits(iid, page).await
            }
            other => Err(SyncError::config(format!(
                "GitLab does not provide {} records",
                other.entity()
            ))),
        }
    }

    fn updated_at(&self, _entity: EntityType, record: &Value) -> Option<DateTime<Utc>> {
        record
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(crate::models::watermark::parse_timestamp)
    }

    fn child_entity(&self, entity: EntityType) -> Option<EntityType> {
        match entity {
            EntityType::PullRequest => Some(EntityType::Commit),
            _ => None,
        }
    }

    fn normalize(&self, payload: &RawPayload) -> Normalized {
        gitlab::normalize_merge_request(&self.config.project, &payload.body, &payload.children)
    }
}
