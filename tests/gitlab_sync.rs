//! GitLab merge request sync against a mock API server.
//!
//! The mock serves two pages of merge requests (3 MRs) through the
//! `x-next-page` headers, filters them by `updated_after` the way the API
//! does, and answers the first commit listing of MR !4 with a 503.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use delivery_sync_lib::db::{self, pool::DbPool, watermarks};
use delivery_sync_lib::models::EntityType;
use delivery_sync_lib::services::fetcher::FetchPolicy;
use delivery_sync_lib::services::gitlab_client::{GitLabClient, GitLabClientConfig};
use delivery_sync_lib::{exit_code, SyncEngine};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;

const PROJECT: &str = "acme/platform";
const NEWEST_UPDATE: &str = "2024-02-05T09:00:00Z";

#[derive(Clone, Default)]
struct MockGitLab {
    /// (project, page, updated_after) of every listing request.
    listings: Arc<Mutex<Vec<(String, u32, Option<String>)>>>,
    commit_requests: Arc<Mutex<Vec<i64>>>,
    commits_failed: Arc<AtomicBool>,
}

fn merge_request(iid: i64, updated_at: &str) -> Value {
    json!({
        "id": 93958000 + iid,
        "iid": iid,
        "title": format!("Merge request !{}", iid),
        "state": "merged",
        "author": {"username": "jdoe"},
        "created_at": "2024-02-01T10:00:00.000Z",
        "updated_at": updated_at,
        "merged_at": updated_at,
        "web_url": format!("https://gitlab.example.com/{}/-/merge_requests/{}", PROJECT, iid),
        "references": {"full": format!("{}!{}", PROJECT, iid)}
    })
}

fn commit(sha: &str) -> Value {
    json!({
        "id": sha,
        "author_name": "Jane Doe",
        "author_email": "jane@example.com",
        "authored_date": "2024-02-01T11:00:00.000Z",
        "committer_name": "Jane Doe",
        "committer_email": "jane@example.com",
        "committed_date": "2024-02-01T11:05:00.000Z",
        "message": format!("Commit {}", sha)
    })
}

fn pages() -> Vec<Vec<Value>> {
    vec![
        vec![
            merge_request(5, "2024-02-05T09:00:00.000Z"),
            merge_request(4, "2024-02-04T09:00:00.000Z"),
        ],
        vec![merge_request(3, "2024-02-03T09:00:00.000Z")],
    ]
}

fn timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
}

fn pagination_headers(page: u32, next: Option<u32>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-page", HeaderValue::from_str(&page.to_string()).unwrap());
    let next = next.map(|n| n.to_string()).unwrap_or_default();
    headers.insert("x-next-page", HeaderValue::from_str(&next).unwrap());
    headers
}

async fn list_merge_requests(
    State(mock): State<MockGitLab>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let page: u32 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let updated_after = query.get("updated_after").cloned();
    mock.listings
        .lock()
        .unwrap()
        .push((project, page, updated_after.clone()));

    let after = updated_after.as_deref().map(timestamp);
    let matching: Vec<Value> = pages()
        .into_iter()
        .flatten()
        .filter(|mr| match after {
            Some(after) => timestamp(mr["updated_at"].as_str().unwrap()) >= after,
            None => true,
        })
        .collect();

    let per_page = 2;
    let start = (page as usize - 1) * per_page;
    let records: Vec<Value> = matching.iter().skip(start).take(per_page).cloned().collect();
    let next = (start + per_page < matching.len()).then_some(page + 1);

    (pagination_headers(page, next), Json(records)).into_response()
}

async fn list_commits(
    State(mock): State<MockGitLab>,
    Path((_project, iid)): Path<(String, i64)>,
) -> Response {
    mock.commit_requests.lock().unwrap().push(iid);

    if iid == 4 && !mock.commits_failed.swap(true, Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"message": "503 Service Unavailable"})),
        )
            .into_response();
    }

    let commits = match iid {
        5 => vec![commit("c5a"), commit("c4a")],
        4 => vec![commit("c4a")],
        3 => vec![commit("c3a")],
        _ => Vec::new(),
    };
    (pagination_headers(1, None), Json(commits)).into_response()
}

async fn start_mock() -> (String, MockGitLab) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let mock = MockGitLab::default();

    let app = Router::new()
        .route("/api/v4/projects/{project}/merge_requests", get(list_merge_requests))
        .route(
            "/api/v4/projects/{project}/merge_requests/{iid}/commits",
            get(list_commits),
        )
        .with_state(mock.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (base_url, mock)
}

fn client(base_url: &str) -> GitLabClient {
    GitLabClient::new(GitLabClientConfig {
        base_url: base_url.to_string(),
        token: "glpat-test".to_string(),
        project: PROJECT.to_string(),
        timeout_secs: 5,
        per_page: 2,
    })
    .unwrap()
}

fn engine(pool: DbPool) -> SyncEngine {
    SyncEngine::new(
        pool,
        FetchPolicy {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            with_jitter: false,
            ..Default::default()
        },
    )
}

async fn count(pool: &DbPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_first_run_follows_next_page_headers() {
    let (base_url, mock) = start_mock().await;
    let dir = tempdir().unwrap();
    let pool = db::initialize(&dir.path().join("metrics.db")).await.unwrap();

    let summary = engine(pool.clone()).run(&client(&base_url)).await;

    assert_eq!(exit_code(&summary), 0);
    let report = summary.report(EntityType::PullRequest).unwrap();
    assert_eq!(report.source, "gitlab");
    assert_eq!(report.scope, PROJECT);
    assert_eq!(report.rows_fetched, 3 + 4);
    assert!(report.advanced);

    let listings = mock.listings.lock().unwrap().clone();
    assert_eq!(
        listings,
        vec![
            (PROJECT.to_string(), 1, None),
            (PROJECT.to_string(), 2, None)
        ]
    );

    assert_eq!(count(&pool, "pull_requests").await, 3);
    assert_eq!(count(&pool, "commits").await, 3);
    assert_eq!(count(&pool, "pr_commits").await, 4);

    let repositories: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT repository FROM pull_requests WHERE provider = 'gitlab'")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(repositories, vec![PROJECT.to_string()]);

    let stored = watermarks::get_watermark(&pool, "gitlab", PROJECT, EntityType::PullRequest)
        .await
        .unwrap();
    assert_eq!(stored, Some(NEWEST_UPDATE.parse().unwrap()));
}

#[tokio::test]
async fn test_server_error_on_commits_is_retried() {
    let (base_url, mock) = start_mock().await;
    let dir = tempdir().unwrap();
    let pool = db::initialize(&dir.path().join("metrics.db")).await.unwrap();

    let summary = engine(pool.clone()).run(&client(&base_url)).await;

    assert!(summary.all_done());
    let requests = mock.commit_requests.lock().unwrap().clone();
    assert_eq!(requests.iter().filter(|&&iid| iid == 4).count(), 2);

    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pr_commits WHERE pr_number = 4")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(links, 1);
}

#[tokio::test]
async fn test_rerun_passes_watermark_as_updated_after() {
    let (base_url, mock) = start_mock().await;
    let dir = tempdir().unwrap();
    let pool = db::initialize(&dir.path().join("metrics.db")).await.unwrap();
    let gitlab = client(&base_url);

    engine(pool.clone()).run(&gitlab).await;
    mock.listings.lock().unwrap().clear();

    let summary = engine(pool.clone()).run(&gitlab).await;
    let report = summary.report(EntityType::PullRequest).unwrap();

    assert!(report.is_done());
    assert_eq!(report.rows_inserted, 0);
    assert!(!report.advanced);
    // Only the boundary merge request and its two commits come back
    assert_eq!(report.rows_fetched, 3);

    let listings = mock.listings.lock().unwrap().clone();
    assert_eq!(
        listings,
        vec![(PROJECT.to_string(), 1, Some(NEWEST_UPDATE.to_string()))]
    );

    assert_eq!(count(&pool, "pull_requests").await, 3);
    assert_eq!(count(&pool, "pr_commits").await, 4);
}
