//! Sync orchestrator.
//!
//! Runs one pipeline per root entity type of a provider:
//! read watermark → fetch → normalize → merge → advance watermark.
//! Watermarks are keyed by the provider's source id and scope.
//!
//! - Pipelines run concurrently and share nothing but the pool
//! - A failure stops only its own pipeline and leaves its watermark alone
//! - Cancellation is honored between states, never inside a merge
//! - Every outcome is appended to the sync log

use crate::db::pool::DbPool;
use crate::db::sync_log::{self, NewSyncLogEntry};
use crate::db::watermarks;
use crate::error::SyncError;
use crate::models::{EntityType, Watermark};
use crate::services::fetcher::{self, FetchPolicy};
use crate::services::merge::{self, MergeOutcome};
use crate::services::normalizer::Normalized;
use crate::services::provider::{RawPayload, SourceProvider};
use futures::future::join_all;
use futures::TryStreamExt;
use serde::Serialize;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pipeline state of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Fetching,
    Normalizing,
    Merging,
    WatermarkUpdate,
    Done,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Normalizing => "normalizing",
            Self::Merging => "merging",
            Self::WatermarkUpdate => "watermark_update",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of one entity type's pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub source: String,
    pub scope: String,
    pub entity: EntityType,

    /// Final state: `Done` or `Failed`.
    pub state: SyncState,

    /// State the pipeline was in when it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<SyncState>,

    /// Root records plus their child records.
    pub rows_fetched: usize,

    /// Rows inserted or overwritten across the pipeline's tables.
    pub rows_merged: u64,

    /// Rows that did not exist before this run.
    pub rows_inserted: u64,

    pub tables: Vec<MergeOutcome>,

    /// Normalization warnings (fields stored as null, records skipped).
    pub warnings: usize,

    pub watermark_before: Option<Watermark>,
    pub watermark_after: Option<Watermark>,
    pub advanced: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncError>,

    pub duration_ms: i64,
}

impl EntityReport {
    fn new(source: &str, scope: &str, entity: EntityType) -> Self {
        Self {
            source: source.to_string(),
            scope: scope.to_string(),
            entity,
            state: SyncState::Idle,
            failed_at: None,
            rows_fetched: 0,
            rows_merged: 0,
            rows_inserted: 0,
            tables: Vec::new(),
            warnings: 0,
            watermark_before: None,
            watermark_after: None,
            advanced: false,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == SyncState::Done
    }
}

/// Reports of every pipeline of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub source: String,
    pub scope: String,
    pub reports: Vec<EntityReport>,
}

impl SyncSummary {
    /// Whether every entity type reached `Done`.
    pub fn all_done(&self) -> bool {
        self.reports.iter().all(EntityReport::is_done)
    }

    pub fn report(&self, entity: EntityType) -> Option<&EntityReport> {
        self.reports.iter().find(|r| r.entity == entity)
    }
}

/// Drives sync pipelines against the local store.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    pool: DbPool,
    policy: FetchPolicy,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(pool: DbPool, policy: FetchPolicy) -> Self {
        Self {
            pool,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every root entity pipeline of `provider` concurrently.
    pub async fn run(&self, provider: &dyn SourceProvider) -> SyncSummary {
        log::info!("Starting sync for {} {}", provider.source_id(), provider.scope());

        let pipelines = provider
            .root_entities()
            .iter()
            .map(|&entity| self.run_entity(provider, entity));
        let reports = join_all(pipelines).await;

        let summary = SyncSummary {
            source: provider.source_id().to_string(),
            scope: provider.scope().to_string(),
            reports,
        };
        log::info!(
            "Sync for {} {} finished: {}/{} entity types done",
            summary.source,
            summary.scope,
            summary.reports.iter().filter(|r| r.is_done()).count(),
            summary.reports.len()
        );

        summary
    }

    /// Run one entity type's pipeline to `Done` or `Failed`.
    pub async fn run_entity(&self, provider: &dyn SourceProvider, entity: EntityType) -> EntityReport {
        let started = Instant::now();
        let mut report = EntityReport::new(provider.source_id(), provider.scope(), entity);

        match self.drive(provider, entity, &mut report).await {
            Ok(()) => {
                report.state = SyncState::Done;
                log::info!(
                    "{} {}: done, fetched {}, merged {} ({} new), watermark {}",
                    report.source,
                    entity,
                    report.rows_fetched,
                    report.rows_merged,
                    report.rows_inserted,
                    report
                        .watermark_after
                        .map(|w| w.to_string())
                        .unwrap_or_else(|| "unset".to_string())
                );
            }
            Err(err) => {
                log::error!("{} {}: failed while {}: {}", report.source, entity, report.state, err);
                report.failed_at = Some(report.state);
                report.state = SyncState::Failed;
                report.error = Some(err);
                report.watermark_after = report.watermark_before;
                report.advanced = false;
            }
        }
        report.duration_ms = started.elapsed().as_millis() as i64;

        self.record(&report).await;
        report
    }

    /// Move to `next`, unless the run has been cancelled.
    fn enter(&self, report: &mut EntityReport, next: SyncState) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::cancelled(next.to_string()));
        }
        log::debug!("{} {}: {} -> {}", report.source, report.entity, report.state, next);
        report.state = next;
        Ok(())
    }

    async fn drive(
        &self,
        provider: &dyn SourceProvider,
        entity: EntityType,
        report: &mut EntityReport,
    ) -> Result<(), SyncError> {
        if !entity.is_root() {
            return Err(SyncError::config(format!("{} has no pipeline of its own", entity)));
        }

        let source = provider.source_id();
        let scope = provider.scope();
        let previous = watermarks::get_watermark(&self.pool, source, scope, entity).await?;
        report.watermark_before = previous;

        self.enter(report, SyncState::Fetching)?;
        let since = previous.map(|w| w.timestamp());
        let payloads: Vec<RawPayload> = fetcher::fetch(provider, entity, since, &self.policy)
            .try_collect()
            .await?;
        report.rows_fetched = payloads.iter().map(|p| 1 + p.children.len()).sum();
        let newest = payloads
            .iter()
            .filter_map(|p| provider.updated_at(entity, &p.body))
            .max();

        self.enter(report, SyncState::Normalizing)?;
        let mut normalized = Normalized::default();
        for payload in &payloads {
            normalized.extend(provider.normalize(payload));
        }
        report.warnings = normalized.warnings.len();
        log::debug!(
            "{} {}: normalized {} rows with {} warnings",
            source,
            entity,
            normalized.rows.len(),
            report.warnings
        );

        self.enter(report, SyncState::Merging)?;
        let outcomes = merge::apply_batch(&self.pool, &normalized.rows).await?;
        report.rows_merged = outcomes.iter().map(|o| o.affected).sum();
        report.rows_inserted = outcomes.iter().map(|o| o.inserted).sum();
        report.tables = outcomes;

        // The merge is committed; finish the watermark even if cancelled now
        report.state = SyncState::WatermarkUpdate;
        let next = Watermark::advance(previous, newest);
        report.watermark_after = next;
        if let Some(next) = next.filter(|n| Some(*n) != previous) {
            report.advanced = watermarks::set_watermark(&self.pool, source, scope, entity, next).await?;
        }

        Ok(())
    }

    /// Append the outcome to the sync log. Logging failures are not fatal.
    async fn record(&self, report: &EntityReport) {
        let message = match &report.error {
            Some(err) => Some(err.to_string()),
            None => Some(format!(
                "{} new, {} warnings",
                report.rows_inserted, report.warnings
            )),
        };
        let entry = NewSyncLogEntry {
            source: &report.source,
            scope: &report.scope,
            entity_type: report.entity.as_str(),
            status: report.state.as_str(),
            rows_fetched: report.rows_fetched as i64,
            rows_merged: report.rows_merged as i64,
            message,
            duration_ms: Some(report.duration_ms),
        };

        if let Err(e) = sync_log::log_sync_operation(&self.pool, &entry).await {
            log::warn!("Failed to write sync log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{ListingOrder, PrCommitLinkRow};
    use crate::services::normalizer::github;
    use crate::services::provider::{Page, PageQuery};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::tempdir;

    /// One page of pull requests and one page of issues; either listing can
    /// be made to fail.
    struct FixtureProvider {
        scope: &'static str,
        pulls: Vec<Value>,
        fail_pulls: Option<SyncError>,
        fail_issues: Option<SyncError>,
        dangling_link: bool,
    }

    impl FixtureProvider {
        fn new(pulls: Vec<Value>) -> Self {
            Self {
                scope: "acme/api",
                pulls,
                fail_pulls: None,
                fail_issues: None,
                dangling_link: false,
            }
        }
    }

    #[async_trait]
    impl SourceProvider for FixtureProvider {
        fn source_id(&self) -> &str {
            "fixture"
        }

        fn scope(&self) -> &str {
            self.scope
        }

        fn root_entities(&self) -> &'static [EntityType] {
            &[EntityType::PullRequest, EntityType::Issue]
        }

        fn listing_order(&self, _entity: EntityType) -> ListingOrder {
            ListingOrder::Descending
        }

        async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Page, SyncError> {
            match query {
                PageQuery::Listing {
                    entity: EntityType::PullRequest,
                    ..
                } => match &self.fail_pulls {
                    Some(err) => Err(err.clone()),
                    None => Ok(Page {
                        records: self.pulls.clone(),
                        next: None,
                    }),
                },
                PageQuery::Listing { .. } => match &self.fail_issues {
                    Some(err) => Err(err.clone()),
                    None => Ok(Page::default()),
                },
                PageQuery::Children { .. } => Ok(Page::default()),
            }
        }

        fn updated_at(&self, _entity: EntityType, record: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
            record["updated_at"]
                .as_str()
                .and_then(crate::models::watermark::parse_timestamp)
        }

        fn child_entity(&self, _entity: EntityType) -> Option<EntityType> {
            None
        }

        fn normalize(&self, payload: &RawPayload) -> Normalized {
            let mut out = github::normalize_pull_request(self.scope, &payload.body, &payload.children);
            if self.dangling_link {
                out.rows.pr_commits.push(PrCommitLinkRow {
                    provider: "github".into(),
                    repository: "acme/api".into(),
                    pr_number: 1,
                    sha: "missing".into(),
                });
            }
            out
        }
    }

    fn pr(number: i64, updated_at: &str) -> Value {
        json!({"number": number, "title": format!("PR {}", number), "updated_at": updated_at})
    }

    fn engine(pool: DbPool) -> SyncEngine {
        SyncEngine::new(
            pool,
            FetchPolicy {
                max_attempts: 2,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                with_jitter: false,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_successful_run_advances_watermark() {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("sync.db")).await.unwrap();
        let provider = FixtureProvider::new(vec![
            pr(2, "2024-01-12T00:00:00Z"),
            pr(1, "2024-01-10T00:00:00Z"),
        ]);

        let summary = engine(pool.clone()).run(&provider).await;
        assert!(summary.all_done());

        let report = summary.report(EntityType::PullRequest).unwrap();
        assert_eq!(report.rows_fetched, 2);
        assert_eq!(report.rows_inserted, 2);
        assert!(report.advanced);
        assert_eq!(
            report.watermark_after,
            Some("2024-01-12T00:00:00Z".parse().unwrap())
        );

        let stored = watermarks::get_watermark(&pool, "fixture", "acme/api", EntityType::PullRequest)
            .await
            .unwrap();
        assert_eq!(stored, report.watermark_after);

        // Issues fetched nothing: done, no watermark
        let issues = summary.report(EntityType::Issue).unwrap();
        assert!(issues.is_done());
        assert!(!issues.advanced);
        assert!(issues.watermark_after.is_none());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_watermark_and_isolates_pipelines() {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("sync.db")).await.unwrap();

        let first = FixtureProvider::new(vec![pr(1, "2024-01-10T00:00:00Z")]);
        engine(pool.clone()).run(&first).await;

        let mut second = FixtureProvider::new(vec![pr(2, "2024-02-01T00:00:00Z")]);
        second.fail_pulls = Some(SyncError::permanent_full("Bad credentials", 401, "/pulls"));
        let summary = engine(pool.clone()).run(&second).await;

        assert!(!summary.all_done());
        let report = summary.report(EntityType::PullRequest).unwrap();
        assert_eq!(report.state, SyncState::Failed);
        assert_eq!(report.failed_at, Some(SyncState::Fetching));
        assert!(!report.advanced);
        assert!(summary.report(EntityType::Issue).unwrap().is_done());

        let stored = watermarks::get_watermark(&pool, "fixture", "acme/api", EntityType::PullRequest)
            .await
            .unwrap();
        assert_eq!(stored, Some("2024-01-10T00:00:00Z".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_second_repository_is_not_cut_off_by_first() {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("sync.db")).await.unwrap();

        let api = FixtureProvider::new(vec![pr(9, "2024-06-01T00:00:00Z")]);
        engine(pool.clone()).run(&api).await;

        let mut web = FixtureProvider::new(vec![
            pr(2, "2024-01-02T00:00:00Z"),
            pr(1, "2024-01-01T00:00:00Z"),
        ]);
        web.scope = "acme/web";
        let summary = engine(pool.clone()).run(&web).await;

        let report = summary.report(EntityType::PullRequest).unwrap();
        assert_eq!(report.scope, "acme/web");
        assert!(report.watermark_before.is_none());
        assert_eq!(report.rows_fetched, 2);
        assert_eq!(report.rows_inserted, 2);
        assert!(report.advanced);

        let api_mark = watermarks::get_watermark(&pool, "fixture", "acme/api", EntityType::PullRequest)
            .await
            .unwrap();
        let web_mark = watermarks::get_watermark(&pool, "fixture", "acme/web", EntityType::PullRequest)
            .await
            .unwrap();
        assert_eq!(api_mark, Some("2024-06-01T00:00:00Z".parse().unwrap()));
        assert_eq!(web_mark, Some("2024-01-02T00:00:00Z".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_storage_failure_reports_merging_state() {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("sync.db")).await.unwrap();

        let mut provider = FixtureProvider::new(vec![pr(1, "2024-01-10T00:00:00Z")]);
        provider.dangling_link = true;

        let report = engine(pool.clone())
            .run_entity(&provider, EntityType::PullRequest)
            .await;

        assert_eq!(report.failed_at, Some(SyncState::Merging));
        assert!(matches!(report.error, Some(SyncError::Storage { .. })));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pull_requests")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        assert!(watermarks::get_watermark(&pool, "fixture", "acme/api", EntityType::PullRequest)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_fetching() {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("sync.db")).await.unwrap();
        let provider = FixtureProvider::new(vec![pr(1, "2024-01-10T00:00:00Z")]);

        let engine = engine(pool.clone());
        engine.cancellation_token().cancel();
        let summary = engine.run(&provider).await;

        for report in &summary.reports {
            assert_eq!(report.state, SyncState::Failed);
            assert_eq!(report.failed_at, Some(SyncState::Idle));
            assert!(matches!(report.error, Some(SyncError::Cancelled { .. })));
        }
    }

    #[tokio::test]
    async fn test_outcomes_are_logged() {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("sync.db")).await.unwrap();
        let provider = FixtureProvider::new(vec![pr(1, "2024-01-10T00:00:00Z")]);

        engine(pool.clone()).run(&provider).await;

        let entries = sync_log::get_sync_log(&pool, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.status == "done" && e.source == "fixture" && e.scope == "acme/api"));
    }

    #[test]
    fn test_report_serializes_state_names() {
        let mut report = EntityReport::new("github", "acme/api", EntityType::PullRequest);
        report.state = SyncState::Failed;
        report.failed_at = Some(SyncState::WatermarkUpdate);
        report.error = Some(SyncError::storage("disk full"));

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["failed_at"], "watermark_update");
        assert_eq!(value["entity"], "pull_request");
        assert_eq!(value["error"]["type"], "Storage");
    }
}
