//! Paginated fetcher.
//!
//! Turns a provider's page-at-a-time API into a lazy stream of raw payloads
//! updated at or after `since`. Each page request is retried with bounded
//! exponential backoff on transient failures and re-issued after the
//! provider's reset time on rate limits, up to a bounded number of waits.
//! Permanent failures end the stream.
//! The stream holds no state beyond the current page cursor, so a failed
//! fetch is restarted from scratch.

use crate::error::SyncError;
use crate::models::{EntityType, ListingOrder};
use crate::services::provider::{Page, PageQuery, RawPayload, SourceProvider};
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::time::Duration;

/// Default total attempts per page request (first try included).
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Default number of rate-limit waits per page request.
pub const DEFAULT_MAX_RATE_LIMIT_WAITS: usize = 10;

/// Shortest wait honored after a rate-limit signal.
const MIN_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Retry and rate-limit policy for page requests.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Total attempts per page request on transient failures.
    pub max_attempts: usize,
    /// First backoff delay.
    pub min_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Whether to add jitter to backoff delays.
    pub with_jitter: bool,
    /// Longest single wait for a rate-limit reset.
    pub max_rate_limit_wait: Duration,
    /// Rate-limit waits allowed per page request before the page fails
    /// with the last `RateLimited` error.
    pub max_rate_limit_waits: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            with_jitter: true,
            max_rate_limit_wait: Duration::from_secs(15 * 60),
            max_rate_limit_waits: DEFAULT_MAX_RATE_LIMIT_WAITS,
        }
    }
}

impl FetchPolicy {
    /// Build the exponential backoff strategy for transient failures.
    pub fn backoff(&self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1));

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }

    /// How long to wait for a rate-limit reset.
    fn rate_limit_wait(&self, reset: Duration) -> Duration {
        reset.clamp(MIN_RATE_LIMIT_WAIT, self.max_rate_limit_wait.max(MIN_RATE_LIMIT_WAIT))
    }
}

/// Request one page, retrying transient failures and waiting out rate limits.
///
/// Rate-limit waits re-request the same page and do not count against
/// `max_attempts`; after `max_rate_limit_waits` of them the rate-limit
/// error is returned.
pub async fn fetch_page_with_retry(
    provider: &dyn SourceProvider,
    query: &PageQuery<'_>,
    policy: &FetchPolicy,
) -> Result<Page, SyncError> {
    let mut waits = 0usize;
    loop {
        let result = (|| provider.fetch_page(query))
            .retry(policy.backoff())
            .when(SyncError::is_transient)
            .notify(|err: &SyncError, delay: Duration| {
                log::warn!(
                    "{} {}: retrying page {:?} in {:?} after: {}",
                    provider.source_id(),
                    query.entity(),
                    query.page(),
                    delay,
                    err
                );
            })
            .await;

        match result {
            Ok(page) => return Ok(page),
            Err(err) => match err.rate_limit_reset() {
                Some(_) if waits >= policy.max_rate_limit_waits => {
                    log::error!(
                        "{} {}: still rate limited on page {:?} after {} waits, giving up",
                        provider.source_id(),
                        query.entity(),
                        query.page(),
                        waits
                    );
                    return Err(err);
                }
                Some(reset) => {
                    waits += 1;
                    let wait = policy.rate_limit_wait(reset);
                    log::warn!(
                        "{} {}: rate limited, resuming page {:?} in {:?}",
                        provider.source_id(),
                        query.entity(),
                        query.page(),
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                None => return Err(err),
            },
        }
    }
}

/// Position in a listing.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    Start,
    At(u32),
    Done,
}

/// Keep records updated at or after `since`.
///
/// Records without a readable update time are kept. The flag reports
/// whether any record was positively at or after `since`.
fn apply_cutoff(
    provider: &dyn SourceProvider,
    entity: EntityType,
    since: Option<DateTime<Utc>>,
    records: Vec<Value>,
) -> (Vec<Value>, bool) {
    let Some(since) = since else {
        return (records, true);
    };

    let mut any_recent = false;
    let kept = records
        .into_iter()
        .filter(|record| match provider.updated_at(entity, record) {
            Some(ts) if ts >= since => {
                any_recent = true;
                true
            }
            Some(_) => false,
            None => true,
        })
        .collect();

    (kept, any_recent)
}

/// Fetch all child records of one root record.
async fn with_children(
    provider: &dyn SourceProvider,
    entity: EntityType,
    record: Value,
    policy: &FetchPolicy,
) -> Result<RawPayload, SyncError> {
    let Some(child) = provider.child_entity(entity) else {
        return Ok(RawPayload {
            entity,
            body: record,
            children: Vec::new(),
        });
    };

    if let Some(children) = provider.inline_children(entity, &record) {
        return Ok(RawPayload {
            entity,
            body: record,
            children,
        });
    }

    let mut children = Vec::new();
    let mut page = None;
    loop {
        let query = PageQuery::Children {
            entity: child,
            parent: &record,
            page,
        };
        let fetched = fetch_page_with_retry(provider, &query, policy).await?;
        let exhausted = fetched.records.is_empty();
        children.extend(fetched.records);

        match fetched.next {
            Some(next) if !exhausted => page = Some(next),
            _ => break,
        }
    }

    Ok(RawPayload {
        entity,
        body: record,
        children,
    })
}

/// Lazily fetch every root record of `entity` updated at or after `since`,
/// each with its children attached.
///
/// Pages are requested in the provider's listing order. A descending
/// listing is cut off after the first page holding no record at or after
/// `since`; an ascending one is filtered page by page until the source
/// reports no next page. An empty page always ends the listing.
pub fn fetch<'a>(
    provider: &'a dyn SourceProvider,
    entity: EntityType,
    since: Option<DateTime<Utc>>,
    policy: &'a FetchPolicy,
) -> impl Stream<Item = Result<RawPayload, SyncError>> + Send + 'a {
    let order = provider.listing_order(entity);

    let pages = stream::try_unfold(Cursor::Start, move |cursor| async move {
        let page = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::At(n) => Some(n),
        };

        let query = PageQuery::Listing { entity, since, page };
        let fetched = fetch_page_with_retry(provider, &query, policy).await?;
        if fetched.records.is_empty() {
            return Ok(None);
        }

        let fetched_count = fetched.records.len();
        let (kept, any_recent) = apply_cutoff(provider, entity, since, fetched.records);
        log::debug!(
            "{} {}: page {:?} kept {}/{} records",
            provider.source_id(),
            entity,
            page,
            kept.len(),
            fetched_count
        );

        let next = match fetched.next {
            Some(_) if order == ListingOrder::Descending && !any_recent => {
                log::debug!(
                    "{} {}: listing fell behind the watermark, stopping",
                    provider.source_id(),
                    entity
                );
                Cursor::Done
            }
            Some(n) => Cursor::At(n),
            None => Cursor::Done,
        };

        Ok::<_, SyncError>(Some((kept, next)))
    });

    pages
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<Value, SyncError>)))
        .try_flatten()
        .and_then(move |record| with_children(provider, entity, record, policy))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::normalizer::Normalized;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Serves fixed pages and injects scripted failures before given pages.
    struct ScriptedProvider {
        order: ListingOrder,
        pages: Vec<Vec<Value>>,
        children: HashMap<i64, Vec<Vec<Value>>>,
        failures: Mutex<VecDeque<(u32, SyncError)>>,
        calls: Mutex<Vec<u32>>,
    }

    impl ScriptedProvider {
        fn new(order: ListingOrder, pages: Vec<Vec<Value>>) -> Self {
            Self {
                order,
                pages,
                children: HashMap::new(),
                failures: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn fail(self, page: u32, err: SyncError) -> Self {
            self.failures.lock().unwrap().push_back((page, err));
            self
        }

        fn listing_calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceProvider for ScriptedProvider {
        fn source_id(&self) -> &str {
            "scripted"
        }

        fn scope(&self) -> &str {
            "acme/api"
        }

        fn root_entities(&self) -> &'static [EntityType] {
            &[EntityType::PullRequest]
        }

        fn listing_order(&self, _entity: EntityType) -> ListingOrder {
            self.order
        }

        async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Page, SyncError> {
            match *query {
                PageQuery::Listing { page, .. } => {
                    let page = page.unwrap_or(1);
                    self.calls.lock().unwrap().push(page);

                    {
                        let mut failures = self.failures.lock().unwrap();
                        if failures.front().map(|(p, _)| *p) == Some(page) {
                            let (_, err) = failures.pop_front().unwrap();
                            return Err(err);
                        }
                    }

                    let idx = page as usize - 1;
                    Ok(Page {
                        records: self.pages.get(idx).cloned().unwrap_or_default(),
                        next: (idx + 1 < self.pages.len()).then_some(page + 1),
                    })
                }
                PageQuery::Children { parent, page, .. } => {
                    let number = parent["number"].as_i64().unwrap();
                    let pages = self.children.get(&number).cloned().unwrap_or_default();
                    let idx = page.unwrap_or(1) as usize - 1;
                    Ok(Page {
                        records: pages.get(idx).cloned().unwrap_or_default(),
                        next: (idx + 1 < pages.len()).then_some(idx as u32 + 2),
                    })
                }
            }
        }

        fn updated_at(&self, _entity: EntityType, record: &Value) -> Option<DateTime<Utc>> {
            record["updated_at"]
                .as_str()
                .and_then(crate::models::watermark::parse_timestamp)
        }

        fn child_entity(&self, entity: EntityType) -> Option<EntityType> {
            (entity == EntityType::PullRequest).then_some(EntityType::Commit)
        }

        fn normalize(&self, _payload: &RawPayload) -> Normalized {
            Normalized::default()
        }
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn pr(number: i64, updated_hour: u32) -> Value {
        json!({
            "number": number,
            "updated_at": hour(updated_hour).to_rfc3339(),
        })
    }

    fn policy() -> FetchPolicy {
        FetchPolicy {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            with_jitter: false,
            max_rate_limit_wait: Duration::from_secs(60),
            max_rate_limit_waits: 3,
        }
    }

    async fn numbers(
        provider: &ScriptedProvider,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<i64>, SyncError> {
        let policy = policy();
        let payloads: Vec<RawPayload> = fetch(provider, EntityType::PullRequest, since, &policy)
            .try_collect()
            .await?;
        Ok(payloads
            .iter()
            .map(|p| p.body["number"].as_i64().unwrap())
            .collect())
    }

    #[tokio::test]
    async fn test_descending_listing_is_cut_off_at_since() {
        let provider = ScriptedProvider::new(
            ListingOrder::Descending,
            vec![
                vec![pr(10, 20), pr(9, 19), pr(8, 18)],
                vec![pr(7, 17), pr(6, 16), pr(5, 15)],
                vec![pr(4, 14), pr(3, 13)],
                vec![pr(2, 12), pr(1, 11)],
            ],
        );

        let got = numbers(&provider, Some(hour(16))).await.unwrap();

        // Inclusive bound, nothing older
        assert_eq!(got, vec![10, 9, 8, 7, 6]);
        // Page 3 is requested, finds nothing new, and ends the listing
        assert_eq!(provider.listing_calls(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_out_of_order_records_within_window_are_kept() {
        let provider = ScriptedProvider::new(
            ListingOrder::Descending,
            vec![
                vec![pr(5, 20), pr(4, 10)],
                vec![pr(3, 18), pr(2, 9)],
                vec![pr(1, 8)],
            ],
        );

        let got = numbers(&provider, Some(hour(15))).await.unwrap();
        assert_eq!(got, vec![5, 3]);
        assert_eq!(provider.listing_calls(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_ascending_listing_filters_every_page() {
        let provider = ScriptedProvider::new(
            ListingOrder::Ascending,
            vec![vec![pr(1, 1), pr(2, 2)], vec![pr(3, 3), pr(4, 4)]],
        );

        let got = numbers(&provider, Some(hour(2))).await.unwrap();
        assert_eq!(got, vec![2, 3, 4]);
        assert_eq!(provider.listing_calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_full_backfill_without_since() {
        let provider = ScriptedProvider::new(
            ListingOrder::Descending,
            vec![vec![pr(3, 3), pr(2, 2)], vec![pr(1, 1)]],
        );

        assert_eq!(numbers(&provider, None).await.unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_records_without_timestamp_are_kept() {
        let provider = ScriptedProvider::new(
            ListingOrder::Descending,
            vec![vec![pr(2, 20), json!({"number": 1})]],
        );

        assert_eq!(numbers(&provider, Some(hour(10))).await.unwrap(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let provider = ScriptedProvider::new(
            ListingOrder::Descending,
            vec![vec![pr(2, 2)], vec![pr(1, 1)]],
        )
        .fail(2, SyncError::transient_full("Bad gateway", 502, "/pulls"))
        .fail(2, SyncError::transient("connection reset"));

        let got = numbers(&provider, None).await.unwrap();
        assert_eq!(got, vec![2, 1]);
        assert_eq!(provider.listing_calls(), vec![1, 2, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let provider = ScriptedProvider::new(ListingOrder::Descending, vec![vec![pr(1, 1)]])
            .fail(1, SyncError::transient("timeout"))
            .fail(1, SyncError::transient("timeout"))
            .fail(1, SyncError::transient("timeout"));

        let err = numbers(&provider, None).await.unwrap_err();
        assert!(err.is_transient());
        // max_attempts = 3
        assert_eq!(provider.listing_calls(), vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let provider = ScriptedProvider::new(ListingOrder::Descending, vec![vec![pr(1, 1)]])
            .fail(1, SyncError::permanent_full("Not Found", 404, "/pulls"));

        let err = numbers(&provider, None).await.unwrap_err();
        assert!(matches!(err, SyncError::PermanentFetch { status_code: Some(404), .. }));
        assert_eq!(provider.listing_calls(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pauses_and_resumes_same_page() {
        let provider = ScriptedProvider::new(
            ListingOrder::Descending,
            vec![
                vec![pr(6, 6), pr(5, 5)],
                vec![pr(4, 4), pr(3, 3)],
                vec![pr(2, 2), pr(1, 1)],
            ],
        )
        .fail(2, SyncError::rate_limited(Duration::from_secs(2), "/pulls"));

        let started = tokio::time::Instant::now();
        let got = numbers(&provider, None).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(got, vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(provider.listing_calls(), vec![1, 2, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_does_not_consume_attempts() {
        let provider = ScriptedProvider::new(ListingOrder::Descending, vec![vec![pr(1, 1)]])
            .fail(1, SyncError::transient("timeout"))
            .fail(1, SyncError::transient("timeout"))
            .fail(1, SyncError::rate_limited(Duration::from_secs(5), "/pulls"))
            .fail(1, SyncError::transient("timeout"))
            .fail(1, SyncError::transient("timeout"));

        assert_eq!(numbers(&provider, None).await.unwrap(), vec![1]);
        assert_eq!(provider.listing_calls().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_rate_limit_fails_after_bounded_waits() {
        let mut provider = ScriptedProvider::new(ListingOrder::Descending, vec![vec![pr(1, 1)]]);
        for _ in 0..10 {
            provider = provider.fail(1, SyncError::rate_limited(Duration::from_secs(30), "/pulls"));
        }

        let started = tokio::time::Instant::now();
        let err = numbers(&provider, None).await.unwrap_err();

        assert!(matches!(err, SyncError::RateLimited { .. }));
        // First request plus one re-request per allowed wait
        assert_eq!(provider.listing_calls(), vec![1, 1, 1, 1]);
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(started.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_children_are_fetched_across_pages() {
        let mut provider =
            ScriptedProvider::new(ListingOrder::Descending, vec![vec![pr(2, 2), pr(1, 1)]]);
        provider.children.insert(
            2,
            vec![vec![json!({"sha": "a"}), json!({"sha": "b"})], vec![json!({"sha": "c"})]],
        );

        let policy = policy();
        let payloads: Vec<RawPayload> = fetch(&provider, EntityType::PullRequest, None, &policy)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(payloads[0].children.len(), 3);
        assert!(payloads[1].children.is_empty());
    }

    #[test]
    fn test_rate_limit_wait_is_clamped() {
        let policy = policy();
        assert_eq!(policy.rate_limit_wait(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(policy.rate_limit_wait(Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(
            policy.rate_limit_wait(Duration::from_secs(3600)),
            Duration::from_secs(60)
        );
    }
}
