//! Source provider interface.
//!
//! One implementation per external system. The fetcher drives pagination,
//! retries and cut-off through this interface; providers only know how to
//! request a single page and how to map their payloads to rows.

use crate::error::SyncError;
use crate::models::{EntityType, ListingOrder};
use crate::services::normalizer::Normalized;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A request for one page.
///
/// `page` is the provider's page cursor (page number or offset); `None`
/// requests the first page.
#[derive(Debug, Clone, Copy)]
pub enum PageQuery<'a> {
    /// A page of a root entity listing, filtered server-side by `since`
    /// where the source supports it.
    Listing {
        entity: EntityType,
        since: Option<DateTime<Utc>>,
        page: Option<u32>,
    },
    /// A page of the child collection of one root record.
    Children {
        entity: EntityType,
        parent: &'a Value,
        page: Option<u32>,
    },
}

impl PageQuery<'_> {
    pub fn entity(&self) -> EntityType {
        match self {
            Self::Listing { entity, .. } | Self::Children { entity, .. } => *entity,
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            Self::Listing { page, .. } | Self::Children { page, .. } => *page,
        }
    }
}

/// One decoded page of records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Value>,
    /// Cursor of the next page; `None` when this was the last one.
    pub next: Option<u32>,
}

/// A root record together with its fetched child records.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub entity: EntityType,
    pub body: Value,
    pub children: Vec<Value>,
}

/// A source system the engine can synchronize from.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Source name used in watermark keys and reports ("github", ...).
    fn source_id(&self) -> &str;

    /// What this instance of the source covers: a repository, a project
    /// path or a Jira project key. Watermarks are kept per scope.
    fn scope(&self) -> &str;

    /// Entity types that own a pipeline for this source.
    fn root_entities(&self) -> &'static [EntityType];

    /// Update-time order of the listing for a root entity type.
    fn listing_order(&self, entity: EntityType) -> ListingOrder;

    /// Fetch a single page. Errors are classified but never retried here.
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Page, SyncError>;

    /// Update time of a root record, used for the `since` cut-off and the
    /// next watermark.
    fn updated_at(&self, entity: EntityType, record: &Value) -> Option<DateTime<Utc>>;

    /// Child entity type fetched per root record, if any.
    fn child_entity(&self, entity: EntityType) -> Option<EntityType>;

    /// Children already embedded in the root record, sparing a request.
    fn inline_children(&self, _entity: EntityType, _record: &Value) -> Option<Vec<Value>> {
        None
    }

    /// Map a fetched payload to rows. Pure: no I/O.
    fn normalize(&self, payload: &RawPayload) -> Normalized;
}
