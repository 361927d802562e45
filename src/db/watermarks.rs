//! Watermark store: per (source, scope, entity type) synchronization boundary.
//!
//! The scope is the repository, project path or Jira project key a source
//! was configured with, so two repositories of one provider never share a
//! boundary.

use crate::models::watermark::format_timestamp;
use crate::models::{EntityType, Watermark};
use serde::Serialize;
use sqlx::FromRow;

/// A stored watermark with its bookkeeping columns.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WatermarkRecord {
    pub source: String,
    pub scope: String,
    pub entity_type: String,
    pub watermark: String,
    /// When the watermark was last written.
    pub updated_at: String,
}

/// Read the watermark for one source scope and entity type.
///
/// `None` when the triple has never been synchronized.
pub async fn get_watermark(
    pool: &sqlx::SqlitePool,
    source: &str,
    scope: &str,
    entity: EntityType,
) -> Result<Option<Watermark>, sqlx::Error> {
    let stored: Option<(String,)> = sqlx::query_as(
        "SELECT watermark FROM sync_watermarks WHERE source = ? AND scope = ? AND entity_type = ?",
    )
    .bind(source)
    .bind(scope)
    .bind(entity.as_str())
    .fetch_optional(pool)
    .await?;

    stored
        .map(|(value,)| {
            value
                .parse::<Watermark>()
                .map_err(|e| sqlx::Error::Decode(e.into()))
        })
        .transpose()
}

/// Persist a watermark.
///
/// The upsert only takes effect when `watermark` is later than the stored
/// value, so a stale writer can never move a watermark backwards. Returns
/// whether the stored value changed.
pub async fn set_watermark(
    pool: &sqlx::SqlitePool,
    source: &str,
    scope: &str,
    entity: EntityType,
    watermark: Watermark,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_watermarks (source, scope, entity_type, watermark, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(source, scope, entity_type) DO UPDATE SET
            watermark = excluded.watermark,
            updated_at = excluded.updated_at
        WHERE excluded.watermark > sync_watermarks.watermark
        "#,
    )
    .bind(source)
    .bind(scope)
    .bind(entity.as_str())
    .bind(watermark.to_string())
    .bind(format_timestamp(chrono::Utc::now()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// List all stored watermarks, optionally for one source.
pub async fn list_watermarks(
    pool: &sqlx::SqlitePool,
    source: Option<&str>,
) -> Result<Vec<WatermarkRecord>, sqlx::Error> {
    sqlx::query_as::<_, WatermarkRecord>(
        r#"
        SELECT source, scope, entity_type, watermark, updated_at
        FROM sync_watermarks
        WHERE ?1 IS NULL OR source = ?1
        ORDER BY source, scope, entity_type
        "#,
    )
    .bind(source)
    .fetch_all(pool)
    .await
}
