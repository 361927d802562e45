//! Sync run history.

use serde::Serialize;
use sqlx::FromRow;

/// Maximum number of log entries to keep.
pub const MAX_LOG_ENTRIES: i64 = 50;

/// One logged pipeline outcome.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub source: String,
    pub scope: String,
    pub entity_type: String,
    /// Final state: `done` or `failed`.
    pub status: String,
    pub rows_fetched: i64,
    pub rows_merged: i64,
    /// Details or error message.
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    /// When the run finished (Unix seconds).
    pub timestamp: i64,
}

/// Fields of a new log entry.
#[derive(Debug, Clone)]
pub struct NewSyncLogEntry<'a> {
    pub source: &'a str,
    pub scope: &'a str,
    pub entity_type: &'a str,
    pub status: &'a str,
    pub rows_fetched: i64,
    pub rows_merged: i64,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Record a pipeline outcome and prune old entries.
pub async fn log_sync_operation(
    pool: &sqlx::SqlitePool,
    entry: &NewSyncLogEntry<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_log (source, scope, entity_type, status, rows_fetched, rows_merged, message, duration_ms, timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.source)
    .bind(entry.scope)
    .bind(entry.entity_type)
    .bind(entry.status)
    .bind(entry.rows_fetched)
    .bind(entry.rows_merged)
    .bind(&entry.message)
    .bind(entry.duration_ms)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    // Keep only the newest MAX_LOG_ENTRIES
    sqlx::query(
        r#"
        DELETE FROM sync_log WHERE id NOT IN (
            SELECT id FROM sync_log ORDER BY id DESC LIMIT ?
        )
        "#,
    )
    .bind(MAX_LOG_ENTRIES)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get recent sync log entries, newest first.
pub async fn get_sync_log(
    pool: &sqlx::SqlitePool,
    limit: i64,
) -> Result<Vec<SyncLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, SyncLogEntry>(
        r#"
        SELECT id, source, scope, entity_type, status, rows_fetched, rows_merged, message, duration_ms, timestamp
        FROM sync_log
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
