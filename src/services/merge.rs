//! Merge engine: idempotent bulk upsert of normalized rows.
//!
//! Each table is merged with chunked multi-row
//! `INSERT .. ON CONFLICT(<natural key>) DO UPDATE` statements. All tables
//! of one pipeline run share a single transaction, so a failure anywhere
//! leaves every table of that pipeline exactly as it was.

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::watermark::format_timestamp;
use crate::services::normalizer::RowBatch;
use serde::Serialize;
use sqlx::query_builder::Separated;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::hash::Hash;

/// Upper bound on bind parameters per statement (SQLite allows 32766).
const MAX_BIND_PARAMS: usize = 30_000;

/// A normalized row that can be merged into its table by natural key.
pub trait MergeRow: Send + Sync {
    /// Target table.
    const TABLE: &'static str;

    /// Columns bound by [`MergeRow::bind_values`], in order.
    const COLUMNS: &'static [&'static str];

    /// Natural key columns (subset of `COLUMNS`).
    const KEY: &'static [&'static str];

    /// Whether the table has a `synced_at` column stamped at merge time.
    const STAMPED: bool = false;

    type Key: Eq + Hash;

    fn natural_key(&self) -> Self::Key;

    /// Push one value per entry of `COLUMNS`.
    fn bind_values<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>);
}

/// Result of merging one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub table: &'static str,
    /// Rows inserted or overwritten.
    pub affected: u64,
    /// Rows that did not exist before this merge.
    pub inserted: u64,
}

/// Collapse rows sharing a natural key, keeping the last one in its first position.
fn dedupe_by_key<R: MergeRow>(rows: &[R]) -> Vec<&R> {
    let mut index: HashMap<R::Key, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<&R> = Vec::with_capacity(rows.len());

    for row in rows {
        let key = row.natural_key();
        match index.get(&key).copied() {
            Some(pos) => unique[pos] = row,
            None => {
                index.insert(key, unique.len());
                unique.push(row);
            }
        }
    }

    unique
}

/// Build the `ON CONFLICT` clause: overwrite every non-key column.
fn upsert_clause<R: MergeRow>() -> String {
    let mut updates: Vec<String> = R::COLUMNS
        .iter()
        .filter(|c| !R::KEY.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    if R::STAMPED {
        updates.push("synced_at = excluded.synced_at".to_string());
    }

    if updates.is_empty() {
        format!(" ON CONFLICT({}) DO NOTHING", R::KEY.join(", "))
    } else {
        format!(
            " ON CONFLICT({}) DO UPDATE SET {}",
            R::KEY.join(", "),
            updates.join(", ")
        )
    }
}

/// Count how many of `chunk`'s natural keys already exist in `R::TABLE`.
///
/// The incoming rows are bound as a `VALUES` table and joined on the key
/// columns, so the lookup walks the primary key index.
async fn count_existing<R: MergeRow>(
    conn: &mut SqliteConnection,
    chunk: &[&R],
) -> Result<u64, SyncError> {
    let join_on = R::KEY
        .iter()
        .map(|k| format!("t.{k} = i.{k}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("WITH incoming ({}) AS (", R::COLUMNS.join(", ")));
    builder.push_values(chunk, |mut values, row| row.bind_values(&mut values));
    builder.push(format!(
        ") SELECT COUNT(*) FROM {} t JOIN incoming i ON {}",
        R::TABLE,
        join_on
    ));

    let existing: i64 = builder
        .build_query_scalar()
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| SyncError::storage_with_op(e.to_string(), format!("count {}", R::TABLE)))?;
    Ok(existing.max(0) as u64)
}

/// Merge `rows` into `R::TABLE` on the given connection.
///
/// Existing rows with the same natural key are overwritten wholesale
/// (last write wins); new keys are inserted. Run inside a transaction for
/// all-or-nothing semantics.
pub async fn merge<R: MergeRow>(
    conn: &mut SqliteConnection,
    rows: &[R],
) -> Result<MergeOutcome, SyncError> {
    let rows = dedupe_by_key(rows);
    if rows.is_empty() {
        return Ok(MergeOutcome {
            table: R::TABLE,
            ..Default::default()
        });
    }

    let mut columns: Vec<&str> = R::COLUMNS.to_vec();
    if R::STAMPED {
        columns.push("synced_at");
    }
    let synced_at = format_timestamp(chrono::Utc::now());
    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
    let on_conflict = upsert_clause::<R>();

    let mut affected = 0u64;
    let mut inserted = 0u64;
    for chunk in rows.chunks(rows_per_statement) {
        let existing = count_existing::<R>(conn, chunk).await?;
        inserted += chunk.len() as u64 - existing.min(chunk.len() as u64);

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", R::TABLE, columns.join(", ")));

        builder.push_values(chunk, |mut values, row| {
            row.bind_values(&mut values);
            if R::STAMPED {
                values.push_bind(synced_at.clone());
            }
        });
        builder.push(&on_conflict);

        affected += builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| SyncError::storage_with_op(e.to_string(), format!("merge {}", R::TABLE)))?
            .rows_affected();
    }

    Ok(MergeOutcome {
        table: R::TABLE,
        affected,
        inserted,
    })
}

async fn merge_all(conn: &mut SqliteConnection, batch: &RowBatch) -> Result<Vec<MergeOutcome>, SyncError> {
    let mut outcomes = Vec::new();

    if !batch.pull_requests.is_empty() {
        outcomes.push(merge(conn, &batch.pull_requests).await?);
    }
    if !batch.commits.is_empty() {
        outcomes.push(merge(conn, &batch.commits).await?);
    }
    if !batch.pr_commits.is_empty() {
        outcomes.push(merge(conn, &batch.pr_commits).await?);
    }
    if !batch.issues.is_empty() {
        outcomes.push(merge(conn, &batch.issues).await?);
    }
    if !batch.changelog.is_empty() {
        outcomes.push(merge(conn, &batch.changelog).await?);
    }

    Ok(outcomes)
}

/// Apply a pipeline's whole batch in one transaction, parents before children.
///
/// The transaction is opened with `BEGIN IMMEDIATE` so the write lock is
/// taken up front; a concurrent writer then waits out `busy_timeout`
/// instead of failing with `SQLITE_BUSY` on lock upgrade.
pub async fn apply_batch(pool: &DbPool, batch: &RowBatch) -> Result<Vec<MergeOutcome>, SyncError> {
    let mut conn = pool.acquire().await?;

    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(|e| SyncError::storage_with_op(e.to_string(), "begin merge"))?;

    let result = match merge_all(&mut *conn, batch).await {
        Ok(outcomes) => sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map(|_| outcomes)
            .map_err(|e| SyncError::storage_with_op(e.to_string(), "commit merge")),
        Err(e) => Err(e),
    };

    if result.is_err() {
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            log::warn!("Rollback after failed merge did not complete: {}", e);
        }
    }

    result
}
