//! Store status: stored watermarks and the most recent sync runs.

use crate::db::pool::DbPool;
use crate::db::sync_log::{self, SyncLogEntry};
use crate::db::watermarks::{self, WatermarkRecord};
use crate::error::SyncError;
use serde::Serialize;
use std::fmt::Write;

/// What `delivery-sync status` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub watermarks: Vec<WatermarkRecord>,
    /// Newest first.
    pub recent_runs: Vec<SyncLogEntry>,
}

impl StatusReport {
    /// Read every watermark and the last `limit` sync log entries.
    pub async fn load(pool: &DbPool, limit: i64) -> Result<Self, SyncError> {
        Ok(Self {
            watermarks: watermarks::list_watermarks(pool, None).await?,
            recent_runs: sync_log::get_sync_log(pool, limit).await?,
        })
    }

    /// Plain-text rendering, one line per watermark and per run.
    pub fn render(&self) -> String {
        let mut out = String::from("Watermarks\n");
        if self.watermarks.is_empty() {
            out.push_str("  (none)\n");
        }
        for mark in &self.watermarks {
            let _ = writeln!(
                out,
                "  {:<8} {:<24} {:<16} {}",
                mark.source, mark.scope, mark.entity_type, mark.watermark
            );
        }

        out.push_str("Recent runs\n");
        if self.recent_runs.is_empty() {
            out.push_str("  (none)\n");
        }
        for entry in &self.recent_runs {
            let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  {} {:<8} {:<24} {:<16} {:<6} fetched {:>5} merged {:>5} {}",
                when,
                entry.source,
                entry.scope,
                entry.entity_type,
                entry.status,
                entry.rows_fetched,
                entry.rows_merged,
                entry.message.as_deref().unwrap_or("")
            );
        }
        out
    }
}
