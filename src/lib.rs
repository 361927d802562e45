//! Delivery Sync - incremental sync of delivery metrics into SQLite.
//!
//! Pulls pull requests, commits, Jira issues and their changelogs from
//! paginated REST APIs and merges them by natural key into a local store,
//! resuming each entity type from its last watermark.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod status;

pub use error::SyncError;
pub use services::sync_engine::{EntityReport, SyncEngine, SyncState, SyncSummary};
pub use status::StatusReport;

/// Process exit status for a finished run: 0 when every entity type is
/// done, 1 when any failed.
pub fn exit_code(summary: &SyncSummary) -> i32 {
    if summary.all_done() {
        0
    } else {
        1
    }
}

/// Exit status for configuration errors, raised before any pipeline starts.
pub const EXIT_CONFIG_ERROR: i32 = 2;
