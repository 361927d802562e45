//! Data models for the delivery metrics store.
//!
//! Row types mirror the tables created by the initial migration and derive
//! FromRow for SQLx queries and Serialize for JSON output.

pub mod commit;
pub mod entity;
pub mod issue;
pub mod pull_request;
pub mod watermark;

// Re-exports for convenient access
pub use commit::{CommitRow, PrCommitLinkRow};
pub use entity::{EntityType, ListingOrder};
pub use issue::{ChangelogRow, IssueRow};
pub use pull_request::PullRequestRow;
pub use watermark::Watermark;
