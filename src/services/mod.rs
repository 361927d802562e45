//! Business logic services.
//!
//! This module contains the sync pipeline: source API clients, the
//! paginated fetcher, the record normalizer, the merge engine and the
//! orchestrator that drives them.
//!
//! Services depend only on the provider interface and the database pool,
//! so every stage can be tested against scripted sources.

pub mod fetcher;
pub mod github_client;
pub mod gitlab_client;
pub mod http;
pub mod jira_client;
pub mod merge;
pub mod normalizer;
pub mod provider;
pub mod sync_engine;

pub use github_client::GitHubClient;
pub use gitlab_client::GitLabClient;
pub use jira_client::JiraClient;
pub use provider::SourceProvider;
pub use sync_engine::SyncEngine;
