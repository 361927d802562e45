//! Command-line configuration.
//!
//! One subcommand per source. Required values may come from flags or the
//! environment; they are declared optional here so that `validate` can
//! report every missing field in one error instead of clap stopping at the
//! first one.

use crate::db::DEFAULT_DB_FILE;
use crate::error::SyncError;
use crate::services::fetcher::{FetchPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_RATE_LIMIT_WAITS};
use crate::services::github_client::GitHubClientConfig;
use crate::services::gitlab_client::GitLabClientConfig;
use crate::services::jira_client::{JiraApiVersion, JiraClientConfig};
use crate::services::{GitHubClient, GitLabClient, JiraClient, SourceProvider};
use clap::{Args, Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "delivery-sync")]
#[command(about = "Incrementally sync pull requests, commits and Jira issues into SQLite")]
#[command(long_about = None)]
pub struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "DELIVERY_SYNC_DB", default_value = DEFAULT_DB_FILE)]
    pub db: PathBuf,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Attempts per page request on transient failures
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: usize,

    /// Longest single wait for a rate-limit reset, in seconds
    #[arg(long, global = true, default_value_t = 900)]
    pub max_rate_limit_wait_secs: u64,

    /// Rate-limit waits per page request before the entity type fails
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_RATE_LIMIT_WAITS)]
    pub max_rate_limit_waits: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sync pull requests and their commits from GitHub
    Github(GitHubArgs),

    /// Sync merge requests and their commits from GitLab
    Gitlab(GitLabArgs),

    /// Sync issues and their changelogs from Jira
    Jira(JiraArgs),

    /// Show stored watermarks and recent sync runs
    Status {
        /// Number of sync log entries to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct GitHubArgs {
    /// Repository as OWNER/NAME
    #[arg(long)]
    pub repo: Option<String>,

    /// API token
    #[arg(long, env = "GITHUB_API_KEY", hide_env_values = true)]
    pub token: Option<String>,

    /// API root, for GitHub Enterprise Server
    #[arg(long, default_value = "https://api.github.com")]
    pub api_url: String,
}

#[derive(Debug, Clone, Default, Args)]
pub struct GitLabArgs {
    /// Project id or full path (group/project)
    #[arg(long)]
    pub project: Option<String>,

    /// Personal access token
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Instance URL
    #[arg(long, default_value = "https://gitlab.com")]
    pub base_url: String,
}

#[derive(Debug, Clone, Args)]
pub struct JiraArgs {
    /// Site URL (e.g., https://acme.atlassian.net)
    #[arg(long, env = "JIRA_BASE_URL")]
    pub base_url: Option<String>,

    /// Project key
    #[arg(long, env = "JIRA_PROJECT_KEY")]
    pub project: Option<String>,

    /// Account email for basic auth
    #[arg(long, env = "JIRA_EMAIL")]
    pub email: Option<String>,

    /// API token for basic auth
    #[arg(long, env = "JIRA_AUTH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// REST API version (2 or 3)
    #[arg(long, default_value = "2")]
    pub api_version: JiraApiVersion,
}

impl Default for JiraArgs {
    fn default() -> Self {
        Self {
            base_url: None,
            project: None,
            email: None,
            token: None,
            api_version: JiraApiVersion::V2,
        }
    }
}

/// Validated configuration of one source.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    GitHub(GitHubClientConfig),
    GitLab(GitLabClientConfig),
    Jira(JiraClientConfig),
}

impl SourceConfig {
    /// Build the provider for this source.
    pub fn into_provider(self) -> Result<Box<dyn SourceProvider>, SyncError> {
        Ok(match self {
            Self::GitHub(config) => Box::new(GitHubClient::new(config)?),
            Self::GitLab(config) => Box::new(GitLabClient::new(config)?),
            Self::Jira(config) => Box::new(JiraClient::new(config)?),
        })
    }
}

impl Cli {
    /// Retry and rate-limit policy from the global flags.
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_attempts: self.max_attempts.max(1),
            max_rate_limit_wait: Duration::from_secs(self.max_rate_limit_wait_secs),
            max_rate_limit_waits: self.max_rate_limit_waits,
            ..Default::default()
        }
    }

    /// Validated source configuration; `None` for commands that do not sync.
    pub fn source_config(&self) -> Result<Option<SourceConfig>, SyncError> {
        let config = match &self.command {
            Command::Github(args) => SourceConfig::GitHub(args.validate(self.timeout_secs)?),
            Command::Gitlab(args) => SourceConfig::GitLab(args.validate(self.timeout_secs)?),
            Command::Jira(args) => SourceConfig::Jira(args.validate(self.timeout_secs)?),
            Command::Status { .. } => return Ok(None),
        };

        Ok(Some(config))
    }
}

/// Collects missing required values so they can be reported together.
#[derive(Default)]
struct Required {
    missing: Vec<String>,
}

impl Required {
    /// Trimmed value of a required field; blank counts as missing.
    fn take(&mut self, name: &str, value: &Option<String>) -> String {
        match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => v.to_string(),
            None => {
                self.missing.push(name.to_string());
                String::new()
            }
        }
    }

    fn finish(self) -> Result<(), SyncError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::missing_fields(self.missing))
        }
    }
}

fn check_url(name: &str, url: &str) -> Result<(), SyncError> {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(SyncError::config(format!("{} is not a valid http(s) URL: {}", name, url))),
    }
}

impl GitHubArgs {
    pub fn validate(&self, timeout_secs: u64) -> Result<GitHubClientConfig, SyncError> {
        let mut required = Required::default();
        let repo = required.take("repo", &self.repo);
        let token = required.take("token (GITHUB_API_KEY)", &self.token);
        required.finish()?;

        match repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {}
            _ => {
                return Err(SyncError::config(format!(
                    "repo must be OWNER/NAME, got '{}'",
                    repo
                )))
            }
        }
        check_url("api-url", &self.api_url)?;

        Ok(GitHubClientConfig {
            api_url: self.api_url.clone(),
            token,
            repo,
            timeout_secs,
            ..Default::default()
        })
    }
}

impl GitLabArgs {
    pub fn validate(&self, timeout_secs: u64) -> Result<GitLabClientConfig, SyncError> {
        let mut required = Required::default();
        let project = required.take("project", &self.project);
        let token = required.take("token (GITLAB_TOKEN)", &self.token);
        required.finish()?;
        check_url("base-url", &self.base_url)?;

        Ok(GitLabClientConfig {
            base_url: self.base_url.clone(),
            token,
            project,
            timeout_secs,
            ..Default::default()
        })
    }
}

impl JiraArgs {
    pub fn validate(&self, timeout_secs: u64) -> Result<JiraClientConfig, SyncError> {
        let mut required = Required::default();
        let base_url = required.take("base-url (JIRA_BASE_URL)", &self.base_url);
        let project_key = required.take("project (JIRA_PROJECT_KEY)", &self.project);

        // Credentials are optional, but only as a pair
        let email = self.email.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let token = self.token.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let credentials = match (email, token) {
            (Some(email), Some(token)) => Some((email.to_string(), token.to_string())),
            (None, None) => None,
            (Some(_), None) => {
                required.missing.push("token (JIRA_AUTH_TOKEN)".to_string());
                None
            }
            (None, Some(_)) => {
                required.missing.push("email (JIRA_EMAIL)".to_string());
                None
            }
        };
        required.finish()?;
        check_url("base-url", &base_url)?;

        Ok(JiraClientConfig {
            base_url,
            project_key,
            credentials,
            api_version: self.api_version,
            timeout_secs,
            ..Default::default()
        })
    }
}
