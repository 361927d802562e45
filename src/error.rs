//! Error taxonomy for sync runs.
//!
//! These errors are serializable so a run summary can carry them as JSON.
//! Only `Config` is process-fatal; every other variant is scoped to the
//! pipeline of one entity type.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while fetching, merging or configuring a sync.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SyncError {
    /// Missing or invalid credentials or target identifiers. Never retried.
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
    },

    /// Network failure, timeout or 5xx response. Retried with backoff.
    #[error("Transient fetch error: {message}")]
    TransientFetch {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// The source asked us to slow down until `reset_after_ms` has elapsed.
    #[error("Rate limited on {endpoint}, reset in {reset_after_ms}ms")]
    RateLimited { reset_after_ms: u64, endpoint: String },

    /// 4xx response other than a rate limit, or an undecodable body.
    #[error("Permanent fetch error: {message}")]
    PermanentFetch {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Merge, transaction or watermark write failed.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// The run was cancelled at a pipeline state boundary.
    #[error("Cancelled before {stage}")]
    Cancelled { stage: String },
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Create a configuration error naming the missing fields.
    pub fn missing_fields(fields: Vec<String>) -> Self {
        Self::Config {
            message: format!("missing required configuration: {}", fields.join(", ")),
            fields,
        }
    }

    /// Create a transient fetch error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFetch {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a transient fetch error with status code and endpoint.
    pub fn transient_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::TransientFetch {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a rate-limit signal.
    pub fn rate_limited(reset_after: Duration, endpoint: impl Into<String>) -> Self {
        Self::RateLimited {
            reset_after_ms: reset_after.as_millis() as u64,
            endpoint: endpoint.into(),
        }
    }

    /// Create a permanent fetch error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFetch {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a permanent fetch error with status code and endpoint.
    pub fn permanent_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::PermanentFetch {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a storage error with operation context.
    pub fn storage_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a cancellation error for the stage that was about to start.
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// Whether the fetcher should retry the same request with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }

    /// Whether this is a configuration error (aborts the whole process).
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Wait requested by a rate-limit signal, if this is one.
    pub fn rate_limit_reset(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { reset_after_ms, .. } => Some(Duration::from_millis(*reset_after_ms)),
            _ => None,
        }
    }
}

// Conversions from common error types

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transient("Request timed out")
        } else if err.is_connect() {
            Self::transient("Failed to connect to server")
        } else if err.is_decode() {
            Self::permanent(format!("Failed to decode response: {}", err))
        } else if err.is_builder() {
            Self::config(format!("Invalid request: {}", err))
        } else {
            Self::transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for SyncError {
    fn from(err: crate::db::DbError) -> Self {
        Self::storage(err.to_string())
    }
}
