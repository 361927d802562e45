//! HTTP plumbing shared by the provider clients.
//!
//! Builds authenticated `reqwest` clients and turns responses into either a
//! decoded JSON body or a classified [`SyncError`]: rate limit, transient
//! (5xx) or permanent (other 4xx, undecodable body).

use crate::error::SyncError;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Wait used when a rate-limit response carries no reset information.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Values above this are epoch seconds rather than a delta.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// Credentials attached to every request of a client.
#[derive(Clone)]
pub enum Auth {
    /// `Authorization: Bearer <token>` (GitHub).
    Bearer(String),
    /// `PRIVATE-TOKEN: <token>` (GitLab).
    PrivateToken(String),
    /// `Authorization: Basic base64(user:token)` (Jira Cloud).
    Basic { user: String, token: String },
    /// Anonymous access.
    None,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secrets
        match self {
            Self::Bearer(_) => write!(f, "Bearer(***)"),
            Self::PrivateToken(_) => write!(f, "PrivateToken(***)"),
            Self::Basic { user, .. } => write!(f, "Basic({}, ***)", user),
            Self::None => write!(f, "None"),
        }
    }
}

/// Build an HTTP client with default auth headers and a per-request timeout.
pub fn build_client(auth: &Auth, timeout: Duration) -> Result<Client, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    let invalid = |_| SyncError::config("Invalid token format");
    match auth {
        Auth::Bearer(token) => {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(invalid)?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Auth::PrivateToken(token) => {
            headers.insert("PRIVATE-TOKEN", HeaderValue::from_str(token).map_err(invalid)?);
        }
        Auth::Basic { user, token } => {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, token));
            let value = HeaderValue::from_str(&format!("Basic {}", encoded)).map_err(invalid)?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Auth::None => {}
    }

    Client::builder()
        .default_headers(headers)
        .user_agent(concat!("delivery-sync/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::config(format!("Failed to build HTTP client: {}", e)))
}

/// Whether a response is a rate-limit signal.
///
/// 429 always is; GitHub also answers 403 with `x-ratelimit-remaining: 0`
/// when the primary quota is exhausted.
pub fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }

    status == StatusCode::FORBIDDEN
        && header_str(headers, "x-ratelimit-remaining").map(str::trim) == Some("0")
}

/// Time until the rate limit resets, from response headers.
///
/// Reads `Retry-After` (delta seconds), then `x-ratelimit-reset` and
/// `ratelimit-reset`, which may hold either epoch seconds or a delta.
pub fn rate_limit_reset(headers: &HeaderMap, now_epoch_secs: i64) -> Option<Duration> {
    let parse = |name: &str| -> Option<u64> { header_str(headers, name)?.trim().parse().ok() };

    if let Some(secs) = parse("retry-after") {
        return Some(Duration::from_secs(secs));
    }

    let value = parse("x-ratelimit-reset").or_else(|| parse("ratelimit-reset"))?;
    if value > EPOCH_THRESHOLD {
        let remaining = value as i64 - now_epoch_secs;
        Some(Duration::from_secs(remaining.max(0) as u64))
    } else {
        Some(Duration::from_secs(value))
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract a human-readable message from an error body.
///
/// GitHub and GitLab return `{"message": ...}` (sometimes an object);
/// Jira returns `{"errorMessages": [...]}`.
fn body_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;

    if let Some(message) = value.get("message").or_else(|| value.get("error")) {
        return Some(match message.as_str() {
            Some(s) => s.to_string(),
            None => message.to_string(),
        });
    }

    value
        .get("errorMessages")
        .and_then(Value::as_array)
        .filter(|messages| !messages.is_empty())
        .map(|messages| {
            messages
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
}

/// Classify a response and decode its JSON body.
///
/// Returns the body together with the response headers, which providers
/// need for pagination.
pub async fn read_json(response: Response, endpoint: &str) -> Result<(Value, HeaderMap), SyncError> {
    let status = response.status();
    let headers = response.headers().clone();

    if status.is_success() {
        let bytes = response.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::permanent_full(
                format!("Failed to parse response: {}", e),
                status.as_u16(),
                endpoint,
            )
        })?;
        return Ok((body, headers));
    }

    if is_rate_limited(status, &headers) {
        let reset = rate_limit_reset(&headers, chrono::Utc::now().timestamp())
            .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
        return Err(SyncError::rate_limited(reset, endpoint));
    }

    let status_code = status.as_u16();
    let (body, detail) = match response.text().await {
        Ok(body) => {
            let detail = body_message(&body);
            (body, detail)
        }
        Err(e) => {
            log::debug!("Could not read error body from {}: {}", endpoint, e);
            let detail = format!("Status {} with unreadable body: {}", status_code, e);
            (String::new(), Some(detail))
        }
    };

    if status.is_server_error() {
        let message = detail.unwrap_or_else(|| format!("Server error ({})", status_code));
        return Err(SyncError::transient_full(message, status_code, endpoint));
    }

    let message = match (status, detail) {
        (StatusCode::UNAUTHORIZED, _) => "Credentials rejected by the source".to_string(),
        (StatusCode::FORBIDDEN, None) => "Access denied".to_string(),
        (StatusCode::NOT_FOUND, None) => "Resource not found".to_string(),
        (_, Some(msg)) => msg,
        _ => format!("Request failed ({}): {}", status_code, body),
    };

    Err(SyncError::permanent_full(message, status_code, endpoint))
}

/// Send a GET request and classify the response.
pub async fn get_json(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    endpoint: &str,
) -> Result<(Value, HeaderMap), SyncError> {
    log::debug!("GET {} {:?}", url, query);
    let response = client.get(url).query(query).send().await?;
    read_json(response, endpoint).await
}

/// Unwrap a JSON array body into its records.
pub fn into_records(body: Value, endpoint: &str) -> Result<Vec<Value>, SyncError> {
    match body {
        Value::Array(records) => Ok(records),
        other => Err(SyncError::permanent(format!(
            "Expected a JSON array from {}, got {}",
            endpoint,
            match other {
                Value::Object(_) => "an object",
                _ => "a scalar",
            }
        ))),
    }
}
