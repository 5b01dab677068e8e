//! Shared REST plumbing for the workspace clients.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` to avoid
//! blocking the async runtime. Non-2xx responses come back as
//! [`HttpError::Status`] so each client can map them onto its own slice of
//! the error taxonomy.

use std::time::Duration;

use dqstudio_core::Credential;
use serde_json::Value;

/// Low-level failure of one REST call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection, TLS or timeout failure before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body was not the JSON we expected.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl HttpError {
    /// 429 and 5xx responses and transport failures.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Status { status, .. } => *status == 429 || *status >= 500,
            HttpError::Transport(_) => true,
            HttpError::Decode(_) => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, HttpError::Status { status: 401 | 403, .. })
    }
}

/// A JSON-over-HTTPS client bound to one workspace host.
#[derive(Clone)]
pub struct HttpClient {
    base_url: String,
    timeout: Duration,
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        HttpClient {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            timeout,
            agent: config.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whole-request timeout applied to every call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URL for an API path such as `/api/2.1/jobs/run-now`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json(&self, path: &str, credential: &Credential) -> Result<Value, HttpError> {
        self.send(path, None, credential).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: Value,
        credential: &Credential,
    ) -> Result<Value, HttpError> {
        self.send(path, Some(body), credential).await
    }

    async fn send(
        &self,
        path: &str,
        body: Option<Value>,
        credential: &Credential,
    ) -> Result<Value, HttpError> {
        let agent = self.agent.clone();
        let url = self.url(path);
        let authorization = credential.bearer_header();

        tokio::task::spawn_blocking(move || {
            let response = match body {
                Some(body) => agent
                    .post(&url)
                    .header("Authorization", &authorization)
                    .send_json(&body),
                None => agent.get(&url).header("Authorization", &authorization).call(),
            }
            .map_err(|e| HttpError::Transport(e.to_string()))?;

            let status = response.status().as_u16();
            let text = response
                .into_body()
                .read_to_string()
                .map_err(|e| HttpError::Decode(format!("failed to read body: {e}")))?;

            if !(200..300).contains(&status) {
                return Err(HttpError::Status {
                    status,
                    message: error_message(&text),
                });
            }
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text)
                .map_err(|e| HttpError::Decode(format!("{e}: {}", truncate(&text, 200))))
        })
        .await
        .map_err(|e| HttpError::Transport(format!("task join error: {e}")))?
    }
}

/// Pull `message` out of a `{"error_code": ..., "message": ...}` body, or
/// fall back to the raw text.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate(body.trim(), 200))
}

/// Truncate a string for error messages.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
