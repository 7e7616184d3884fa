//! Shared HTTP plumbing for model backends.
//!
//! Every backend call goes through [`post_json`], which maps transport
//! failures onto the [`RagError`] taxonomy:
//!
//! | Condition | Error |
//! |-----------|-------|
//! | timeout / connection refused / other send error | `BackendUnavailable` |
//! | HTTP 429 or 5xx | `BackendUnavailable` |
//! | other non-2xx | `BackendError` |
//! | body is not JSON | `BackendError` |

use std::time::Duration;

use crate::error::RagError;

/// Build a client whose every request fails after `timeout_secs`.
pub fn http_client(timeout_secs: u64) -> Result<reqwest::Client, RagError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::backend("http", e))
}

/// POST a JSON body and return the parsed JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    backend: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value, RagError> {
    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(body);
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            RagError::unavailable(backend, format!("request to {} timed out", url))
        } else {
            RagError::unavailable(backend, format!("cannot reach {}: {}", url, e))
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status, body_text);
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RagError::unavailable(backend, message));
        }
        return Err(RagError::backend(backend, message));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                RagError::unavailable(backend, format!("reading response from {} timed out", url))
            } else {
                RagError::backend(backend, format!("malformed response: {}", e))
            }
        })
}

/// Extract a non-empty string field (e.g. Ollama's `response`).
pub fn string_field(json: &serde_json::Value, field: &str, backend: &str) -> Result<String, RagError> {
    json.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| RagError::backend(backend, format!("response missing '{}' string", field)))
}

/// Trim a trailing slash so `{url}/api/...` joins cleanly.
pub fn base_url(url: &str) -> &str {
    url.trim_end_matches('/')
}
