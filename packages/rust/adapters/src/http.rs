//! Shared HTTP plumbing: client construction and error classification.

use std::time::Duration;

use courier_shared::{CourierError, Result};
use reqwest::{Client, Response, StatusCode};
use url::Url;

/// User-Agent sent on every outbound request.
const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Build the client used by every bundled adapter. `timeout` is a backstop;
/// the pipeline enforces its own per-call deadlines.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| CourierError::Network(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success status to the retryable or permanent error class.
///
/// 408, 425, 429 and 5xx are worth retrying; every other 4xx is not.
pub fn classify_status(url: &Url, status: StatusCode) -> CourierError {
    let transient = matches!(status.as_u16(), 408 | 425 | 429) || status.is_server_error();
    if transient {
        CourierError::Transient(format!("{url}: HTTP {status}"))
    } else {
        CourierError::Permanent(format!("{url}: HTTP {status}"))
    }
}

/// Map a transport-level failure. Timeouts and connection errors are retryable.
pub(crate) fn classify_send_error(url: &Url, err: reqwest::Error) -> CourierError {
    if err.is_timeout() {
        CourierError::Transient(format!("{url}: request timed out"))
    } else {
        CourierError::Network(format!("{url}: {err}"))
    }
}

/// Check the status and decode the JSON body. An empty body decodes to `null`.
pub(crate) async fn read_json(url: &Url, response: Response) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(url, status));
    }

    let body = response
        .text()
        .await
        .map_err(|e| CourierError::Network(format!("{url}: body read failed: {e}")))?;
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }

    // A success status with an unparseable body is the peer's bug, not ours to retry.
    serde_json::from_str(&body)
        .map_err(|e| CourierError::Permanent(format!("{url}: invalid JSON response: {e}")))
}

/// Parse a configured endpoint URL.
pub(crate) fn parse_endpoint(what: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| CourierError::config(format!("{what}: invalid url '{raw}': {e}")))
}
