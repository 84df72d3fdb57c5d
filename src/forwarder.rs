//! Upstream request forwarding with bounded retries.
//!
//! A try that yields any HTTP response is final, whatever the status code:
//! backends stream token output, and re-issuing a request whose response
//! has already begun would bill the backend twice and could emit duplicate
//! tokens to the client. Retries therefore cover only the cases where no
//! response was received at all: transport errors and per-attempt
//! deadline expiry.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::Backend;

/// Issues the upstream request with up to `attempts` total tries, each
/// under a fresh `per_attempt_timeout` deadline. Returns the first
/// response received, or `None` once every try failed to produce one.
///
/// The deadline covers connection and response headers only; the body is
/// handed back as a stream and is never bounded here.
#[allow(clippy::too_many_arguments)]
pub async fn forward(
    client: &Client,
    backend: &Backend,
    method: Method,
    path: &str,
    query: &[(String, String)],
    body: &Value,
    headers: HeaderMap,
    attempts: u32,
    per_attempt_timeout: Duration,
) -> Option<Response> {
    let url = format!("{}{}", backend.url, path);

    let mut request = client.request(method.clone(), &url).headers(headers);
    if !query.is_empty() {
        request = request.query(&query);
    }
    if is_body_bearing(&method) && !is_empty_body(body) {
        // Sets `Content-Type: application/json` unless the client already
        // supplied one.
        request = request.json(body);
    }

    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let Some(request) = request.try_clone() else {
            warn!(backend = %backend.name, "Upstream request is not retryable");
            return None;
        };

        match timeout(per_attempt_timeout, request.send()).await {
            Ok(Ok(response)) => {
                debug!(
                    backend = %backend.name,
                    status = %response.status(),
                    attempt,
                    "Upstream responded"
                );
                return Some(response);
            }
            Ok(Err(e)) => {
                warn!(backend = %backend.name, attempt, error = %e, "Upstream transport error");
            }
            Err(_) => {
                warn!(
                    backend = %backend.name,
                    attempt,
                    deadline_secs = per_attempt_timeout.as_secs(),
                    "Upstream attempt timed out"
                );
            }
        }
    }

    warn!(backend = %backend.name, attempts, "All forward attempts exhausted");
    None
}

fn is_body_bearing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// "Empty" follows the original wire behavior: an absent or empty JSON
/// object means no upstream body at all, not an empty `{}` payload.
pub(crate) fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
